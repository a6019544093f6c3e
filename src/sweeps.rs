//! Background maintenance sweeps.
//!
//! Two periodic tasks keep the queues healthy: the stall sweep recovers jobs
//! whose worker died mid-execution, and the retention sweep evicts terminal
//! jobs past their queue's retention age. Both run on fixed intervals and are
//! safe to run concurrently with workers, since every transition goes through
//! the store's compare-and-swap operations.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::deadletter::DeadLetterRouter;
use crate::models::event::EventKind;
use crate::models::job::State;
use crate::models::{Duration, Result};
use crate::registry::QueueRegistry;
use crate::store::JobStore;

/// Recover jobs stuck active past their queue's stall timeout. Each recovered
/// job gets a `stalled` event; jobs whose attempts are now exhausted are failed
/// and routed to the dead-letter queue, the rest are requeued. Returns the
/// number of jobs recovered.
pub async fn run_stall_sweep(
    registry: &Arc<QueueRegistry>,
    router: &DeadLetterRouter,
) -> Result<u64> {
    let swept = registry.store().sweep_stalled().await?;
    let recovered = swept.len() as u64;
    for record in swept {
        if let Ok(events) = registry.events(&record.queue) {
            events.emit(EventKind::Stalled, record.id);
        }
        match record.state {
            State::Waiting => warn!(
                "[{}:{}] stalled, requeued (attempt {}/{})",
                &record.queue, record.id, record.attempts_made, record.max_attempts
            ),
            State::Failed => {
                warn!(
                    "[{}:{}] stalled with attempts exhausted, dead-lettering",
                    &record.queue, record.id
                );
                if let Ok(events) = registry.events(&record.queue) {
                    events.emit(EventKind::Failed, record.id);
                }
                router.route(&record).await?;
            }
            _ => (),
        }
    }
    Ok(recovered)
}

/// Evict terminal jobs past their queue's retention age. Returns the number of
/// jobs evicted.
pub async fn run_retention_sweep(registry: &Arc<QueueRegistry>) -> Result<u64> {
    let evicted = registry.store().sweep_expired().await?;
    if !evicted.is_empty() {
        info!("Evicted {} expired job(s)", evicted.len());
    }
    Ok(evicted.len() as u64)
}

/// Start both sweeps as background tasks running until aborted.
pub fn start_sweeps(
    registry: Arc<QueueRegistry>,
    router: DeadLetterRouter,
    stall_interval: Duration,
    retention_interval: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    info!(
        "Starting background sweeps, stall check every {}, retention check every {}",
        stall_interval, retention_interval
    );

    let stall_registry = Arc::clone(&registry);
    let stall = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stall_interval.into());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            debug!("Checking for stalled jobs");
            if let Err(err) = run_stall_sweep(&stall_registry, &router).await {
                error!("Stall sweep failed: {}", err);
            }
        }
    });

    let retention = tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention_interval.into());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            debug!("Checking for expired jobs");
            if let Err(err) = run_retention_sweep(&registry).await {
                error!("Retention sweep failed: {}", err);
            }
        }
    });

    vec![stall, retention]
}
