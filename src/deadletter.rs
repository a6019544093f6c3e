//! Dead-letter routing and replay.
//!
//! When a job exhausts its attempts, a copy of it is enqueued on the
//! `dead_letter` queue and the original is marked dead-lettered. The copy keeps
//! the failed payload and records the queue it came from, so an operator can
//! inspect it and replay it back onto its original queue as a fresh job.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::models::event::EventKind;
use crate::models::job::{EnqueueRequest, JobHandle, JobRecord, State};
use crate::models::{queue, Error, Result};
use crate::registry::QueueRegistry;
use crate::store::JobStore;

#[derive(Clone)]
pub struct DeadLetterRouter {
    registry: Arc<QueueRegistry>,
}

impl DeadLetterRouter {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    /// Copy a failed job onto the dead-letter queue and mark the original
    /// dead-lettered. The copy is a new waiting job carrying the original's
    /// name, payload, and source queue.
    pub async fn route(&self, failed: &JobRecord) -> Result<JobHandle> {
        let store = self.registry.store();
        let req = EnqueueRequest::new(failed.name.clone(), failed.payload.clone());
        let copy = store
            .enqueue(queue::names::DEAD_LETTER, &req, Some(&failed.queue))
            .await?;
        self.registry
            .events(queue::names::DEAD_LETTER)?
            .emit(EventKind::Waiting, copy.id);
        store.mark_dead_lettered(failed.id).await?;
        info!(
            "[{}:{}] dead-lettered as [{}:{}]: {}",
            &failed.queue,
            failed.id,
            queue::names::DEAD_LETTER,
            copy.id,
            failed.failed_reason.as_deref().unwrap_or("unknown reason")
        );
        Ok(JobHandle { id: copy.id })
    }

    /// Re-enqueue a dead-letter copy onto the queue it originally failed on, as
    /// a fresh job with a reset attempt counter. The copy itself is left on the
    /// dead-letter queue for the retention sweep to evict.
    pub async fn replay(&self, job_id: u64) -> Result<JobHandle> {
        let store = self.registry.store();
        let copy = store.job(job_id).await?;
        if copy.queue != queue::names::DEAD_LETTER {
            return Err(Error::bad_request(format!(
                "Job {} is not on the dead-letter queue",
                job_id
            )));
        }
        let original_queue = copy.original_queue.as_deref().ok_or_else(|| {
            Error::bad_request(format!("Job {} has no originating queue recorded", job_id))
        })?;
        // the originating queue may have been dropped from the config since
        self.registry.queue(original_queue)?;

        let req = EnqueueRequest::new(copy.name.clone(), copy.payload.clone());
        let replayed = store.enqueue(original_queue, &req, None).await?;
        self.registry
            .events(original_queue)?
            .emit(EventKind::Waiting, replayed.id);
        info!(
            "[{}:{}] replayed onto '{}' as job {}",
            queue::names::DEAD_LETTER,
            job_id,
            original_queue,
            replayed.id
        );
        Ok(JobHandle { id: replayed.id })
    }

    /// Job ids on the dead-letter queue, grouped by state.
    pub async fn jobs(&self) -> Result<HashMap<State, Vec<u64>>> {
        self.registry
            .store()
            .queue_job_ids(queue::names::DEAD_LETTER)
            .await
    }
}
