//! Cron scheduler.
//!
//! Evaluates a fixed set of schedule entries once per minute boundary and
//! enqueues a job for each entry whose cron expression matches. Firing is
//! at most once per entry per matching minute, and minutes that pass while the
//! process is down are not backfilled.

pub mod cron;

use log::{error, info};

use crate::models::job::EnqueueRequest;
use crate::models::Result;
use crate::producer::Producer;
use crate::scheduler::cron::CronExpr;

pub struct ScheduleEntry {
    pub cron: CronExpr,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
}

pub struct Scheduler {
    producer: Producer,
    entries: Vec<ScheduleEntry>,
    last_fired_minute: Option<i64>,
}

impl Scheduler {
    pub fn new(producer: Producer, entries: Vec<ScheduleEntry>) -> Self {
        Self {
            producer,
            entries,
            last_fired_minute: None,
        }
    }

    /// Entries whose cron expression fires in the minute containing `at`.
    pub fn due_entries(&self, at: chrono::DateTime<chrono::Utc>) -> Vec<&ScheduleEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.cron.matches(at))
            .collect()
    }

    /// Enqueue a job for every entry due in the minute containing `at`.
    /// Firing twice within the same minute is a no-op. An entry that fails to
    /// enqueue is logged and skipped rather than holding up the others.
    pub async fn fire_due(&mut self, at: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let minute = at.timestamp_millis() / 60_000;
        if self.last_fired_minute == Some(minute) {
            return Ok(0);
        }
        self.last_fired_minute = Some(minute);

        let mut fired = 0;
        for entry in self.entries.iter().filter(|e| e.cron.matches(at)) {
            let req = EnqueueRequest::new(entry.name.clone(), entry.payload.clone());
            match self.producer.enqueue(&entry.queue, req).await {
                Ok(handle) => {
                    info!(
                        "Schedule '{}' ({}) fired as [{}:{}]",
                        &entry.name, &entry.cron, &entry.queue, handle.id
                    );
                    fired += 1;
                }
                Err(err) => {
                    error!("Schedule '{}' failed to enqueue: {}", &entry.name, err);
                }
            }
        }
        Ok(fired)
    }

    /// Run the scheduler in the background, firing at each minute boundary,
    /// until the returned task is aborted.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if self.entries.is_empty() {
                return;
            }
            info!("Starting cron scheduler with {} entries", self.entries.len());
            loop {
                let now = chrono::Utc::now();
                let millis_into_minute = now.timestamp_millis().rem_euclid(60_000) as u64;
                tokio::time::sleep(std::time::Duration::from_millis(
                    60_000 - millis_into_minute,
                ))
                .await;

                let tick = chrono::Utc::now();
                if let Err(err) = self.fire_due(tick).await {
                    error!("Cron scheduler tick failed: {}", err);
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::TimeZone;

    use crate::models::queue;
    use crate::registry::QueueRegistry;
    use crate::store::{JobStore, MemoryStore};

    fn entry(cron: &str, queue: &str, name: &str) -> ScheduleEntry {
        ScheduleEntry {
            cron: cron.parse().unwrap(),
            queue: queue.to_owned(),
            name: name.to_owned(),
            payload: serde_json::Value::Null,
        }
    }

    async fn scheduler(entries: Vec<ScheduleEntry>) -> (Arc<QueueRegistry>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert(queue::names::CRON.to_owned(), queue::Settings::default());
        let registry = Arc::new(QueueRegistry::new(store, queues).await.unwrap());
        let producer = Producer::new(registry.clone());
        (registry, Scheduler::new(producer, entries))
    }

    #[tokio::test]
    async fn due_entries_filter_by_minute() {
        let (_, scheduler) = scheduler(vec![
            entry("*/5 * * * *", "cron", "warm-up-cache"),
            entry("30 3 * * *", "cron", "session-cleanup"),
        ])
        .await;

        let at = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 3, 30, 0).unwrap();
        let due: Vec<&str> = scheduler.due_entries(at).iter().map(|e| e.name.as_str()).collect();
        assert_eq!(due, vec!["warm-up-cache", "session-cleanup"]);

        let at = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 3, 31, 0).unwrap();
        assert!(scheduler.due_entries(at).is_empty());
    }

    #[tokio::test]
    async fn fires_at_most_once_per_minute() {
        let (registry, mut scheduler) =
            scheduler(vec![entry("* * * * *", "cron", "warm-up-cache")]).await;

        let at = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 5).unwrap();
        assert_eq!(scheduler.fire_due(at).await.unwrap(), 1);

        // second tick in the same minute is a no-op
        let again = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 40).unwrap();
        assert_eq!(scheduler.fire_due(again).await.unwrap(), 0);

        let next = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 12, 1, 0).unwrap();
        assert_eq!(scheduler.fire_due(next).await.unwrap(), 1);

        assert_eq!(registry.store().queue_size(queue::names::CRON).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn bad_entry_does_not_block_others() {
        let (registry, mut scheduler) = scheduler(vec![
            entry("* * * * *", "no-such-queue", "broken"),
            entry("* * * * *", "cron", "warm-up-cache"),
        ])
        .await;

        let at = chrono::Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(scheduler.fire_due(at).await.unwrap(), 1);
        assert_eq!(registry.store().queue_size(queue::names::CRON).await.unwrap(), 1);
    }
}
