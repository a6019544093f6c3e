//! In-memory storage backend.
//!
//! Implements the same state machine as the Redis backend behind a single mutex,
//! which trivially gives the same atomicity guarantees. Used for embedding the
//! queue in a single process and throughout the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::job::{EnqueueRequest, JobRecord, State};
use crate::models::{queue, DateTime, Duration, Error, JobStats, QueueInfo, Result, ServerInfo};
use crate::store::JobStore;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_job_id: u64,
    jobs: HashMap<u64, JobRecord>,
    queues: BTreeMap<String, QueueState>,
    stats: JobStats,
}

#[derive(Default)]
struct QueueState {
    settings: queue::Settings,

    /// Waiting jobs (including delayed ones), ordered so that the highest
    /// priority job with the lowest ID comes first.
    waiting: BTreeSet<(i64, u64)>,
}

/// Claim order within a queue: highest priority first, then FIFO by job ID.
fn claim_rank(priority: i32, job_id: u64) -> (i64, u64) {
    (-i64::from(priority), job_id)
}

fn elapsed_millis(now: &DateTime, since: &DateTime) -> i64 {
    now.timestamp_millis() - since.timestamp_millis()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchQueue(name.to_owned()))
    }

    fn job_mut(&mut self, job_id: u64) -> Result<&mut JobRecord> {
        self.jobs.get_mut(&job_id).ok_or(Error::NoSuchJob(job_id))
    }

    /// Fetch a job and check it is in the state the transition expects.
    fn job_in_state(&mut self, job_id: u64, expected: State) -> Result<&mut JobRecord> {
        let job = self.job_mut(job_id)?;
        if job.state != expected {
            return Err(Error::conflict(format!(
                "Job {} is {}, expected {}",
                job_id, job.state, expected
            )));
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn register_queue(&self, name: &str, settings: &queue::Settings) -> Result<bool> {
        if !queue::is_valid_name(name) {
            return Err(Error::bad_request(format!("Invalid queue name: {}", name)));
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.queues.get_mut(name) {
            Some(queue_state) => {
                queue_state.settings = settings.clone();
                Ok(false)
            }
            None => {
                inner.queues.insert(
                    name.to_owned(),
                    QueueState {
                        settings: settings.clone(),
                        waiting: BTreeSet::new(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.keys().cloned().collect())
    }

    async fn queue_settings(&self, name: &str) -> Result<queue::Settings> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(name)
            .map(|q| q.settings.clone())
            .ok_or_else(|| Error::NoSuchQueue(name.to_owned()))
    }

    async fn queue_size(&self, name: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(name)
            .map(|q| q.waiting.len() as u64)
            .ok_or_else(|| Error::NoSuchQueue(name.to_owned()))
    }

    async fn enqueue(
        &self,
        queue: &str,
        req: &EnqueueRequest,
        original_queue: Option<&str>,
    ) -> Result<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let max_attempts = {
            let queue_state = inner.queue_mut(queue)?;
            req.max_attempts.unwrap_or(queue_state.settings.max_attempts)
        };

        inner.next_job_id += 1;
        let job_id = inner.next_job_id;
        let now = DateTime::now();
        let priority = req.priority.unwrap_or(0);
        let record = JobRecord {
            id: job_id,
            queue: queue.to_owned(),
            name: req.name.clone(),
            payload: req.payload.clone(),
            attempts_made: 0,
            max_attempts,
            state: State::Waiting,
            created_at: now,
            available_at: match req.delay {
                Some(delay) => now.plus(delay),
                None => now,
            },
            priority,
            started_at: None,
            processed_at: None,
            failed_reason: None,
            original_queue: original_queue.map(str::to_owned),
        };

        inner.jobs.insert(job_id, record.clone());
        inner
            .queue_mut(queue)?
            .waiting
            .insert(claim_rank(priority, job_id));
        inner.stats.total_jobs_created += 1;
        Ok(record)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let now = DateTime::now();

        let claimed = {
            let inner = &mut *inner;
            let queue_state = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::NoSuchQueue(queue.to_owned()))?;
            let mut claimed = None;
            for &(rank, job_id) in queue_state.waiting.iter() {
                let job = &inner.jobs[&job_id];
                if job.available_at <= now {
                    claimed = Some((rank, job_id));
                    break;
                }
            }
            if let Some(key) = claimed {
                queue_state.waiting.remove(&key);
            }
            claimed
        };

        match claimed {
            Some((_, job_id)) => {
                let job = inner.job_mut(job_id)?;
                job.state = State::Active;
                job.started_at = Some(now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, job_id: u64) -> Result<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_in_state(job_id, State::Active)?;
        job.state = State::Completed;
        job.processed_at = Some(DateTime::now());
        let record = job.clone();
        inner.stats.total_jobs_completed += 1;
        Ok(record)
    }

    async fn retry(&self, job_id: u64, delay: Duration, reason: &str) -> Result<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let (record, queue, rank) = {
            let job = inner.job_in_state(job_id, State::Active)?;
            job.attempts_made += 1;
            job.state = State::Waiting;
            job.available_at = DateTime::now().plus(delay);
            job.started_at = None;
            job.failed_reason = Some(reason.to_owned());
            (job.clone(), job.queue.clone(), claim_rank(job.priority, job_id))
        };
        inner.queue_mut(&queue)?.waiting.insert(rank);
        inner.stats.total_jobs_retried += 1;
        Ok(record)
    }

    async fn fail(&self, job_id: u64, reason: &str) -> Result<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_in_state(job_id, State::Active)?;
        job.attempts_made += 1;
        job.state = State::Failed;
        job.processed_at = Some(DateTime::now());
        job.failed_reason = Some(reason.to_owned());
        let record = job.clone();
        inner.stats.total_jobs_failed += 1;
        Ok(record)
    }

    async fn mark_dead_lettered(&self, job_id: u64) -> Result<JobRecord> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_in_state(job_id, State::Failed)?;
        job.state = State::DeadLettered;
        let record = job.clone();
        inner.stats.total_jobs_dead_lettered += 1;
        Ok(record)
    }

    async fn job(&self, job_id: u64) -> Result<JobRecord> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&job_id).cloned().ok_or(Error::NoSuchJob(job_id))
    }

    async fn queue_job_ids(&self, queue: &str) -> Result<HashMap<State, Vec<u64>>> {
        let inner = self.inner.lock().unwrap();
        if !inner.queues.contains_key(queue) {
            return Err(Error::NoSuchQueue(queue.to_owned()));
        }
        let mut by_state: HashMap<State, Vec<u64>> = HashMap::new();
        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            by_state.entry(job.state).or_default().push(job.id);
        }
        for ids in by_state.values_mut() {
            ids.sort_unstable();
        }
        Ok(by_state)
    }

    async fn sweep_stalled(&self) -> Result<Vec<JobRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let now = DateTime::now();

        let stalled: Vec<(u64, Duration)> = inner
            .jobs
            .values()
            .filter(|job| job.state == State::Active)
            .filter_map(|job| {
                let stall_timeout = inner.queues.get(&job.queue)?.settings.stall_timeout;
                let started = job.started_at?;
                if elapsed_millis(&now, &started) >= stall_timeout.as_millis() as i64 {
                    Some((job.id, stall_timeout))
                } else {
                    None
                }
            })
            .collect();

        let mut swept = Vec::with_capacity(stalled.len());
        for (job_id, _) in stalled {
            let (record, requeue) = {
                let job = inner.job_mut(job_id)?;
                job.attempts_made += 1;
                job.failed_reason = Some("stalled".to_owned());
                if job.attempts_exhausted() {
                    job.state = State::Failed;
                    job.processed_at = Some(now);
                    (job.clone(), None)
                } else {
                    job.state = State::Waiting;
                    job.available_at = now;
                    job.started_at = None;
                    (job.clone(), Some((job.queue.clone(), claim_rank(job.priority, job_id))))
                }
            };
            if let Some((queue, rank)) = requeue {
                inner.queue_mut(&queue)?.waiting.insert(rank);
            }
            inner.stats.total_jobs_stalled += 1;
            swept.push(record);
        }
        Ok(swept)
    }

    async fn sweep_expired(&self) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock().unwrap();
        let now = DateTime::now();

        let expired: Vec<u64> = inner
            .jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .filter_map(|job| {
                let retention = inner.queues.get(&job.queue)?.settings.retention;
                let age_limit = match job.state {
                    State::Completed => retention.completed,
                    _ => retention.failed,
                };
                let processed = job.processed_at?;
                if elapsed_millis(&now, &processed) >= age_limit.as_millis() as i64 {
                    Some(job.id)
                } else {
                    None
                }
            })
            .collect();

        for job_id in &expired {
            inner.jobs.remove(job_id);
        }
        Ok(expired)
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let inner = self.inner.lock().unwrap();
        let mut queues: HashMap<String, QueueInfo> = inner
            .queues
            .keys()
            .map(|name| (name.clone(), QueueInfo::default()))
            .collect();
        for job in inner.jobs.values() {
            if let Some(info) = queues.get_mut(&job.queue) {
                info.incr_state_count(&job.state);
            }
        }
        Ok(ServerInfo {
            queues,
            statistics: inner.stats.clone(),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn store_with_queue(name: &str, settings: queue::Settings) -> MemoryStore {
        let store = MemoryStore::new();
        store.register_queue(name, &settings).await.unwrap();
        store
    }

    #[tokio::test]
    async fn register_and_list_queues() {
        let store = MemoryStore::new();
        assert!(store.register_queue("email", &Default::default()).await.unwrap());
        assert!(store.register_queue("cron", &Default::default()).await.unwrap());
        assert!(!store.register_queue("email", &Default::default()).await.unwrap());
        assert_eq!(store.queue_names().await.unwrap(), vec!["cron", "email"]);

        assert_eq!(
            store.register_queue("no spaces", &Default::default()).await,
            Err(Error::bad_request("Invalid queue name: no spaces"))
        );
    }

    #[tokio::test]
    async fn unknown_queue_and_job() {
        let store = MemoryStore::new();
        assert_eq!(
            store.queue_size("nope").await,
            Err(Error::NoSuchQueue("nope".to_owned()))
        );
        assert_eq!(store.job(1).await, Err(Error::NoSuchJob(1)));
        assert_eq!(
            store
                .enqueue("nope", &EnqueueRequest::new("x", serde_json::Value::Null), None)
                .await,
            Err(Error::NoSuchQueue("nope".to_owned()))
        );
    }

    #[tokio::test]
    async fn fifo_claim_order() {
        let store = store_with_queue("q", Default::default()).await;
        for n in 0..3 {
            store
                .enqueue("q", &EnqueueRequest::new("job", serde_json::json!(n)), None)
                .await
                .unwrap();
        }
        for n in 0..3 {
            let job = store.claim_next("q").await.unwrap().unwrap();
            assert_eq!(job.payload, serde_json::json!(n));
            assert_eq!(job.state, State::Active);
            assert!(job.started_at.is_some());
        }
        assert!(store.claim_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_claim_order() {
        let store = store_with_queue("q", Default::default()).await;
        let low = EnqueueRequest::new("job", serde_json::Value::Null).with_priority(-1);
        let mid = EnqueueRequest::new("job", serde_json::Value::Null);
        let high = EnqueueRequest::new("job", serde_json::Value::Null).with_priority(5);

        let low_id = store.enqueue("q", &low, None).await.unwrap().id;
        let mid_id = store.enqueue("q", &mid, None).await.unwrap().id;
        let high_id = store.enqueue("q", &high, None).await.unwrap().id;

        let claimed: Vec<u64> = vec![
            store.claim_next("q").await.unwrap().unwrap().id,
            store.claim_next("q").await.unwrap().unwrap().id,
            store.claim_next("q").await.unwrap().unwrap().id,
        ];
        assert_eq!(claimed, vec![high_id, mid_id, low_id]);
    }

    #[tokio::test]
    async fn delayed_job_not_claimable() {
        let store = store_with_queue("q", Default::default()).await;
        let req = EnqueueRequest::new("job", serde_json::Value::Null)
            .with_delay(Duration::from_secs(3600));
        store.enqueue("q", &req, None).await.unwrap();

        assert_eq!(store.queue_size("q").await.unwrap(), 1);
        assert!(store.claim_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_job_skipped_for_later_eligible_job() {
        let store = store_with_queue("q", Default::default()).await;
        let delayed = EnqueueRequest::new("job", serde_json::json!("delayed"))
            .with_delay(Duration::from_secs(3600))
            .with_priority(10);
        store.enqueue("q", &delayed, None).await.unwrap();
        let ready = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::json!("ready")), None)
            .await
            .unwrap();

        let claimed = store.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.id, ready.id);
    }

    #[tokio::test]
    async fn transition_conflicts() {
        let store = store_with_queue("q", Default::default()).await;
        let job = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();

        // waiting jobs cannot be completed or failed
        assert!(matches!(store.complete(job.id).await, Err(Error::Conflict(_))));
        assert!(matches!(store.fail(job.id, "err").await, Err(Error::Conflict(_))));

        let claimed = store.claim_next("q").await.unwrap().unwrap();
        store.complete(claimed.id).await.unwrap();

        // completed jobs cannot be completed again or dead-lettered
        assert!(matches!(store.complete(job.id).await, Err(Error::Conflict(_))));
        assert!(matches!(
            store.mark_dead_lettered(job.id).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn retry_requeues_with_attempt_count() {
        let store = store_with_queue("q", Default::default()).await;
        let req = EnqueueRequest::new("job", serde_json::Value::Null).with_max_attempts(3);
        let job = store.enqueue("q", &req, None).await.unwrap();

        let claimed = store.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.attempts_made, 0);

        let retried = store
            .retry(job.id, Duration::from_secs(0), "boom")
            .await
            .unwrap();
        assert_eq!(retried.state, State::Waiting);
        assert_eq!(retried.attempts_made, 1);
        assert_eq!(retried.failed_reason.as_deref(), Some("boom"));

        let claimed = store.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts_made, 1);
    }

    #[tokio::test]
    async fn fail_then_dead_letter() {
        let store = store_with_queue("q", Default::default()).await;
        let job = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();
        store.claim_next("q").await.unwrap().unwrap();

        let failed = store.fail(job.id, "boom").await.unwrap();
        assert_eq!(failed.state, State::Failed);
        assert_eq!(failed.attempts_made, 1);

        let dead = store.mark_dead_lettered(job.id).await.unwrap();
        assert_eq!(dead.state, State::DeadLettered);
    }

    #[tokio::test]
    async fn stall_sweep_requeues_then_fails() {
        let settings = queue::Settings {
            stall_timeout: Duration::from_secs(0),
            max_attempts: 2,
            ..Default::default()
        };
        let store = store_with_queue("q", settings).await;
        let job = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();

        store.claim_next("q").await.unwrap().unwrap();
        let swept = store.sweep_stalled().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].state, State::Waiting);
        assert_eq!(swept[0].attempts_made, 1);
        assert_eq!(swept[0].failed_reason.as_deref(), Some("stalled"));

        // second stall exhausts the attempt ceiling
        store.claim_next("q").await.unwrap().unwrap();
        let swept = store.sweep_stalled().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].state, State::Failed);
        assert_eq!(swept[0].attempts_made, 2);

        assert!(store.sweep_stalled().await.unwrap().is_empty());
        assert_eq!(store.job(job.id).await.unwrap().state, State::Failed);
    }

    #[tokio::test]
    async fn stall_sweep_ignores_healthy_jobs() {
        let store = store_with_queue("q", Default::default()).await;
        store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();
        store.claim_next("q").await.unwrap().unwrap();

        // default stall timeout is minutes away
        assert!(store.sweep_stalled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_sweep_evicts_terminal_jobs() {
        let settings = queue::Settings {
            retention: queue::Retention {
                completed: Duration::from_secs(0),
                failed: Duration::from_secs(3600),
            },
            ..Default::default()
        };
        let store = store_with_queue("q", settings).await;

        let done = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();
        let kept = store
            .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
            .await
            .unwrap();

        store.claim_next("q").await.unwrap();
        store.complete(done.id).await.unwrap();
        store.claim_next("q").await.unwrap();
        store.fail(kept.id, "boom").await.unwrap();

        let evicted = store.sweep_expired().await.unwrap();
        assert_eq!(evicted, vec![done.id]);
        assert_eq!(store.job(done.id).await, Err(Error::NoSuchJob(done.id)));
        assert!(store.job(kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn server_info_counts() {
        let store = store_with_queue("q", Default::default()).await;
        store.register_queue("other", &Default::default()).await.unwrap();

        for _ in 0..3 {
            store
                .enqueue("q", &EnqueueRequest::new("job", serde_json::Value::Null), None)
                .await
                .unwrap();
        }
        let claimed = store.claim_next("q").await.unwrap().unwrap();
        store.complete(claimed.id).await.unwrap();
        let claimed = store.claim_next("q").await.unwrap().unwrap();
        store.fail(claimed.id, "boom").await.unwrap();

        let info = store.server_info().await.unwrap();
        let q = &info.queues["q"];
        assert_eq!((q.waiting, q.completed, q.failed), (1, 1, 1));
        assert_eq!(info.queues["other"], QueueInfo::default());
        assert_eq!(info.statistics.total_jobs_created, 3);
        assert_eq!(info.statistics.total_jobs_completed, 1);
        assert_eq!(info.statistics.total_jobs_failed, 1);
    }
}
