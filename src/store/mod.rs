//! Durable job storage.
//!
//! All queue/job state lives behind the [`JobStore`] trait: a durable,
//! atomically-updatable record store with claim semantics that guarantee a job is
//! handed to at most one worker. Two backends are provided: [`RedisStore`] for
//! production use, and [`MemoryStore`] for embedding and tests.

mod keys;
mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::job::{EnqueueRequest, JobRecord, State};
use crate::models::{queue, Duration, Result, ServerInfo};

/// Storage backend for queues and jobs.
///
/// State transitions are atomic with respect to concurrent callers: exactly one
/// worker can move a given job from waiting to active, and a transition observed
/// from an outdated state fails with `Error::Conflict` rather than clobbering.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queue with given settings, or replace the settings of an existing
    /// queue. Returns true if the queue was newly created.
    async fn register_queue(&self, name: &str, settings: &queue::Settings) -> Result<bool>;

    /// Sorted list of all registered queue names.
    async fn queue_names(&self) -> Result<Vec<String>>;

    async fn queue_settings(&self, name: &str) -> Result<queue::Settings>;

    /// Number of jobs currently waiting (including delayed) on given queue.
    async fn queue_size(&self, name: &str) -> Result<u64>;

    /// Durably persist a new waiting job. `original_queue` is only set for
    /// dead-letter copies and carries the queue the job originally failed on.
    async fn enqueue(
        &self,
        queue: &str,
        req: &EnqueueRequest,
        original_queue: Option<&str>,
    ) -> Result<JobRecord>;

    /// Atomically claim the next eligible waiting job, moving it to active.
    /// Jobs are claimed highest priority first, then FIFO by id. Returns `None`
    /// if no job is currently eligible.
    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>>;

    /// Transition an active job to completed.
    async fn complete(&self, job_id: u64) -> Result<JobRecord>;

    /// Return an active job to waiting for another attempt after `delay`,
    /// incrementing its attempt counter and recording the failure reason.
    async fn retry(&self, job_id: u64, delay: Duration, reason: &str) -> Result<JobRecord>;

    /// Transition an active job to failed (terminal), incrementing its attempt
    /// counter and recording the failure reason.
    async fn fail(&self, job_id: u64, reason: &str) -> Result<JobRecord>;

    /// Mark a failed job as dead-lettered, once its copy has been enqueued on the
    /// dead-letter queue.
    async fn mark_dead_lettered(&self, job_id: u64) -> Result<JobRecord>;

    /// Fetch a job record by id.
    async fn job(&self, job_id: u64) -> Result<JobRecord>;

    /// All job ids belonging to given queue, grouped by state.
    async fn queue_job_ids(&self, queue: &str) -> Result<HashMap<State, Vec<u64>>>;

    /// Recover jobs that have been active longer than their queue's stall
    /// timeout: each has its attempt counter incremented and is either returned
    /// to waiting, or transitioned to failed if its attempts are now exhausted.
    /// Returns the records after transition.
    async fn sweep_stalled(&self) -> Result<Vec<JobRecord>>;

    /// Delete terminal jobs older than their queue's retention age. Returns the
    /// ids of deleted jobs.
    async fn sweep_expired(&self) -> Result<Vec<u64>>;

    /// Per-queue state counts plus lifetime statistics.
    async fn server_info(&self) -> Result<ServerInfo>;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<()>;
}
