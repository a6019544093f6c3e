//! Data structures used throughout the application.

pub mod event;
pub mod job;
pub mod queue;
mod datetime;
mod duration;
mod error;
mod state;

pub use self::datetime::DateTime;
pub use self::duration::Duration;
pub use self::error::{Error, Result};
pub use self::state::ApplicationState;

use std::collections::HashMap;

use serde::Serialize;

/// Summary of all queues and lifetime job statistics, exposed via the `/info` endpoint.
#[derive(Debug, Default, Eq, PartialEq, Serialize)]
pub struct ServerInfo {
    pub queues: HashMap<String, QueueInfo>,
    pub statistics: JobStats,
}

/// Per-queue count of jobs in each state.
#[derive(Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueInfo {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl QueueInfo {
    pub fn incr_state_count(&mut self, state: &job::State) {
        match state {
            job::State::Waiting => self.waiting += 1,
            job::State::Active => self.active += 1,
            job::State::Completed => self.completed += 1,
            job::State::Failed => self.failed += 1,
            job::State::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Lifetime counters, incremented on each job state transition.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobStats {
    pub total_jobs_created: u64,
    pub total_jobs_completed: u64,
    pub total_jobs_retried: u64,
    pub total_jobs_failed: u64,
    pub total_jobs_stalled: u64,
    pub total_jobs_dead_lettered: u64,
}
