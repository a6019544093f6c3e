//! Lifecycle events emitted per queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::DateTime;

/// Kind of lifecycle event. One is recorded per job state transition.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Job was enqueued (or requeued by replay).
    Waiting,

    /// Job was claimed by a worker.
    Active,

    /// Handler finished successfully.
    Completed,

    /// Job failed with no retries remaining.
    Failed,

    /// Job failed but was requeued for another attempt.
    Retrying,

    /// Job was found active past its stall timeout and recovered by the sweep.
    Stalled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EventKind::Waiting => "waiting",
            EventKind::Active => "active",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Retrying => "retrying",
            EventKind::Stalled => "stalled",
        };
        write!(f, "{}", s)
    }
}

/// A single entry in a queue's bounded event log.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QueueEvent {
    pub kind: EventKind,
    pub job_id: u64,
    pub timestamp: DateTime,
}

impl QueueEvent {
    pub fn new(kind: EventKind, job_id: u64) -> Self {
        Self {
            kind,
            job_id,
            timestamp: DateTime::now(),
        }
    }
}
