//! Job records, lifecycle states, and enqueue requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{DateTime, Duration};

const WAITING_STATE: &str = "waiting";
const ACTIVE_STATE: &str = "active";
const COMPLETED_STATE: &str = "completed";
const FAILED_STATE: &str = "failed";
const DEAD_LETTERED_STATE: &str = "dead_lettered";

/// Lifecycle state of a job.
///
/// Valid transitions: waiting -> active -> {completed | waiting (retry) | failed};
/// failed -> dead_lettered once attempts are exhausted and the job has been copied
/// to the dead-letter queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Job is in a queue, waiting for a worker to claim it.
    Waiting,

    /// Job has been claimed by a worker and is being processed.
    Active,

    /// Handler finished successfully. Retained per the queue's completed retention.
    Completed,

    /// Handler failed (or timed out/stalled) with no retries remaining.
    Failed,

    /// Failed job has been copied to the dead-letter queue for manual inspection.
    DeadLettered,
}

pub const ALL_STATES: [State; 5] = [
    State::Waiting,
    State::Active,
    State::Completed,
    State::Failed,
    State::DeadLettered,
];

impl State {
    /// Whether a job in this state has finished processing for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed | State::DeadLettered)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for State {
    fn as_ref(&self) -> &str {
        match self {
            State::Waiting => WAITING_STATE,
            State::Active => ACTIVE_STATE,
            State::Completed => COMPLETED_STATE,
            State::Failed => FAILED_STATE,
            State::DeadLettered => DEAD_LETTERED_STATE,
        }
    }
}

impl FromStr for State {
    type Err = ();

    fn from_str(s: &str) -> Result<State, ()> {
        match s {
            WAITING_STATE => Ok(State::Waiting),
            ACTIVE_STATE => Ok(State::Active),
            COMPLETED_STATE => Ok(State::Completed),
            FAILED_STATE => Ok(State::Failed),
            DEAD_LETTERED_STATE => Ok(State::DeadLettered),
            _ => Err(()),
        }
    }
}

/// The persisted job record. This is both the storage format (JSON value per job
/// in Redis) and the wire format returned by the HTTP API.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: u64,
    pub queue: String,

    /// Logical task identifier within the queue, e.g. "send-otp-email". Selects
    /// the handler that processes the job.
    pub name: String,

    pub payload: serde_json::Value,
    pub attempts_made: u64,
    pub max_attempts: u64,
    pub state: State,
    pub created_at: DateTime,

    /// When the job becomes claimable. Set past `created_at` by an enqueue delay
    /// or a retry backoff.
    pub available_at: DateTime,

    /// Higher priority jobs are claimed before lower ones; FIFO within a priority.
    #[serde(default)]
    pub priority: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,

    /// For dead-letter copies only: the queue the job originally failed on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_queue: Option<String>,
}

impl JobRecord {
    /// Whether all execution attempts have been used up.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Lightweight reference to an enqueued job, returned to producers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobHandle {
    pub id: u64,
}

/// Request to enqueue a new job, as accepted by `POST /queue/{name}/job`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EnqueueRequest {
    /// Logical task identifier, used to select a handler.
    pub name: String,

    /// Job payload, opaque to the queue itself.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Hold the job back for this long before it becomes claimable.
    pub delay: Option<Duration>,

    /// Claim ordering hint; higher first. Defaults to 0.
    pub priority: Option<i32>,

    /// Override the queue's attempt ceiling for this job.
    pub max_attempts: Option<u64>,
}

impl EnqueueRequest {
    pub fn new<S: Into<String>>(name: S, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Ensure all states correctly map to/from the same strings.
    #[test]
    fn state_to_from_str() {
        for state in &ALL_STATES {
            assert_eq!(state, &State::from_str(state.as_ref()).unwrap());
        }
    }

    #[test]
    fn serialisation() {
        assert_eq!(serde_json::to_string(&State::Waiting).unwrap(), "\"waiting\"");
        assert_eq!(serde_json::to_string(&State::Active).unwrap(), "\"active\"");
        assert_eq!(serde_json::to_string(&State::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&State::Failed).unwrap(), "\"failed\"");
        assert_eq!(
            serde_json::to_string(&State::DeadLettered).unwrap(),
            "\"dead_lettered\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!State::Waiting.is_terminal());
        assert!(!State::Active.is_terminal());
        assert!(State::Completed.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::DeadLettered.is_terminal());
    }

    #[test]
    fn record_roundtrip() {
        let record = JobRecord {
            id: 7,
            queue: "email".to_owned(),
            name: "send-otp-email".to_owned(),
            payload: serde_json::json!({"email": "a@b.com", "otp": "123456"}),
            attempts_made: 0,
            max_attempts: 3,
            state: State::Waiting,
            created_at: DateTime::from_timestamp_millis(1_000),
            available_at: DateTime::from_timestamp_millis(1_000),
            priority: 0,
            started_at: None,
            processed_at: None,
            failed_reason: None,
            original_queue: None,
        };
        let ser = serde_json::to_string(&record).unwrap();
        assert!(!ser.contains("failed_reason"));
        let deser: JobRecord = serde_json::from_str(&ser).unwrap();
        assert_eq!(record, deser);
    }
}
