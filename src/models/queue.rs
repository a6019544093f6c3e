//! Queue settings and policies.

use serde::{Deserialize, Serialize};

use crate::models::Duration;

/// Names of the standard queues registered when no queues are configured.
pub mod names {
    pub const EMAIL: &str = "email";
    pub const NOTIFICATION: &str = "notification";
    pub const CRON: &str = "cron";
    pub const DEAD_LETTER: &str = "dead_letter";
}

/// Delay strategy applied between retry attempts.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,

    /// Same delay before every retry.
    Fixed { delay: Duration },

    /// `base`, doubled for each subsequent retry.
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay before retry attempt number `attempt` (1-based: the first retry is 1).
    pub fn delay_for(&self, attempt: u64) -> Duration {
        match self {
            Backoff::None => Duration::from_secs(0),
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16) as u32;
                Duration::from_millis(base.as_millis().saturating_mul(1u64 << shift))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// How long terminal jobs are kept before the retention sweep evicts them.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Retention {
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(24 * 3600),
            failed: Duration::from_secs(24 * 3600),
        }
    }
}

/// Per-queue configuration, set once at registration time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Execution attempt ceiling per job, overridable per enqueue.
    pub max_attempts: u64,

    /// Delay policy between retries.
    pub backoff: Backoff,

    /// Execution time budget per attempt; overrunning handlers count as failed.
    pub timeout: Duration,

    /// Jobs active longer than this are considered stalled and requeued by the
    /// stall sweep.
    pub stall_timeout: Duration,

    /// Retention ages for terminal jobs.
    pub retention: Retention,

    /// Bound on the per-queue event log; oldest entries are evicted first.
    pub event_stream_cap: usize,

    /// Number of jobs a worker for this queue processes in parallel. FIFO is only
    /// strict at 1.
    pub concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            timeout: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(300),
            retention: Retention::default(),
            event_stream_cap: 1000,
            concurrency: 1,
        }
    }
}

impl Settings {
    /// Settings for the dead-letter queue: no automatic retries, long retention
    /// so failed jobs can be inspected and replayed.
    pub fn dead_letter() -> Self {
        Self {
            max_attempts: 1,
            retention: Retention {
                completed: Duration::from_secs(7 * 24 * 3600),
                failed: Duration::from_secs(60 * 24 * 3600),
            },
            ..Self::default()
        }
    }
}

/// Queue summary returned by `GET /queue/{name}`.
#[derive(Debug, PartialEq, Serialize)]
pub struct Summary {
    pub size: u64,
    #[serde(flatten)]
    pub settings: Settings,
}

/// Validate queue name, allowed chars for names are: [a-zA-Z0-9_.-].
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_name_validation() {
        assert!(is_valid_name("name"));
        assert!(is_valid_name("1"));
        assert!(is_valid_name("abc-123-ABC"));
        assert!(is_valid_name("123_456"));
        assert!(is_valid_name("name.1.low"));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("   "));
        assert!(!is_valid_name(":"));
        assert!(!is_valid_name("name "));
        assert!(!is_valid_name("name/name"));
        assert!(!is_valid_name("nâme"));
    }

    #[test]
    fn backoff_delays() {
        let b = Backoff::None;
        assert_eq!(b.delay_for(1), Duration::from_secs(0));
        assert_eq!(b.delay_for(5), Duration::from_secs(0));

        let b = Backoff::Fixed {
            delay: Duration::from_secs(10),
        };
        assert_eq!(b.delay_for(1), Duration::from_secs(10));
        assert_eq!(b.delay_for(4), Duration::from_secs(10));

        let b = Backoff::Exponential {
            base: Duration::from_secs(5),
        };
        assert_eq!(b.delay_for(1), Duration::from_secs(5));
        assert_eq!(b.delay_for(2), Duration::from_secs(10));
        assert_eq!(b.delay_for(3), Duration::from_secs(20));
        assert_eq!(b.delay_for(4), Duration::from_secs(40));
    }

    #[test]
    fn backoff_toml() {
        #[derive(Debug, serde::Deserialize)]
        struct Wrapper {
            backoff: Backoff,
        }

        let w: Wrapper = toml::from_str(
            r#"
backoff = { strategy = "exponential", base = "5s" }
"#,
        )
        .unwrap();
        assert_eq!(
            w.backoff,
            Backoff::Exponential {
                base: Duration::from_secs(5)
            }
        );

        let w: Wrapper = toml::from_str(
            r#"
backoff = { strategy = "fixed", delay = "1m" }
"#,
        )
        .unwrap();
        assert_eq!(
            w.backoff,
            Backoff::Fixed {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn dead_letter_settings() {
        let s = Settings::dead_letter();
        assert_eq!(s.max_attempts, 1);
        assert_eq!(s.retention.completed, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(s.retention.failed, Duration::from_secs(60 * 24 * 3600));
        assert_eq!(s.event_stream_cap, 1000);
    }
}
