//! Central place for defining Redis keys used by the application.

/// Redis key containing the set of all registered queue names.
const QUEUES: &str = "queues";

/// Redis key containing the ID that the next created job will get.
const JOB_ID: &str = "job_id";

/// Redis key containing the set of all active (i.e. claimed) job IDs.
const ACTIVE: &str = "active";

/// Redis key containing the set of all terminal (completed/failed/dead-lettered) job IDs.
const TERMINAL: &str = "terminal";

/// Prefix of per-queue keys.
const QUEUE_PREFIX: &str = "queue:";

/// Prefix of per-job keys.
const JOB_PREFIX: &str = "job:";

/// Prefix of lifetime statistics counters.
const STAT_PREFIX: &str = "stats:";

pub const STAT_CREATED: &str = "total_jobs_created";
pub const STAT_COMPLETED: &str = "total_jobs_completed";
pub const STAT_RETRIED: &str = "total_jobs_retried";
pub const STAT_FAILED: &str = "total_jobs_failed";
pub const STAT_STALLED: &str = "total_jobs_stalled";
pub const STAT_DEAD_LETTERED: &str = "total_jobs_dead_lettered";

/// Builds namespaced Redis keys. All keys share a configurable prefix so that
/// several applications can share a Redis database.
#[derive(Clone, Debug)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        let prefix = if namespace.is_empty() {
            String::new()
        } else {
            format!("{}:", namespace)
        };
        Keys { prefix }
    }

    pub fn queues(&self) -> String {
        format!("{}{}", self.prefix, QUEUES)
    }

    pub fn job_id(&self) -> String {
        format!("{}{}", self.prefix, JOB_ID)
    }

    pub fn active(&self) -> String {
        format!("{}{}", self.prefix, ACTIVE)
    }

    pub fn terminal(&self) -> String {
        format!("{}{}", self.prefix, TERMINAL)
    }

    /// Key storing a queue's settings as a JSON string.
    pub fn queue_settings(&self, queue: &str) -> String {
        format!("{}{}{}", self.prefix, QUEUE_PREFIX, queue)
    }

    /// Sorted set of jobs claimable now, scored by priority then insertion order.
    pub fn queue_waiting(&self, queue: &str) -> String {
        format!("{}{}{}:waiting", self.prefix, QUEUE_PREFIX, queue)
    }

    /// Sorted set of delayed jobs, scored by the time they become claimable.
    pub fn queue_delayed(&self, queue: &str) -> String {
        format!("{}{}{}:delayed", self.prefix, QUEUE_PREFIX, queue)
    }

    /// Key storing a job's record as a JSON string.
    pub fn job(&self, job_id: u64) -> String {
        format!("{}{}{}", self.prefix, JOB_PREFIX, job_id)
    }

    pub fn stat(&self, counter: &str) -> String {
        format!("{}{}{}", self.prefix, STAT_PREFIX, counter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unnamespaced() {
        let keys = Keys::new("");
        assert_eq!(keys.queues(), "queues");
        assert_eq!(keys.queue_waiting("email"), "queue:email:waiting");
        assert_eq!(keys.job(42), "job:42");
    }

    #[test]
    fn namespaced() {
        let keys = Keys::new("quern");
        assert_eq!(keys.queues(), "quern:queues");
        assert_eq!(keys.queue_delayed("cron"), "quern:queue:cron:delayed");
        assert_eq!(keys.stat(STAT_CREATED), "quern:stats:total_jobs_created");
    }
}
