//! Defines configuration file parsing.
//!
//! Configuration is read from a TOML file with `${ENV_VAR=default}` style
//! environment variable interpolation applied before parsing, so secrets like
//! the Redis URL can come from the environment.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::models::{queue, Duration, Error, Result};
use crate::scheduler::ScheduleEntry;

/// Parsed configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    /// Queues to register at startup, keyed by name. When empty, a standard set
    /// of queues is registered instead.
    #[serde(default)]
    pub queue: HashMap<String, queue::Settings>,

    /// Cron schedule entries evaluated once per minute.
    #[serde(default)]
    pub schedule: Vec<ScheduleConfig>,
}

impl Config {
    /// Read configuration from given TOML file, interpolating environment
    /// variables of the form `${NAME}` or `${NAME=default}` first.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(&path)
            .map_err(|err| Error::Internal(format!("Failed to open config file: {}", err)))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|err| Error::Internal(format!("Failed to read config file: {}", err)))?;
        Self::from_str(&contents)
    }

    pub fn from_str(raw: &str) -> Result<Self> {
        let interpolated = interpolate_env(raw);
        toml::from_str(&interpolated)
            .map_err(|err| Error::Internal(format!("Failed to parse config file: {}", err)))
    }

    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The queues to register: the configured ones, or the standard set when
    /// none are configured. The dead-letter queue is added by the registry
    /// either way.
    pub fn queues(&self) -> HashMap<String, queue::Settings> {
        if !self.queue.is_empty() {
            return self.queue.clone();
        }
        let mut queues = HashMap::new();
        queues.insert(queue::names::EMAIL.to_owned(), queue::Settings::default());
        queues.insert(
            queue::names::NOTIFICATION.to_owned(),
            queue::Settings::default(),
        );
        queues.insert(queue::names::CRON.to_owned(), queue::Settings::default());
        queues.insert(
            queue::names::DEAD_LETTER.to_owned(),
            queue::Settings::dead_letter(),
        );
        queues
    }

    /// Parse the configured schedules into scheduler entries.
    pub fn schedule_entries(&self) -> Result<Vec<ScheduleEntry>> {
        self.schedule.iter().map(ScheduleConfig::to_entry).collect()
    }
}

/// Replace `${NAME}` and `${NAME=default}` in `raw` with the value of the
/// environment variable `NAME`, or the default (empty if none given) when the
/// variable is not set.
fn interpolate_env(raw: &str) -> String {
    let re = Regex::new(r"\$\{(?P<name>[^{}=]+)(=(?P<default>[^{}]*))?\}").unwrap();
    re.replace_all(raw, |caps: &Captures| match env::var(&caps["name"]) {
        Ok(value) => value,
        Err(_) => caps
            .name("default")
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default(),
    })
    .into_owned()
}

/// Configuration for the HTTP server and background tasks.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Number of HTTP worker threads. Defaults to the number of CPUs.
    pub threads: Option<usize>,

    /// Maximum HTTP POST body size, as a human readable size (e.g. "256kB").
    pub max_body_size: Option<String>,

    /// Seconds to wait for in-flight requests on shutdown.
    pub shutdown_timeout: Option<u64>,

    /// Log filter string, e.g. "info" or "quern=debug".
    pub log_level: String,

    /// When set, mutating endpoints (enqueue, replay) are rejected with 403.
    pub read_only: bool,

    /// How often to check for jobs stuck active past their stall timeout.
    pub stall_check_interval: Duration,

    /// How often to evict terminal jobs past their retention age.
    pub retention_check_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8084,
            threads: None,
            max_body_size: None,
            shutdown_timeout: None,
            log_level: "info".to_owned(),
            read_only: false,
            stall_check_interval: Duration::from_secs(30),
            retention_check_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn max_body_size_bytes(&self) -> Result<Option<usize>> {
        match &self.max_body_size {
            Some(raw) => {
                let size: human_size::Size = raw.parse().map_err(|_| {
                    Error::bad_request(format!("Invalid max_body_size: {}", raw))
                })?;
                Ok(Some(size.to_bytes() as usize))
            }
            None => Ok(None),
        }
    }
}

/// Configuration for connecting to Redis.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,

    /// Prefix applied to all Redis keys.
    pub key_namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1".to_owned(),
            key_namespace: String::new(),
        }
    }
}

/// A single `[[schedule]]` block.
#[derive(Clone, Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Five-field cron expression.
    pub cron: String,

    /// Queue the job is enqueued on.
    pub queue: String,

    /// Name of the job to enqueue.
    pub job: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ScheduleConfig {
    pub fn to_entry(&self) -> Result<ScheduleEntry> {
        let cron = self
            .cron
            .parse()
            .map_err(|err| Error::bad_request(format!("{}", err)))?;
        Ok(ScheduleEntry {
            cron,
            queue: self.queue.clone(),
            name: self.job.clone(),
            payload: self.payload.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::queue::Backoff;

    #[test]
    fn parse_empty_config() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:8084");
        assert_eq!(config.redis_url(), "redis://127.0.0.1");
        assert!(!config.server.read_only);
        assert_eq!(config.server.stall_check_interval, Duration::from_secs(30));
        assert!(config.schedule.is_empty());
    }

    #[test]
    fn default_queues_when_none_configured() {
        let config = Config::from_str("").unwrap();
        let queues = config.queues();
        let mut names: Vec<&str> = queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["cron", "dead_letter", "email", "notification"]);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::from_str(
            r#"
[server]
host = "0.0.0.0"
port = 9123
log_level = "debug"
read_only = true
max_body_size = "256kB"
stall_check_interval = "10s"

[redis]
url = "redis://example.com:6379"
key_namespace = "quern"

[queue.email]
max_attempts = 3
timeout = "30s"
backoff = { strategy = "exponential", base = "5s" }

[queue.email.retention]
completed = "1day"
failed = "1day"

[[schedule]]
cron = "*/5 * * * *"
queue = "cron"
job = "warm-up-cache"

[[schedule]]
cron = "30 3 * * *"
queue = "cron"
job = "session-cleanup"
payload = { batch_size = 500 }
"#,
        )
        .unwrap();

        assert_eq!(config.server_addr(), "0.0.0.0:9123");
        assert!(config.server.read_only);
        assert_eq!(config.server.max_body_size_bytes().unwrap(), Some(256_000));
        assert_eq!(config.server.stall_check_interval, Duration::from_secs(10));
        assert_eq!(config.redis.key_namespace, "quern");

        let email = &config.queues()["email"];
        assert_eq!(email.max_attempts, 3);
        assert_eq!(email.timeout, Duration::from_secs(30));
        assert_eq!(
            email.backoff,
            Backoff::Exponential {
                base: Duration::from_secs(5)
            }
        );

        let entries = config.schedule_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "session-cleanup");
        assert_eq!(entries[1].payload, serde_json::json!({"batch_size": 500}));
    }

    #[test]
    fn read_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nport = 9000").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);

        assert!(matches!(
            Config::from_file("/no/such/config.toml"),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn invalid_cron_rejected() {
        let config = Config::from_str(
            r#"
[[schedule]]
cron = "not a cron"
queue = "cron"
job = "broken"
"#,
        )
        .unwrap();
        assert!(matches!(config.schedule_entries(), Err(Error::BadRequest(_))));
    }

    #[test]
    fn invalid_max_body_size_rejected() {
        let config = Config::from_str(
            r#"
[server]
max_body_size = "lots"
"#,
        )
        .unwrap();
        assert!(config.server.max_body_size_bytes().is_err());
    }

    #[test]
    fn env_interpolation() {
        env::set_var("QUERNTEST_REDIS_URL", "redis://from-env:6379");
        let config = Config::from_str(
            r#"
[redis]
url = "${QUERNTEST_REDIS_URL}"
key_namespace = "${QUERNTEST_UNSET_NAMESPACE=ns}"
"#,
        )
        .unwrap();
        assert_eq!(config.redis_url(), "redis://from-env:6379");
        assert_eq!(config.redis.key_namespace, "ns");
        env::remove_var("QUERNTEST_REDIS_URL");
    }

    #[test]
    fn env_interpolation_empty_default() {
        let raw = interpolate_env("url = \"${QUERNTEST_MISSING_VAR=}\"");
        assert_eq!(raw, "url = \"\"");

        let raw = interpolate_env("url = \"${QUERNTEST_MISSING_VAR}\"");
        assert_eq!(raw, "url = \"\"");
    }
}
