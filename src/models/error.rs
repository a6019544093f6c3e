//! Defines basic error and result types used throughout the application.

use std::{error, fmt};

use redis::RedisError;

/// Result type used throughout the application.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type used throughout the application.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Operation attempted on a queue that is not registered.
    NoSuchQueue(String),

    /// Operation attempted on a job that does not exist.
    NoSuchJob(u64),

    /// Payload could not be serialized for durable storage, or failed the
    /// typed payload validation registered for its job name.
    Serialization(String),

    /// A job handler returned an error while processing a job. Contained within
    /// the worker loop and recorded as the job's failure reason.
    Handler(String),

    /// A job handler exceeded its execution time budget. Counts as a failed
    /// attempt, same as `Handler`.
    ExecutionTimeout,

    /// Could not complete request with given parameters.
    BadRequest(String),

    /// Request was not valid due to current state of some resource(s).
    Conflict(String),

    /// Error occurred during interaction with Redis.
    Redis(RedisError),

    /// Error occurred while trying to get a pooled DB connection to Redis.
    RedisConnection(String),

    /// Internal application error.
    Internal(String),
}

impl Error {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }
}

impl From<RedisError> for Error {
    fn from(err: RedisError) -> Self {
        Error::Redis(err)
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Error::RedisConnection(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoSuchQueue(queue) => write!(f, "Queue '{}' does not exist", queue),
            Error::NoSuchJob(job_id) => write!(f, "Job with ID {} does not exist", job_id),
            Error::Serialization(msg) => write!(f, "Invalid job payload: {}", msg),
            Error::Handler(msg) => write!(f, "Job handler failed: {}", msg),
            Error::ExecutionTimeout => write!(f, "Job handler exceeded its execution timeout"),
            Error::Redis(err) => err.fmt(f),
            Error::RedisConnection(msg) => write!(f, "Failed to connect to Redis: {}", msg),
            Error::BadRequest(msg) | Error::Conflict(msg) | Error::Internal(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Redis(err) => Some(err),
            _ => None,
        }
    }
}
