//! HTTP request handlers, mapping application errors to response codes.

pub mod deadletter;
pub mod health;
pub mod info;
pub mod job;
pub mod queue;
