//! Durable task queue with in-process workers, cron scheduling and dead-letter recovery.
//!
//! Jobs are persisted in a [`store::JobStore`] (Redis in production, in-memory for
//! embedding and tests), claimed atomically by per-queue workers, retried with a
//! configurable backoff policy, and copied to a dead-letter queue once their attempt
//! ceiling is exhausted. A cron scheduler enqueues recurring jobs, and background
//! sweeps recover stalled jobs and evict terminal jobs past their retention age.

pub mod config;
pub mod deadletter;
pub mod events;
pub mod handlers;
pub mod models;
pub mod producer;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sweeps;
pub mod worker;
