//! Workers and job handlers.
//!
//! A [`Worker`] polls a single queue, claims jobs, and executes the handler
//! registered for each job's name under the queue's execution timeout. Handler
//! failures and timeouts both count as a failed attempt: the job is requeued
//! with the queue's backoff until its attempts are exhausted, at which point it
//! is failed and routed to the dead-letter queue.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;

use crate::deadletter::DeadLetterRouter;
use crate::models::event::EventKind;
use crate::models::{queue, Duration, Error, Result};
use crate::registry::QueueRegistry;
use crate::store::JobStore;

/// Execution context handed to a handler.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub id: u64,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,

    /// 1-based number of the attempt being executed.
    pub attempt: u64,
    pub max_attempts: u64,
}

/// Processes jobs of a single name. An `Err` return counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobContext) -> Result<()>;

    /// Check a payload at enqueue time. The default accepts anything.
    fn validate(&self, _payload: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, job: JobContext) -> Result<()> {
        (self.0)(job).await
    }
}

struct TypedFnHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> JobHandler for TypedFnHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, job: JobContext) -> Result<()> {
        let payload: T = serde_json::from_value(job.payload.clone())?;
        (self.f)(payload, job).await
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<T>(payload.clone())
            .map(|_| ())
            .map_err(Error::from)
    }
}

/// Maps job names to their handlers. Shared by workers (execution) and
/// optionally by the producer (enqueue-time payload validation).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&mut self, name: S, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a plain async function as a handler.
    pub fn register_fn<S, F, Fut>(&mut self, name: S, f: F)
    where
        S: Into<String>,
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    /// Register a handler taking a typed payload. Payloads that do not
    /// deserialise to `T` are rejected at enqueue time when validation is
    /// enabled, and fail the attempt otherwise.
    pub fn register_typed<S, T, F, Fut>(&mut self, name: S, f: F)
    where
        S: Into<String>,
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(
            name,
            Arc::new(TypedFnHandler {
                f,
                _payload: PhantomData,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(name)
    }

    /// Validate a payload against the handler registered for `name`, if any.
    /// Names without a registered handler pass, since handlers may live in
    /// another process.
    pub fn validate(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        match self.handlers.get(name) {
            Some(handler) => handler.validate(payload),
            None => Ok(()),
        }
    }
}

pub struct Worker {
    registry: Arc<QueueRegistry>,
    handlers: Arc<HandlerRegistry>,
    router: DeadLetterRouter,
    queue: String,
    settings: queue::Settings,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        registry: Arc<QueueRegistry>,
        handlers: Arc<HandlerRegistry>,
        queue: &str,
    ) -> Result<Self> {
        let settings = registry.queue(queue)?.settings.clone();
        Ok(Self {
            router: DeadLetterRouter::new(registry.clone()),
            registry,
            handlers,
            queue: queue.to_owned(),
            settings,
            poll_interval: Duration::from_millis(500),
        })
    }

    /// How long to sleep between polls when the queue is empty.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Claim and execute a single job. Returns false if no job was eligible.
    pub async fn process_one(&self) -> Result<bool> {
        let store = self.registry.store();
        let record = match store.claim_next(&self.queue).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        let events = self.registry.events(&self.queue)?;
        events.emit(EventKind::Active, record.id);

        let attempt = record.attempts_made + 1;
        debug!(
            "[{}:{}] started, name={}, attempt {}/{}",
            &self.queue, record.id, &record.name, attempt, record.max_attempts
        );

        let context = JobContext {
            id: record.id,
            queue: record.queue.clone(),
            name: record.name.clone(),
            payload: record.payload.clone(),
            attempt,
            max_attempts: record.max_attempts,
        };
        let outcome = match self.handlers.get(&record.name) {
            Some(handler) => {
                match tokio::time::timeout(self.settings.timeout.into(), handler.run(context)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::ExecutionTimeout),
                }
            }
            None => Err(Error::Handler(format!(
                "No handler registered for job name '{}'",
                record.name
            ))),
        };

        match outcome {
            Ok(()) => {
                store.complete(record.id).await?;
                events.emit(EventKind::Completed, record.id);
                info!("[{}:{}] completed", &self.queue, record.id);
            }
            Err(err) => {
                let reason = err.to_string();
                if attempt < record.max_attempts {
                    let delay = self.settings.backoff.delay_for(attempt);
                    store.retry(record.id, delay, &reason).await?;
                    events.emit(EventKind::Retrying, record.id);
                    warn!(
                        "[{}:{}] attempt {}/{} failed, retrying in {}: {}",
                        &self.queue, record.id, attempt, record.max_attempts, delay, reason
                    );
                } else {
                    let failed = store.fail(record.id, &reason).await?;
                    events.emit(EventKind::Failed, record.id);
                    error!(
                        "[{}:{}] failed after {} attempt(s): {}",
                        &self.queue, record.id, attempt, reason
                    );
                    self.router.route(&failed).await?;
                }
            }
        }
        Ok(true)
    }

    /// Process jobs until no eligible job remains. Returns the number processed.
    pub async fn drain(&self) -> Result<u64> {
        let mut processed = 0;
        while self.process_one().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Run this worker in the background until aborted, with one polling loop
    /// per configured concurrency slot.
    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        let slots = self.settings.concurrency.max(1);
        let worker = Arc::new(self);
        (0..slots)
            .map(|slot| {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    loop {
                        match worker.process_one().await {
                            Ok(true) => (),
                            Ok(false) => tokio::time::sleep(worker.poll_interval.into()).await,
                            Err(err) => {
                                error!("[{}] worker slot {}: {}", &worker.queue, slot, err);
                                tokio::time::sleep(worker.poll_interval.into()).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
