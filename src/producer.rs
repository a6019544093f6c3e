//! Job producer.
//!
//! Thin front over the store's enqueue operation: resolves the target queue,
//! optionally validates the payload against the handler registered for the job
//! name, persists the job, and emits the `waiting` event. A job is only
//! acknowledged to the caller once it has been durably written.

use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::models::event::EventKind;
use crate::models::job::{EnqueueRequest, JobHandle};
use crate::models::Result;
use crate::registry::QueueRegistry;
use crate::store::JobStore;
use crate::worker::HandlerRegistry;

#[derive(Clone)]
pub struct Producer {
    registry: Arc<QueueRegistry>,
    handlers: Option<Arc<HandlerRegistry>>,
}

impl Producer {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            handlers: None,
        }
    }

    /// Validate enqueued payloads against the handlers in `handlers`. Jobs whose
    /// name has a registered handler get their payload checked at enqueue time,
    /// so a malformed payload is rejected up front instead of failing every
    /// attempt at execution time.
    pub fn with_validation(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Durably enqueue a job. Returns once the job is persisted.
    pub async fn enqueue(&self, queue: &str, req: EnqueueRequest) -> Result<JobHandle> {
        let handle = self.registry.queue(queue)?;
        if let Some(handlers) = &self.handlers {
            handlers.validate(&req.name, &req.payload)?;
        }

        let record = self.registry.store().enqueue(queue, &req, None).await?;
        handle.events.emit(EventKind::Waiting, record.id);
        info!(
            "[{}:{}] created, name={}",
            &record.queue, record.id, &record.name
        );
        debug!("[{}:{}] payload={}", &record.queue, record.id, &record.payload);
        Ok(JobHandle { id: record.id })
    }

    /// Convenience wrapper serialising a typed payload.
    pub async fn enqueue_payload<T: Serialize>(
        &self,
        queue: &str,
        name: &str,
        payload: &T,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue(queue, EnqueueRequest::new(name, payload)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    use crate::models::job::State;
    use crate::models::{queue, Error};
    use crate::store::{JobStore, MemoryStore};

    async fn producer() -> (Arc<QueueRegistry>, Producer) {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert("email".to_owned(), queue::Settings::default());
        let registry = Arc::new(QueueRegistry::new(store, queues).await.unwrap());
        (registry.clone(), Producer::new(registry))
    }

    #[tokio::test]
    async fn enqueue_persists_before_returning() {
        let (registry, producer) = producer().await;
        let handle = producer
            .enqueue(
                "email",
                EnqueueRequest::new("send-otp-email", serde_json::json!({"otp": "123456"})),
            )
            .await
            .unwrap();

        let record = registry.store().job(handle.id).await.unwrap();
        assert_eq!(record.state, State::Waiting);
        assert_eq!(record.name, "send-otp-email");
    }

    #[tokio::test]
    async fn enqueue_emits_waiting_event() {
        let (registry, producer) = producer().await;
        let handle = producer
            .enqueue("email", EnqueueRequest::new("job", serde_json::Value::Null))
            .await
            .unwrap();

        let events = registry.events("email").unwrap().snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Waiting);
        assert_eq!(events[0].job_id, handle.id);
    }

    #[tokio::test]
    async fn enqueue_to_unknown_queue() {
        let (_, producer) = producer().await;
        let result = producer
            .enqueue("nope", EnqueueRequest::new("job", serde_json::Value::Null))
            .await;
        assert_eq!(result, Err(Error::NoSuchQueue("nope".to_owned())));
    }
}
