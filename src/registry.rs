//! Queue registry.
//!
//! Queues are declared up front, typically from configuration, and registered
//! once at startup. The registry owns the shared [`JobStore`] handle and a
//! per-queue [`EventHub`], and is the single place the rest of the application
//! resolves queue names through. There is no runtime queue creation or removal.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::events::EventHub;
use crate::models::{queue, Error, Result};
use crate::store::JobStore;

pub struct QueueHandle {
    pub name: String,
    pub settings: queue::Settings,
    pub events: EventHub,
}

pub struct QueueRegistry {
    store: Arc<dyn JobStore>,
    queues: HashMap<String, QueueHandle>,
}

impl QueueRegistry {
    /// Register the given queues in the store and build handles for them. The
    /// dead-letter queue is always present, with its default settings unless
    /// explicitly configured, since failed jobs from any queue are routed to it.
    pub async fn new(
        store: Arc<dyn JobStore>,
        mut queues: HashMap<String, queue::Settings>,
    ) -> Result<Self> {
        queues
            .entry(queue::names::DEAD_LETTER.to_owned())
            .or_insert_with(queue::Settings::dead_letter);

        let mut handles = HashMap::with_capacity(queues.len());
        for (name, settings) in queues {
            if !queue::is_valid_name(&name) {
                return Err(Error::bad_request(format!("Invalid queue name: {}", name)));
            }
            let created = store.register_queue(&name, &settings).await?;
            info!(
                "{} queue '{}' (max_attempts={}, timeout={})",
                if created { "Created" } else { "Updated" },
                name,
                settings.max_attempts,
                settings.timeout
            );
            handles.insert(
                name.clone(),
                QueueHandle {
                    name: name.clone(),
                    events: EventHub::new(settings.event_stream_cap),
                    settings,
                },
            );
        }

        Ok(Self {
            store,
            queues: handles,
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self, name: &str) -> Result<&QueueHandle> {
        self.queues
            .get(name)
            .ok_or_else(|| Error::NoSuchQueue(name.to_owned()))
    }

    pub fn events(&self, name: &str) -> Result<&EventHub> {
        Ok(&self.queue(name)?.events)
    }

    /// Sorted names of all registered queues.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Duration;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn dead_letter_queue_always_registered() {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert(queue::names::EMAIL.to_owned(), queue::Settings::default());
        let registry = QueueRegistry::new(store, queues).await.unwrap();

        assert_eq!(registry.names(), vec!["dead_letter", "email"]);
        let dlq = registry.queue(queue::names::DEAD_LETTER).unwrap();
        assert_eq!(dlq.settings.retention.failed, Duration::from_secs(60 * 24 * 3600));
    }

    #[tokio::test]
    async fn configured_dead_letter_settings_win() {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert(
            queue::names::DEAD_LETTER.to_owned(),
            queue::Settings {
                max_attempts: 2,
                ..queue::Settings::dead_letter()
            },
        );
        let registry = QueueRegistry::new(store, queues).await.unwrap();
        assert_eq!(
            registry.queue(queue::names::DEAD_LETTER).unwrap().settings.max_attempts,
            2
        );
    }

    #[tokio::test]
    async fn unknown_queue_lookup() {
        let store = Arc::new(MemoryStore::new());
        let registry = QueueRegistry::new(store, HashMap::new()).await.unwrap();
        assert!(matches!(registry.queue("email"), Err(Error::NoSuchQueue(_))));
    }

    #[tokio::test]
    async fn invalid_queue_name_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert("bad name".to_owned(), queue::Settings::default());
        assert!(matches!(
            QueueRegistry::new(store, queues).await,
            Err(Error::BadRequest(_))
        ));
    }
}
