//! Per-queue lifecycle event streams.
//!
//! Every queue has an [`EventHub`] that records job state transitions twice
//! over: a bounded in-memory log that evicts its oldest entries once the cap is
//! reached, and a lossy broadcast channel for live subscribers. Emitting never
//! blocks and never fails, so a slow or absent consumer cannot hold up workers.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::event::{EventKind, QueueEvent};

pub struct EventHub {
    cap: usize,
    log: Mutex<VecDeque<QueueEvent>>,
    sender: broadcast::Sender<QueueEvent>,
}

impl EventHub {
    /// Create a hub retaining at most `cap` events.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        let (sender, _) = broadcast::channel(cap);
        Self {
            cap,
            log: Mutex::new(VecDeque::with_capacity(cap)),
            sender,
        }
    }

    /// Record a state transition for a job. Evicts the oldest logged event if
    /// the log is at capacity. Live subscribers that have fallen behind lose
    /// events rather than applying backpressure.
    pub fn emit(&self, kind: EventKind, job_id: u64) {
        let event = QueueEvent::new(kind, job_id);
        {
            let mut log = self.log.lock().unwrap();
            if log.len() == self.cap {
                log.pop_front();
            }
            log.push_back(event.clone());
        }
        // send only errors when there are no subscribers
        let _ = self.sender.send(event);
    }

    /// The retained events, oldest first.
    pub fn snapshot(&self) -> Vec<QueueEvent> {
        self.log.lock().unwrap().iter().cloned().collect()
    }

    /// Subscribe to events emitted from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}
