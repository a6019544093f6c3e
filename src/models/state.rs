//! Defines server state, typically passed to HTTP handlers by Actix web as required.

use std::sync::Arc;

use crate::deadletter::DeadLetterRouter;
use crate::producer::Producer;
use crate::registry::QueueRegistry;

pub struct ApplicationState {
    pub registry: Arc<QueueRegistry>,
    pub producer: Producer,
    pub dead_letter: DeadLetterRouter,
    pub config: crate::config::Config,
}
