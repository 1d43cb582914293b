use std::sync::Arc;

use crate::events::EventBus;
use crate::notify::{LogNotifier, Notifier};

/// Collaborators shared by every component: the event bus and the
/// notification hand-off.
#[derive(Clone)]
pub struct ServiceContext {
    pub events: EventBus,
    pub notifier: Arc<dyn Notifier>,
}

impl ServiceContext {
    pub fn new(events: EventBus, notifier: Arc<dyn Notifier>) -> Self {
        Self { events, notifier }
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new(EventBus::new(), Arc::new(LogNotifier))
    }
}
