use std::sync::Arc;

use ekspose_core::{EventHandler, WatchEvent};
use ekspose_queue::DispatchQueue;
use tracing::trace;

/// Collapses every change notification to its logical key and enqueues it.
/// The payload is never acted upon: workers re-read current state.
pub struct ChangeListener {
    queue: Arc<DispatchQueue>,
}

impl ChangeListener {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        Self { queue }
    }
}

impl EventHandler for ChangeListener {
    fn on_event(&self, event: &WatchEvent) {
        let key = event.key();
        let kind = match event {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
        };
        trace!(key = %key, kind, "enqueue");
        self.queue.enqueue(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekspose_core::{ControllerConfig, LogicalKey, PrimaryObject};
    use ekspose_queue::KeyState;

    #[test]
    fn every_event_kind_enqueues_the_key_once() {
        let queue = Arc::new(DispatchQueue::from_config("test", &ControllerConfig::default()));
        let listener = ChangeListener::new(Arc::clone(&queue));
        let obj = PrimaryObject { namespace: "app".into(), name: "web".into(), ..Default::default() };
        listener.on_event(&WatchEvent::Added(obj.clone()));
        listener.on_event(&WatchEvent::Updated(obj.clone()));
        listener.on_event(&WatchEvent::Deleted(obj));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state(&LogicalKey::new("app", "web")), KeyState::Queued);
    }
}
