use super::{EventListeners, ListenerHandle, TabEvents, TabListener, TabStatus, TabUpdate};
use tracing::debug;

/// In-process tab event source. The embedding host calls `notify_updated`
/// whenever a tab starts or finishes loading.
#[derive(Default)]
pub struct Tabs {
    on_updated: EventListeners<TabUpdate>,
}

impl Tabs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_updated(&self, tab_id: i64, status: TabStatus) -> usize {
        let update = TabUpdate { tab_id, status };
        let delivered = self.on_updated.dispatch(&update);
        debug!(
            "[TABS] tab {} status {:?} delivered to {} listener(s)",
            update.tab_id, update.status, delivered
        );
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.on_updated.len()
    }
}

impl TabEvents for Tabs {
    fn on_updated(&self, listener: TabListener) -> ListenerHandle {
        self.on_updated.add_listener(listener)
    }
}
