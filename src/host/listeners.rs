use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Ordered registry of event listeners.
/// `add_listener` hands back a disposer; the listener stays registered exactly
/// as long as its `ListenerHandle` is alive.
pub struct EventListeners<T> {
    table: Arc<Mutex<ListenerTable<T>>>,
}

impl<T: 'static> EventListeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.table.lock() {
            Ok(mut table) => {
                let id = table.next_id;
                table.next_id += 1;
                table.entries.push((id, Arc::new(listener)));
                id
            }
            Err(e) => {
                error!("[LISTENERS] Mutex poisoned, listener not registered: {}", e);
                return ListenerHandle { remove: None };
            }
        };

        let weak: Weak<Mutex<ListenerTable<T>>> = Arc::downgrade(&self.table);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    if let Ok(mut table) = table.lock() {
                        table.entries.retain(|(entry_id, _)| *entry_id != id);
                    }
                }
            })),
        }
    }

    /// Calls every listener in registration order.
    /// The table lock is released before callbacks run, so a listener may
    /// add or remove listeners.
    pub fn dispatch(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = match self.table.lock() {
            Ok(table) => table.entries.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(e) => {
                error!("[LISTENERS] Mutex poisoned, dispatch skipped: {}", e);
                return 0;
            }
        };
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for EventListeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer returned by `EventListeners::add_listener`
#[must_use = "dropping the handle removes the listener immediately"]
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn remove(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
