//! Notification bus: fans a state-change event out to every interested
//! subscriber, open ports and in-process listeners alike.

use crate::error::PauseResult;
use crate::transport::{Envelope, Notification, NotifierEvent, PortId};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub type SubscriberId = u64;

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Port {
        port_id: PortId,
        name: String,
        sender: mpsc::UnboundedSender<Envelope>,
    },
    Callback(Callback),
}

struct Subscriber {
    id: SubscriberId,
    events: HashSet<NotifierEvent>,
    sink: Sink,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: SubscriberId,
    /// Registration order is delivery order
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
pub struct Notifier {
    table: Mutex<SubscriberTable>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, events: HashSet<NotifierEvent>, sink: Sink) -> SubscriberId {
        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => {
                error!("[NOTIFIER] Subscriber table poisoned, recovering");
                poisoned.into_inner()
            }
        };
        table.next_id += 1;
        let id = table.next_id;
        table.subscribers.push(Subscriber { id, events, sink });
        id
    }

    /// Subscribe an open port. Its envelopes go to `sender`.
    pub fn subscribe_port(
        &self,
        port_id: PortId,
        name: &str,
        sender: mpsc::UnboundedSender<Envelope>,
        events: impl IntoIterator<Item = NotifierEvent>,
    ) -> SubscriberId {
        let events: HashSet<NotifierEvent> = events.into_iter().collect();
        debug!(
            "[NOTIFIER] Port '{}' ({}) subscribed to {:?}",
            name, port_id, events
        );
        self.insert(
            events,
            Sink::Port {
                port_id,
                name: name.to_string(),
                sender,
            },
        )
    }

    /// Subscribe long-running background logic
    pub fn add_listener<F>(
        &self,
        events: impl IntoIterator<Item = NotifierEvent>,
        listener: F,
    ) -> SubscriberId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.insert(events.into_iter().collect(), Sink::Callback(Arc::new(listener)))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.table.lock() {
            Ok(mut table) => {
                let before = table.subscribers.len();
                table.subscribers.retain(|s| s.id != id);
                table.subscribers.len() < before
            }
            Err(e) => {
                error!("[NOTIFIER] Failed to unsubscribe {}: {}", id, e);
                false
            }
        }
    }

    /// Drop every subscription held by a port
    pub fn unsubscribe_port(&self, port_id: PortId) -> usize {
        match self.table.lock() {
            Ok(mut table) => {
                let before = table.subscribers.len();
                table
                    .subscribers
                    .retain(|s| !matches!(&s.sink, Sink::Port { port_id: p, .. } if *p == port_id));
                before - table.subscribers.len()
            }
            Err(e) => {
                error!("[NOTIFIER] Failed to unsubscribe port {}: {}", port_id, e);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.table.lock().map(|t| t.subscribers.len()).unwrap_or(0)
    }

    /// Deliver synchronously to every subscriber of the event, in
    /// registration order. Returns the number of successful deliveries.
    /// A closed port or a panicking listener is logged and skipped (panics are
    /// caught only when built with unwinding, the default profile); closed
    /// ports are pruned afterwards.
    pub fn publish(&self, notification: &Notification) -> PauseResult<usize> {
        let event = notification.event();
        let envelope = notification.to_envelope()?;

        // Snapshot so callbacks may (un)subscribe without deadlocking
        let targets: Vec<(SubscriberId, Sink)> = match self.table.lock() {
            Ok(table) => table
                .subscribers
                .iter()
                .filter(|s| s.events.contains(&event))
                .map(|s| (s.id, s.sink.clone()))
                .collect(),
            Err(e) => {
                error!("[NOTIFIER] Subscriber table poisoned, publish skipped: {}", e);
                return Ok(0);
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in targets {
            match sink {
                Sink::Port {
                    port_id,
                    name,
                    sender,
                } => {
                    if sender.send(envelope.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        warn!(
                            "[NOTIFIER] Port '{}' ({}) is closed, dropping subscriber",
                            name, port_id
                        );
                        dead.push(id);
                    }
                }
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                        Ok(()) => delivered += 1,
                        Err(_) => error!("[NOTIFIER] Listener {} panicked on {}", id, event),
                    }
                }
            }
        }

        for id in dead {
            self.unsubscribe(id);
        }
        debug!("[NOTIFIER] {} delivered to {} subscriber(s)", event, delivered);
        Ok(delivered)
    }
}
