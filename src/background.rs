//! Background process: one serial event loop owning the settings store, the
//! notification bus and the pause controller. UI surfaces reach it only
//! through `BackgroundHandle` (one-shot RPC) and `Port`s (long-lived).

use crate::clock::Clock;
use crate::config::BackgroundConfig;
use crate::error::{PauseError, PauseResult};
use crate::host::{AlarmScheduler, TabEvents};
use crate::models::{PopupData, SettingUpdate};
use crate::notifier::{Notifier, SubscriberId};
use crate::pause::{HostEvent, ProtectionPause};
use crate::settings::{SettingsName, SettingsStore};
use crate::transport::{Envelope, Inbound, Message, Notification, NotifierEvent, Port, PortId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ConnectedPort {
    name: String,
    sender: mpsc::UnboundedSender<Envelope>,
    subscription: Option<SubscriberId>,
}

pub struct Background {
    settings: Arc<SettingsStore>,
    notifier: Arc<Notifier>,
    pause: ProtectionPause,
    config: BackgroundConfig,
    inbound_tx: Option<mpsc::UnboundedSender<Inbound>>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    host_rx: mpsc::UnboundedReceiver<HostEvent>,
    ports: HashMap<PortId, ConnectedPort>,
    next_port_id: Arc<AtomicU64>,
}

impl Background {
    pub fn new(
        settings: Arc<SettingsStore>,
        alarms: Arc<dyn AlarmScheduler>,
        tabs: Arc<dyn TabEvents>,
        clock: Arc<dyn Clock>,
        config: BackgroundConfig,
    ) -> Self {
        let notifier = Arc::new(Notifier::new());
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pause = ProtectionPause::new(
            settings.clone(),
            alarms,
            tabs,
            notifier.clone(),
            clock,
            host_tx,
        );

        Self {
            settings,
            notifier,
            pause,
            config,
            inbound_tx: Some(inbound_tx),
            inbound_rx,
            host_rx,
            ports: HashMap::new(),
            next_port_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn handle(&self) -> PauseResult<BackgroundHandle> {
        let tx = self.inbound_tx.clone().ok_or(PauseError::Disconnected)?;
        Ok(BackgroundHandle {
            tx,
            next_port_id: self.next_port_id.clone(),
        })
    }

    /// Spawn the event loop on the current tokio runtime
    pub fn spawn(self) -> PauseResult<(BackgroundHandle, JoinHandle<()>)> {
        let handle = self.handle()?;
        let task = tokio::spawn(self.run());
        Ok((handle, task))
    }

    pub async fn run(mut self) {
        // Только хэндлы держат очередь открытой
        self.inbound_tx = None;

        if let Err(e) = self.pause.restore(self.config.resync_on_startup).await {
            error!("[BACKGROUND] Failed to restore pause state: {}", e);
        }
        info!("[BACKGROUND] Event loop started");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.host_rx.recv() => {
                    if let Err(e) = self.pause.handle_host_event(&event).await {
                        error!("[BACKGROUND] Failed to handle {:?}: {}", event, e);
                    }
                }
                inbound = self.inbound_rx.recv() => match inbound {
                    Some(Inbound::Shutdown) | None => break,
                    Some(item) => self.handle_inbound(item).await,
                },
            }
        }

        self.pause.teardown();
        for (id, port) in self.ports.drain() {
            self.notifier.unsubscribe_port(id);
            debug!("[BACKGROUND] Port '{}' ({}) released", port.name, id);
        }
        info!("[BACKGROUND] Event loop stopped");
    }

    async fn handle_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Rpc { message, reply } => {
                let message_type = message.message_type();
                let result = self.handle_message(message).await;
                if let Err(e) = &result {
                    warn!("[BACKGROUND] {} rejected: {}", message_type, e);
                }
                let _ = reply.send(result);
            }
            Inbound::PortConnected { id, name, sender } => {
                info!("[BACKGROUND] Port '{}' ({}) connected", name, id);
                self.ports.insert(
                    id,
                    ConnectedPort {
                        name,
                        sender,
                        subscription: None,
                    },
                );
            }
            Inbound::PortMessage { id, envelope } => self.handle_port_message(id, envelope).await,
            Inbound::PortDisconnected { id } => {
                if let Some(port) = self.ports.remove(&id) {
                    let removed = self.notifier.unsubscribe_port(id);
                    info!(
                        "[BACKGROUND] Port '{}' ({}) disconnected, {} subscription(s) removed",
                        port.name, id, removed
                    );
                }
            }
            Inbound::Shutdown => {}
        }
    }

    async fn handle_port_message(&mut self, id: PortId, envelope: Envelope) {
        let message = match Message::from_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                // Нарушение протокола: соединение закрывается, чтобы ошибка была видна сразу
                error!("[BACKGROUND] Port {} sent invalid message: {}", id, e);
                self.drop_port(id);
                return;
            }
        };

        match message {
            Message::AddLongLivedConnection(request) => {
                let port = match self.ports.get_mut(&id) {
                    Some(port) => port,
                    None => {
                        warn!("[BACKGROUND] ADD_LONG_LIVED_CONNECTION from unknown port {}", id);
                        return;
                    }
                };
                if let Some(previous) = port.subscription.take() {
                    self.notifier.unsubscribe(previous);
                }
                port.subscription = Some(self.notifier.subscribe_port(
                    id,
                    &port.name,
                    port.sender.clone(),
                    request.events,
                ));
            }
            other => {
                let message_type = other.message_type();
                if let Err(e) = self.handle_message(other).await {
                    warn!("[BACKGROUND] {} from port {} failed: {}", message_type, id, e);
                }
            }
        }
    }

    fn drop_port(&mut self, id: PortId) {
        if let Some(port) = self.ports.remove(&id) {
            self.notifier.unsubscribe_port(id);
            warn!("[BACKGROUND] Port '{}' ({}) closed by background", port.name, id);
        }
    }

    async fn handle_message(&mut self, message: Message) -> PauseResult<Value> {
        match message {
            Message::GetPopupData => Ok(serde_json::to_value(PopupData {
                settings: self.settings.get_all(),
                pause: self.pause.status(),
            })?),
            Message::SetSetting(update) => {
                self.set_setting(update).await?;
                Ok(Value::Null)
            }
            Message::SetPauseExpires(request) => {
                let duration = request.duration_ms.unwrap_or(self.config.pause_timeout_ms);
                let expires = self.pause.pause(duration).await?;
                Ok(Value::from(expires))
            }
            Message::RemoveProtectionPauseTimer => {
                self.pause.resume().await?;
                Ok(Value::Null)
            }
            Message::AddLongLivedConnection(_) => Err(PauseError::protocol(
                "ADD_LONG_LIVED_CONNECTION is only valid on a port",
            )),
            Message::NotifyListeners(notification) => {
                let delivered = self.notifier.publish(&notification)?;
                Ok(Value::from(delivered))
            }
        }
    }

    /// Pause expiry writes go through the controller so it stays the only
    /// owner of the alarm.
    async fn set_setting(&mut self, update: SettingUpdate) -> PauseResult<()> {
        if update.key == SettingsName::ProtectionPauseExpires {
            let expires = update.value.as_i64().ok_or_else(|| {
                PauseError::invalid_setting(format!(
                    "'{}' expects an integer, got {}",
                    update.key, update.value
                ))
            })?;
            return if expires == 0 {
                self.pause.resume().await
            } else {
                self.pause.pause_until(expires).await
            };
        }

        let changed = self
            .settings
            .set_setting(update.key, update.value.clone())
            .await?;
        if changed {
            self.notifier
                .publish(&Notification::SettingUpdated(update))?;
        }
        Ok(())
    }
}

/// Cloneable entry point into the background process
#[derive(Clone)]
pub struct BackgroundHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    next_port_id: Arc<AtomicU64>,
}

impl BackgroundHandle {
    /// One-shot RPC. Errors come back as a rejected call.
    pub async fn send_message(&self, message: Message) -> PauseResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Rpc { message, reply })
            .map_err(|_| PauseError::Disconnected)?;
        rx.await.map_err(|_| PauseError::Disconnected)?
    }

    /// RPC from a raw wire envelope; an unknown type fails before sending
    pub async fn send_envelope(&self, envelope: &Envelope) -> PauseResult<Value> {
        let message = Message::from_envelope(envelope)?;
        self.send_message(message).await
    }

    /// Open a port. Nothing is delivered until ADD_LONG_LIVED_CONNECTION
    /// is posted on it.
    pub fn connect(&self, name: &str) -> PauseResult<Port> {
        let id = self.next_port_id.fetch_add(1, Ordering::Relaxed);
        let (sender, inbound) = mpsc::unbounded_channel();
        self.tx
            .send(Inbound::PortConnected {
                id,
                name: name.to_string(),
                sender,
            })
            .map_err(|_| PauseError::Disconnected)?;
        Ok(Port::new(id, name.to_string(), self.tx.clone(), inbound))
    }

    /// Convenience: connect and subscribe in one step
    pub fn subscribe(&self, name: &str, events: &[NotifierEvent]) -> PauseResult<Port> {
        let port = self.connect(name)?;
        port.post(&Message::AddLongLivedConnection(
            crate::models::ConnectionRequest {
                events: events.to_vec(),
            },
        ))?;
        Ok(port)
    }

    pub fn shutdown(&self) -> PauseResult<()> {
        self.tx
            .send(Inbound::Shutdown)
            .map_err(|_| PauseError::Disconnected)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}
