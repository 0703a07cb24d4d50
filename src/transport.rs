//! Message envelopes and the duplex port between a UI surface and the
//! background process.
//!
//! On the wire every message is `{ "type": ..., "data": [payload, ...] }`.
//! Envelopes are decoded into typed `Message` / `Notification` values; an
//! unknown `type` or a malformed payload is a protocol violation and is
//! returned as an error, never dropped.

use crate::error::{PauseError, PauseResult};
use crate::ipc::{events, messages};
use crate::models::{ConnectionRequest, PauseRequest, SettingUpdate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn empty(kind: impl Into<String>) -> Self {
        Self::new(kind, Vec::new())
    }

    fn payload<T: DeserializeOwned>(&self, index: usize) -> PauseResult<T> {
        let raw = self.data.get(index).ok_or_else(|| {
            PauseError::protocol(format!(
                "{}: missing payload at data[{}]",
                self.kind, index
            ))
        })?;
        serde_json::from_value(raw.clone()).map_err(|e| {
            PauseError::protocol(format!("{}: malformed data[{}]: {}", self.kind, index, e))
        })
    }
}

/// Notification bus event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifierEvent {
    #[serde(rename = "event.setting.updated")]
    SettingUpdated,
}

impl NotifierEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifierEvent::SettingUpdated => events::SETTING_UPDATED,
        }
    }
}

impl fmt::Display for NotifierEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifierEvent {
    type Err = PauseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            events::SETTING_UPDATED => Ok(NotifierEvent::SettingUpdated),
            other => Err(PauseError::protocol(format!(
                "Non supported event type: {}",
                other
            ))),
        }
    }
}

/// Event delivered to bus subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    SettingUpdated(SettingUpdate),
}

impl Notification {
    pub fn event(&self) -> NotifierEvent {
        match self {
            Notification::SettingUpdated(_) => NotifierEvent::SettingUpdated,
        }
    }

    pub fn to_envelope(&self) -> PauseResult<Envelope> {
        let payload = match self {
            Notification::SettingUpdated(update) => serde_json::to_value(update)?,
        };
        Ok(Envelope::new(self.event().as_str(), vec![payload]))
    }

    pub fn from_envelope(envelope: &Envelope) -> PauseResult<Self> {
        Self::decode(envelope.kind.parse()?, envelope, 0)
    }

    fn decode(event: NotifierEvent, envelope: &Envelope, index: usize) -> PauseResult<Self> {
        match event {
            NotifierEvent::SettingUpdated => {
                Ok(Notification::SettingUpdated(envelope.payload(index)?))
            }
        }
    }
}

/// Requests a surface can send to the background
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    GetPopupData,
    SetSetting(SettingUpdate),
    SetPauseExpires(PauseRequest),
    RemoveProtectionPauseTimer,
    AddLongLivedConnection(ConnectionRequest),
    NotifyListeners(Notification),
}

impl Message {
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::GetPopupData => messages::GET_POPUP_DATA,
            Message::SetSetting(_) => messages::SET_SETTING,
            Message::SetPauseExpires(_) => messages::SET_PAUSE_EXPIRES,
            Message::RemoveProtectionPauseTimer => messages::REMOVE_PROTECTION_PAUSE_TIMER,
            Message::AddLongLivedConnection(_) => messages::ADD_LONG_LIVED_CONNECTION,
            Message::NotifyListeners(_) => messages::NOTIFY_LISTENERS,
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> PauseResult<Self> {
        match envelope.kind.as_str() {
            messages::GET_POPUP_DATA => Ok(Message::GetPopupData),
            messages::SET_SETTING => Ok(Message::SetSetting(envelope.payload(0)?)),
            messages::SET_PAUSE_EXPIRES => {
                if envelope.data.is_empty() {
                    Ok(Message::SetPauseExpires(PauseRequest::default()))
                } else {
                    Ok(Message::SetPauseExpires(envelope.payload(0)?))
                }
            }
            messages::REMOVE_PROTECTION_PAUSE_TIMER => Ok(Message::RemoveProtectionPauseTimer),
            messages::ADD_LONG_LIVED_CONNECTION => {
                Ok(Message::AddLongLivedConnection(envelope.payload(0)?))
            }
            messages::NOTIFY_LISTENERS => {
                // data: [eventType, payload]
                let event: String = envelope.payload(0)?;
                let notification = Notification::decode(event.parse()?, envelope, 1)?;
                Ok(Message::NotifyListeners(notification))
            }
            other => Err(PauseError::protocol(format!(
                "Non supported message type: {}",
                other
            ))),
        }
    }

    pub fn to_envelope(&self) -> PauseResult<Envelope> {
        let data = match self {
            Message::GetPopupData | Message::RemoveProtectionPauseTimer => Vec::new(),
            Message::SetSetting(update) => vec![serde_json::to_value(update)?],
            Message::SetPauseExpires(request) => vec![serde_json::to_value(request)?],
            Message::AddLongLivedConnection(request) => vec![serde_json::to_value(request)?],
            Message::NotifyListeners(notification) => {
                let mut data = vec![Value::from(notification.event().as_str())];
                data.extend(notification.to_envelope()?.data);
                data
            }
        };
        Ok(Envelope::new(self.message_type(), data))
    }
}

pub type PortId = u64;

/// Items on the background's single inbound queue. One queue keeps RPCs and
/// port traffic from the same surface in FIFO order.
pub(crate) enum Inbound {
    Rpc {
        message: Message,
        reply: oneshot::Sender<PauseResult<Value>>,
    },
    PortConnected {
        id: PortId,
        name: String,
        sender: mpsc::UnboundedSender<Envelope>,
    },
    PortMessage {
        id: PortId,
        envelope: Envelope,
    },
    PortDisconnected {
        id: PortId,
    },
    Shutdown,
}

/// Surface end of a long-lived connection.
/// Dropping the port disconnects it; the background stops delivering to it.
pub struct Port {
    id: PortId,
    name: String,
    outbound: mpsc::UnboundedSender<Inbound>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        name: String,
        outbound: mpsc::UnboundedSender<Inbound>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            id,
            name,
            outbound,
            inbound,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post_message(&self, envelope: Envelope) -> PauseResult<()> {
        self.outbound
            .send(Inbound::PortMessage {
                id: self.id,
                envelope,
            })
            .map_err(|_| PauseError::Disconnected)
    }

    pub fn post(&self, message: &Message) -> PauseResult<()> {
        self.post_message(message.to_envelope()?)
    }

    /// Next envelope from the background; `None` once the background is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbound.try_recv().ok()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        debug!("[PORT] '{}' ({}) disconnecting", self.name, self.id);
        let _ = self.outbound.send(Inbound::PortDisconnected { id: self.id });
    }
}
