use crate::clock::Clock;
use crate::host::{Alarm, AlarmScheduler, ListenerHandle, TabEvents, TabUpdate};
use crate::notifier::Notifier;
use crate::settings::SettingsStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
mod core;
mod restore;

/// Имя будильника совпадает с ключом настройки PROTECTION_PAUSE_EXPIRES
/// (одно имя на две подсистемы — совместимость с сохранённым состоянием)
pub const PAUSE_ALARM_NAME: &str = "protection-pause-expires";

/// Host events the controller listens to while a pause is armed.
/// Listener callbacks only enqueue these; the background loop hands them
/// back to the controller one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    AlarmFired(Alarm),
    TabUpdated(TabUpdate),
}

/// Protection Pause Controller - строгая FSM
/// Единственный владелец будильника паузы и слушателей навигации
pub struct ProtectionPause {
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) alarms: Arc<dyn AlarmScheduler>,
    pub(crate) tabs: Arc<dyn TabEvents>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) host_events: mpsc::UnboundedSender<HostEvent>,
    /// Слушатели установлены тогда и только тогда, когда состояние Paused
    pub(crate) state: PauseState,
}

pub(crate) enum PauseState {
    /// Пауза не действует (expires = 0)
    Active,
    /// Пауза до `expires`; слушатели живут вместе с состоянием
    Paused {
        expires: i64,
        listeners: ArmedListeners,
    },
}

/// Disposers for the listeners installed while paused.
/// `alarm` is `None` when restored past the deadline without re-arming:
/// only the navigation resync can end such a pause.
pub(crate) struct ArmedListeners {
    pub(crate) alarm: Option<ListenerHandle>,
    pub(crate) navigation: ListenerHandle,
}

/// Упрощенная версия состояния для API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "state")]
pub enum PauseStatus {
    Active,
    Paused { expires: i64, alarm_armed: bool },
}

impl ProtectionPause {
    pub fn new(
        settings: Arc<SettingsStore>,
        alarms: Arc<dyn AlarmScheduler>,
        tabs: Arc<dyn TabEvents>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        host_events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            settings,
            alarms,
            tabs,
            notifier,
            clock,
            host_events,
            state: PauseState::Active,
        }
    }

    pub fn status(&self) -> PauseStatus {
        match &self.state {
            PauseState::Active => PauseStatus::Active,
            PauseState::Paused { expires, listeners } => PauseStatus::Paused {
                expires: *expires,
                alarm_armed: listeners.alarm.is_some(),
            },
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, PauseState::Paused { .. })
    }
}
