//! Host platform capabilities consumed by the background process.
//! Only their contracts matter to the controller; `TokioAlarms` and `Tabs`
//! are in-process implementations of those contracts.

mod alarms;
mod listeners;
mod tabs;

pub use alarms::TokioAlarms;
pub use listeners::{EventListeners, ListenerHandle};
pub use tabs::Tabs;

use crate::error::PauseResult;
use serde::{Deserialize, Serialize};

/// One-shot scheduled wake-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub name: String,
    /// Epoch millis
    pub scheduled_time: i64,
}

pub type AlarmListener = Box<dyn Fn(&Alarm) + Send + Sync>;

/// Host alarm scheduler contract.
/// At most one alarm per name is pending; `create` with an existing name
/// replaces it. An overdue alarm fires as soon as possible. A failed
/// `create` leaves the pending alarm of that name untouched.
pub trait AlarmScheduler: Send + Sync {
    fn create(&self, name: &str, when: i64) -> PauseResult<()>;
    /// Returns whether a pending alarm was removed
    fn clear(&self, name: &str) -> bool;
    fn get(&self, name: &str) -> Option<Alarm>;
    fn get_all(&self) -> Vec<Alarm>;
    fn on_alarm(&self, listener: AlarmListener) -> ListenerHandle;
}

/// Tab loading status reported by navigation events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
    #[serde(untagged)]
    Other(String),
}

impl TabStatus {
    pub fn is_navigation(&self) -> bool {
        matches!(self, TabStatus::Loading | TabStatus::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabUpdate {
    pub tab_id: i64,
    pub status: TabStatus,
}

pub type TabListener = Box<dyn Fn(&TabUpdate) + Send + Sync>;

/// Page-navigation observer contract
pub trait TabEvents: Send + Sync {
    fn on_updated(&self, listener: TabListener) -> ListenerHandle;
}
