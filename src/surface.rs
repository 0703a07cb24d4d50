//! Local state of a UI surface (popup, options page). It mirrors settings
//! from SETTING_UPDATED notifications and counts the pause down on its own;
//! the authoritative expiry stays in the background.

use crate::clock::Clock;
use crate::error::{PauseError, PauseResult};
use crate::ipc::{MILLISECONDS_IN_SECOND, PROTECTION_PAUSE_TIMEOUT_TICK_MS};
use crate::settings::SettingsName;
use crate::transport::Notification;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseCountdown {
    expires: i64,
}

impl PauseCountdown {
    pub fn new(expires: i64) -> Self {
        Self { expires }
    }

    pub fn expires(&self) -> i64 {
        self.expires
    }

    /// Whole seconds left, rounded up; 0 once the deadline is reached
    pub fn remaining_secs(&self, now_ms: i64) -> u64 {
        let left_ms = self.expires.saturating_sub(now_ms);
        if left_ms <= 0 {
            0
        } else {
            (left_ms as u64).div_ceil(MILLISECONDS_IN_SECOND)
        }
    }
}

#[derive(Debug, Default)]
pub struct SurfaceState {
    settings: HashMap<SettingsName, Value>,
    countdown: Option<PauseCountdown>,
}

impl SurfaceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a GET_POPUP_DATA response
    pub fn from_popup_data(data: &Value, now_ms: i64) -> PauseResult<Self> {
        let settings = data
            .get("settings")
            .and_then(Value::as_object)
            .ok_or_else(|| PauseError::protocol("GET_POPUP_DATA: missing settings"))?;

        let mut state = Self::new();
        for (key, value) in settings {
            match key.parse::<SettingsName>() {
                Ok(name) => state.set_local(name, value.clone(), now_ms),
                Err(_) => warn!("[SURFACE] Ignoring unknown setting '{}'", key),
            }
        }
        Ok(state)
    }

    pub fn apply(&mut self, notification: &Notification, now_ms: i64) {
        match notification {
            Notification::SettingUpdated(update) => {
                self.set_local(update.key, update.value.clone(), now_ms)
            }
        }
    }

    fn set_local(&mut self, name: SettingsName, value: Value, now_ms: i64) {
        if name == SettingsName::ProtectionPauseExpires {
            let expires = value.as_i64().unwrap_or(0);
            self.countdown = (expires > now_ms).then(|| PauseCountdown::new(expires));
        }
        self.settings.insert(name, value);
    }

    pub fn setting(&self, name: SettingsName) -> Option<&Value> {
        self.settings.get(&name)
    }

    pub fn protection_enabled(&self) -> bool {
        self.settings
            .get(&SettingsName::ProtectionEnabled)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn countdown(&self) -> Option<PauseCountdown> {
        self.countdown
    }

    /// Seconds shown in "protection will be resumed after N s"
    pub fn protection_paused_timer(&self, now_ms: i64) -> u64 {
        self.countdown.map(|c| c.remaining_secs(now_ms)).unwrap_or(0)
    }

    pub fn is_paused(&self, now_ms: i64) -> bool {
        !self.protection_enabled() || self.protection_paused_timer(now_ms) > 0
    }

    /// Advance the local countdown; drops it once it reaches zero
    pub fn tick(&mut self, now_ms: i64) -> u64 {
        let remaining = self.protection_paused_timer(now_ms);
        if remaining == 0 {
            self.countdown = None;
        }
        remaining
    }
}

/// Tick once per second until the countdown reaches zero, without any
/// round-trip to the background. The last call reports 0.
pub fn spawn_countdown<F>(countdown: PauseCountdown, clock: Arc<dyn Clock>, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut(u64) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(PROTECTION_PAUSE_TIMEOUT_TICK_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let remaining = countdown.remaining_secs(clock.now_ms());
            on_tick(remaining);
            if remaining == 0 {
                debug!("[SURFACE] Countdown to {} finished", countdown.expires());
                break;
            }
        }
    })
}
