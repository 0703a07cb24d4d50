use super::{ArmedListeners, HostEvent, PauseState, ProtectionPause, PAUSE_ALARM_NAME};
use crate::error::{PauseError, PauseResult};
use crate::host::{Alarm, TabUpdate};
use crate::models::SettingUpdate;
use crate::settings::SettingsName;
use crate::transport::Notification;
use tracing::{debug, error, info, warn};

impl ProtectionPause {
    /// Пауза защиты на `duration_ms` от текущего момента.
    /// Возвращает вычисленный момент окончания (epoch ms).
    pub async fn pause(&mut self, duration_ms: u64) -> PauseResult<i64> {
        if duration_ms == 0 || duration_ms > i64::MAX as u64 {
            return Err(PauseError::InvalidDuration(duration_ms));
        }
        let expires = self.clock.now_ms().saturating_add(duration_ms as i64);
        self.pause_until(expires).await?;
        Ok(expires)
    }

    /// Active → Paused (or Paused → Paused with a new deadline).
    /// Resolves only after the setting write and the alarm registration both
    /// succeeded; the broadcast goes out after that. On failure the previous
    /// state (its expiry, alarm and listeners) is left as it was.
    pub async fn pause_until(&mut self, expires: i64) -> PauseResult<()> {
        if expires <= 0 {
            return Err(PauseError::invalid_setting(format!(
                "pause expiry must be positive, got {}",
                expires
            )));
        }

        let previous = self.settings.protection_pause_expires();
        self.settings.set_protection_pause_expires(expires).await?;

        // create() с тем же именем заменяет будильник; при ошибке старый остаётся
        if let Err(e) = self.alarms.create(PAUSE_ALARM_NAME, expires) {
            error!("[PAUSE] Failed to arm alarm: {}. Restoring expiry {}.", e, previous);
            if let Err(rollback) = self.settings.set_protection_pause_expires(previous).await {
                warn!("[PAUSE] Rollback of expiry failed: {}", rollback);
                self.fall_back_to_resync(expires);
            }
            return Err(e);
        }

        // Повторная пауза заменяет предыдущую: старые слушатели снимаются
        // только после успешной записи и регистрации
        let listeners = self.install_listeners(true);
        if let PauseState::Paused { expires: old, .. } = std::mem::replace(
            &mut self.state,
            PauseState::Paused { expires, listeners },
        ) {
            info!("[PAUSE] Re-armed pause, previous deadline {} replaced", old);
        }
        info!(
            "[PAUSE] Protection paused until {} ({}ms from now)",
            expires,
            expires.saturating_sub(self.clock.now_ms())
        );

        self.broadcast(SettingUpdate::new(SettingsName::ProtectionPauseExpires, expires));
        Ok(())
    }

    /// The stored expiry could not be restored: keep only the navigation
    /// listener so the first page load after `expires` clears it.
    fn fall_back_to_resync(&mut self, expires: i64) {
        self.disarm();
        self.state = PauseState::Paused {
            expires,
            listeners: self.install_listeners(false),
        };
        warn!(
            "[PAUSE] Expiry {} persisted without an alarm, waiting for navigation resync",
            expires
        );
    }

    /// Досрочное возобновление защиты по запросу пользователя.
    /// Будильник и слушатели снимаются до записи настроек, поэтому
    /// запоздалое срабатывание не может вернуть паузу.
    pub async fn resume(&mut self) -> PauseResult<()> {
        if !self.disarm() {
            debug!("[PAUSE] resume() while active, normalizing settings only");
        }
        self.complete_pause().await?;
        info!("[PAUSE] Protection resumed by user");
        Ok(())
    }

    /// Срабатывание будильника. Чужие и устаревшие будильники игнорируются.
    /// Returns whether the pause was completed.
    pub async fn on_alarm_fired(&mut self, alarm: &Alarm) -> PauseResult<bool> {
        if alarm.name != PAUSE_ALARM_NAME {
            debug!("[PAUSE] Ignoring unrelated alarm '{}'", alarm.name);
            return Ok(false);
        }

        let expires = match &self.state {
            PauseState::Paused { expires, .. } => *expires,
            PauseState::Active => {
                debug!(
                    "[PAUSE] Alarm for {} fired while active, ignoring",
                    alarm.scheduled_time
                );
                return Ok(false);
            }
        };
        if alarm.scheduled_time != expires {
            debug!(
                "[PAUSE] Stale alarm for {} (current deadline {}), ignoring",
                alarm.scheduled_time, expires
            );
            return Ok(false);
        }

        // Сначала запись: при ошибке слушатель навигации остаётся и resync повторит попытку
        self.complete_pause().await?;
        self.disarm();
        info!("[PAUSE] Pause expired at {}, protection resumed", expires);
        Ok(true)
    }

    /// Resync on tab navigation: a stored deadline that already passed is
    /// cleared even if the alarm never fired (dormancy, missed event).
    /// Returns whether a stale pause was completed.
    pub async fn on_page_navigation(&mut self, update: &TabUpdate) -> PauseResult<bool> {
        if !update.status.is_navigation() {
            return Ok(false);
        }

        let expires = self.settings.protection_pause_expires();
        let now = self.clock.now_ms();
        if expires == 0 || expires > now {
            return Ok(false);
        }

        info!(
            "[PAUSE] Stale pause on tab {} navigation: expired at {}, now {}",
            update.tab_id, expires, now
        );
        self.complete_pause().await?;
        self.disarm();
        Ok(true)
    }

    pub async fn handle_host_event(&mut self, event: &HostEvent) -> PauseResult<bool> {
        match event {
            HostEvent::AlarmFired(alarm) => self.on_alarm_fired(alarm).await,
            HostEvent::TabUpdated(update) => self.on_page_navigation(update).await,
        }
    }

    /// Сбросить expiry и включить защиту; рассылка только по изменившимся ключам
    pub(crate) async fn complete_pause(&mut self) -> PauseResult<()> {
        let expires_changed = self.settings.set_protection_pause_expires(0).await?;
        let enabled_changed = self.settings.set_protection(true).await?;

        if expires_changed {
            self.broadcast(SettingUpdate::new(SettingsName::ProtectionPauseExpires, 0i64));
        }
        if enabled_changed {
            self.broadcast(SettingUpdate::new(SettingsName::ProtectionEnabled, true));
        }
        Ok(())
    }

    /// Paused → Active: drops the listeners and clears the alarm.
    /// Returns whether a pause was armed.
    pub(crate) fn disarm(&mut self) -> bool {
        match std::mem::replace(&mut self.state, PauseState::Active) {
            PauseState::Paused { listeners, .. } => {
                drop(listeners);
                self.alarms.clear(PAUSE_ALARM_NAME);
                true
            }
            PauseState::Active => false,
        }
    }

    pub(crate) fn install_listeners(&self, with_alarm: bool) -> ArmedListeners {
        let alarm = with_alarm.then(|| {
            let tx = self.host_events.clone();
            self.alarms.on_alarm(Box::new(move |alarm| {
                if alarm.name == PAUSE_ALARM_NAME {
                    let _ = tx.send(HostEvent::AlarmFired(alarm.clone()));
                }
            }))
        });

        let tx = self.host_events.clone();
        let navigation = self.tabs.on_updated(Box::new(move |update| {
            if update.status.is_navigation() {
                let _ = tx.send(HostEvent::TabUpdated(update.clone()));
            }
        }));

        ArmedListeners { alarm, navigation }
    }

    fn broadcast(&self, update: SettingUpdate) {
        if let Err(e) = self.notifier.publish(&Notification::SettingUpdated(update)) {
            error!("[PAUSE] Failed to broadcast setting update: {}", e);
        }
    }
}
