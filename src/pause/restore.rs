use super::{PauseState, ProtectionPause, PAUSE_ALARM_NAME};
use crate::error::PauseResult;
use tracing::info;

impl ProtectionPause {
    /// Восстановить состояние паузы из настроек при старте процесса
    /// - expiry = 0: пауза не действует
    /// - expiry в будущем: заново ставим будильник и слушатели
    /// - expiry в прошлом: завершаем паузу сразу (`resync_on_startup`)
    ///   или ждём первой навигации
    pub async fn restore(&mut self, resync_on_startup: bool) -> PauseResult<()> {
        let expires = self.settings.protection_pause_expires();
        let now = self.clock.now_ms();

        if expires == 0 {
            info!("[RECOVERY] No pause in effect");
            return Ok(());
        }

        if expires > now {
            self.alarms.create(PAUSE_ALARM_NAME, expires)?;
            self.state = PauseState::Paused {
                expires,
                listeners: self.install_listeners(true),
            };
            info!(
                "[RECOVERY] Pause restored, {}ms left (expires {})",
                expires - now,
                expires
            );
            return Ok(());
        }

        if resync_on_startup {
            info!(
                "[RECOVERY] Pause expired at {} while dormant, completing now",
                expires
            );
            self.complete_pause().await
        } else {
            // Без будильника: паузу закроет первая навигация
            self.state = PauseState::Paused {
                expires,
                listeners: self.install_listeners(false),
            };
            info!(
                "[RECOVERY] Pause expired at {} while dormant, waiting for first navigation",
                expires
            );
            Ok(())
        }
    }

    /// Снять все слушатели перед завершением процесса.
    /// The host alarm and the persisted expiry stay: `restore` picks them up.
    pub fn teardown(&mut self) {
        if let PauseState::Paused { expires, .. } =
            std::mem::replace(&mut self.state, PauseState::Active)
        {
            info!("[SHUTDOWN] Listeners removed, pause until {} persisted", expires);
        }
    }
}
