//! Protection pause for a content-blocking browser extension.
//!
//! The background process owns the settings and the pause timer; popup and
//! options surfaces talk to it through one-shot RPCs and long-lived
//! connections that receive SETTING_UPDATED broadcasts.

mod background;
mod clock;
mod config;
mod connection;
mod database;
mod error;
mod host;
pub mod ipc;
mod models;
mod notifier;
mod pause;
mod settings;
mod surface;
mod transport;

#[cfg(test)]
mod tests;

pub use background::{Background, BackgroundHandle};
pub use clock::{Clock, SystemClock};
pub use config::BackgroundConfig;
pub use connection::LongLivedConnection;
pub use database::Database;
pub use error::{PauseError, PauseResult};
pub use host::{
    Alarm, AlarmListener, AlarmScheduler, EventListeners, ListenerHandle, TabEvents, TabListener,
    TabStatus, TabUpdate, Tabs, TokioAlarms,
};
pub use models::{ConnectionRequest, PauseRequest, PopupData, SettingUpdate};
pub use notifier::{Notifier, SubscriberId};
pub use pause::{HostEvent, PauseStatus, ProtectionPause, PAUSE_ALARM_NAME};
pub use settings::{SettingKind, SettingsBackend, SettingsName, SettingsStore};
pub use surface::{spawn_countdown, PauseCountdown, SurfaceState};
pub use transport::{Envelope, Message, Notification, NotifierEvent, Port, PortId};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Инициализация логирования: RUST_LOG, если задан, иначе `default_filter`.
/// Повторный вызов ничего не делает.
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("[SETUP] Logging already initialized");
    }
}

/// A running background process together with the host capabilities the
/// embedding code drives (tab events, alarms).
pub struct Extension {
    pub handle: BackgroundHandle,
    pub tabs: Arc<Tabs>,
    pub alarms: TokioAlarms,
    pub settings: Arc<SettingsStore>,
    pub notifier: Arc<Notifier>,
    task: JoinHandle<()>,
}

impl Extension {
    /// Stop the event loop and wait for it to release its listeners
    pub async fn shutdown(self) -> PauseResult<()> {
        if let Err(e) = self.handle.shutdown() {
            error!("[SHUTDOWN] Background already stopped: {}", e);
        }
        self.task.await?;
        info!("[SHUTDOWN] Background stopped");
        Ok(())
    }
}

/// Open the settings database and start the background event loop on the
/// current tokio runtime.
pub async fn launch(config: BackgroundConfig) -> PauseResult<Extension> {
    init_logging(&config.log_filter);

    let db_path = config.db_path.clone();
    let database = tokio::task::spawn_blocking(move || Database::new(&db_path.to_string_lossy())).await??;
    info!("[SETUP] Settings database at {}", config.db_path.display());

    let settings = Arc::new(SettingsStore::open(Arc::new(database))?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alarms = TokioAlarms::new(clock.clone());
    let tabs = Arc::new(Tabs::new());

    let background = Background::new(
        settings.clone(),
        Arc::new(alarms.clone()),
        tabs.clone(),
        clock,
        config,
    );
    let notifier = background.notifier();
    let (handle, task) = background.spawn()?;

    Ok(Extension {
        handle,
        tabs,
        alarms,
        settings,
        notifier,
        task,
    })
}
