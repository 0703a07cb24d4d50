//! Background process configuration

use crate::ipc::PROTECTION_PAUSE_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Конфигурация фонового процесса (путь к БД, таймаут паузы, политика resync)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// SQLite file holding persisted settings
    pub db_path: PathBuf,

    /// Pause duration used when SET_PAUSE_EXPIRES carries no explicit duration
    pub pause_timeout_ms: u64,

    /// Complete an overdue pause immediately at startup instead of waiting
    /// for the first page navigation
    pub resync_on_startup: bool,

    /// Fallback `EnvFilter` directive when RUST_LOG is not set
    pub log_filter: String,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("protection-pause.db"),
            pause_timeout_ms: PROTECTION_PAUSE_TIMEOUT_MS,
            resync_on_startup: true,
            log_filter: "info".to_string(),
        }
    }
}

impl BackgroundConfig {
    pub const ENV_DB_PATH: &'static str = "PROTECTION_PAUSE_DB";
    pub const ENV_TIMEOUT_MS: &'static str = "PROTECTION_PAUSE_TIMEOUT_MS";
    pub const ENV_RESYNC_ON_STARTUP: &'static str = "PROTECTION_PAUSE_RESYNC_ON_STARTUP";

    /// Defaults overridden by environment variables. Unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(Self::ENV_DB_PATH) {
            if !path.trim().is_empty() {
                config.db_path = PathBuf::from(path);
            }
        }

        if let Some(raw) = lookup(Self::ENV_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.pause_timeout_ms = ms,
                _ => warn!(
                    "[CONFIG] Ignoring {}={:?}: expected a positive integer",
                    Self::ENV_TIMEOUT_MS,
                    raw
                ),
            }
        }

        if let Some(raw) = lookup(Self::ENV_RESYNC_ON_STARTUP) {
            match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => config.resync_on_startup = true,
                "0" | "false" | "no" => config.resync_on_startup = false,
                _ => warn!(
                    "[CONFIG] Ignoring {}={:?}: expected true/false",
                    Self::ENV_RESYNC_ON_STARTUP,
                    raw
                ),
            }
        }

        config
    }
}
