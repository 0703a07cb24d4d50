//! Persistent settings store: typed names, an in-memory cache and a
//! write-through backend. The cache only changes after the backend confirms
//! the write, so anyone notified of a change can re-read it immediately.

use crate::database::Database;
use crate::error::{PauseError, PauseResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettingsName {
    #[serde(rename = "protection-enabled")]
    ProtectionEnabled,
    /// Also the name of the pause alarm
    #[serde(rename = "protection-pause-expires")]
    ProtectionPauseExpires,
    #[serde(rename = "wizard-enabled")]
    WizardEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Integer,
}

impl SettingsName {
    pub const ALL: [SettingsName; 3] = [
        SettingsName::ProtectionEnabled,
        SettingsName::ProtectionPauseExpires,
        SettingsName::WizardEnabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsName::ProtectionEnabled => "protection-enabled",
            SettingsName::ProtectionPauseExpires => "protection-pause-expires",
            SettingsName::WizardEnabled => "wizard-enabled",
        }
    }

    pub fn kind(&self) -> SettingKind {
        match self {
            SettingsName::ProtectionEnabled | SettingsName::WizardEnabled => SettingKind::Bool,
            SettingsName::ProtectionPauseExpires => SettingKind::Integer,
        }
    }

    /// Install-time value
    pub fn default_value(&self) -> Value {
        match self {
            SettingsName::ProtectionEnabled => Value::Bool(true),
            SettingsName::ProtectionPauseExpires => Value::from(0i64),
            SettingsName::WizardEnabled => Value::Bool(true),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.kind() {
            SettingKind::Bool => value.is_boolean(),
            SettingKind::Integer => value.is_i64(),
        }
    }
}

impl fmt::Display for SettingsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingsName {
    type Err = PauseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingsName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| PauseError::invalid_setting(format!("Unknown setting '{}'", s)))
    }
}

/// Durable key/value storage behind the settings cache
pub trait SettingsBackend: Send + Sync {
    fn load_all(&self) -> PauseResult<HashMap<String, String>>;
    fn save(&self, key: &str, value_json: &str) -> PauseResult<()>;
}

impl SettingsBackend for Database {
    fn load_all(&self) -> PauseResult<HashMap<String, String>> {
        Ok(self.load_settings()?)
    }

    fn save(&self, key: &str, value_json: &str) -> PauseResult<()> {
        Ok(self.save_setting(key, value_json)?)
    }
}

pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    cache: RwLock<HashMap<SettingsName, Value>>,
}

impl SettingsStore {
    /// Load persisted settings over the defaults. Unknown keys and values of
    /// the wrong type are skipped, never fatal.
    pub fn open(backend: Arc<dyn SettingsBackend>) -> PauseResult<Self> {
        let mut cache: HashMap<SettingsName, Value> = SettingsName::ALL
            .iter()
            .map(|name| (*name, name.default_value()))
            .collect();

        for (key, raw) in backend.load_all()? {
            let name = match key.parse::<SettingsName>() {
                Ok(name) => name,
                Err(_) => {
                    warn!("[SETTINGS] Ignoring unknown persisted setting '{}'", key);
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) if name.accepts(&value) => {
                    cache.insert(name, value);
                }
                _ => warn!(
                    "[SETTINGS] Ignoring invalid persisted value for '{}': {}",
                    key, raw
                ),
            }
        }

        Ok(Self {
            backend,
            cache: RwLock::new(cache),
        })
    }

    pub fn get(&self, name: SettingsName) -> Value {
        match self.cache.read() {
            Ok(cache) => cache
                .get(&name)
                .cloned()
                .unwrap_or_else(|| name.default_value()),
            Err(e) => {
                warn!("[SETTINGS] Cache lock poisoned, using default: {}", e);
                name.default_value()
            }
        }
    }

    pub fn get_setting<T: DeserializeOwned>(&self, name: SettingsName) -> PauseResult<T> {
        Ok(serde_json::from_value(self.get(name))?)
    }

    pub fn get_bool(&self, name: SettingsName) -> bool {
        self.get(name).as_bool().unwrap_or(false)
    }

    pub fn get_i64(&self, name: SettingsName) -> i64 {
        self.get(name).as_i64().unwrap_or(0)
    }

    pub fn protection_enabled(&self) -> bool {
        self.get_bool(SettingsName::ProtectionEnabled)
    }

    pub fn protection_pause_expires(&self) -> i64 {
        self.get_i64(SettingsName::ProtectionPauseExpires)
    }

    pub fn get_all(&self) -> BTreeMap<SettingsName, Value> {
        SettingsName::ALL
            .iter()
            .map(|name| (*name, self.get(*name)))
            .collect()
    }

    /// Filtering runs when protection is on and no pause is in the future.
    /// A completed pause may only broadcast the expiry reset, so surfaces
    /// derive the paused state from the expiry, not from `protection-enabled`.
    pub fn is_protection_active(&self, now_ms: i64) -> bool {
        let expires = self.protection_pause_expires();
        self.protection_enabled() && (expires == 0 || expires <= now_ms)
    }

    /// Persist a setting. Returns whether the value changed.
    /// The write is a suspension point: it runs on the blocking pool and the
    /// cache is updated only once the backend confirms it.
    pub async fn set_setting(&self, name: SettingsName, value: Value) -> PauseResult<bool> {
        if !name.accepts(&value) {
            return Err(PauseError::invalid_setting(format!(
                "'{}' expects {:?}, got {}",
                name,
                name.kind(),
                value
            )));
        }

        let value_json = serde_json::to_string(&value)?;
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.save(name.as_str(), &value_json)).await??;

        let previous = match self.cache.write() {
            Ok(mut cache) => cache.insert(name, value.clone()),
            Err(e) => {
                return Err(PauseError::Task(format!("Settings cache poisoned: {}", e)));
            }
        };
        let changed = previous.as_ref() != Some(&value);
        debug!(
            "[SETTINGS] {} = {} ({})",
            name,
            value,
            if changed { "changed" } else { "unchanged" }
        );
        Ok(changed)
    }

    pub async fn set_protection(&self, enabled: bool) -> PauseResult<bool> {
        self.set_setting(SettingsName::ProtectionEnabled, Value::Bool(enabled))
            .await
    }

    pub async fn set_protection_pause_expires(&self, expires: i64) -> PauseResult<bool> {
        self.set_setting(SettingsName::ProtectionPauseExpires, Value::from(expires))
            .await
    }
}
