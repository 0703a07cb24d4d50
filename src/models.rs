use crate::pause::PauseStatus;
use crate::settings::SettingsName;
use crate::transport::NotifierEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `{key, value}` payload of SET_SETTING and SETTING_UPDATED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingUpdate {
    pub key: SettingsName,
    pub value: Value,
}

impl SettingUpdate {
    pub fn new(key: SettingsName, value: impl Into<Value>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// SET_PAUSE_EXPIRES payload. Without a duration the configured timeout applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl PauseRequest {
    pub fn for_duration(duration_ms: u64) -> Self {
        Self {
            duration_ms: Some(duration_ms),
        }
    }
}

/// ADD_LONG_LIVED_CONNECTION payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub events: Vec<NotifierEvent>,
}

/// GET_POPUP_DATA response
#[derive(Debug, Clone, Serialize)]
pub struct PopupData {
    pub settings: BTreeMap<SettingsName, Value>,
    pub pause: PauseStatus,
}
