//! Centralized message and event names shared by the background and UI surfaces.
//! Prevents typos and keeps the wire identifiers in one place.

/// Notification bus event names (background publish ↔ surface listen)
pub mod events {
    pub const SETTING_UPDATED: &str = "event.setting.updated";
}

/// Message types (surface → background)
pub mod messages {
    pub const GET_POPUP_DATA: &str = "GET_POPUP_DATA";
    pub const SET_SETTING: &str = "SET_SETTING";
    pub const SET_PAUSE_EXPIRES: &str = "SET_PAUSE_EXPIRES";
    pub const REMOVE_PROTECTION_PAUSE_TIMER: &str = "REMOVE_PROTECTION_PAUSE_TIMER";
    pub const ADD_LONG_LIVED_CONNECTION: &str = "ADD_LONG_LIVED_CONNECTION";
    pub const NOTIFY_LISTENERS: &str = "NOTIFY_LISTENERS";
}

/// Surface names used when opening long-lived connections
pub mod surfaces {
    pub const POPUP: &str = "popup";
    pub const OPTIONS: &str = "options";
}

pub const MILLISECONDS_IN_SECOND: u64 = 1_000;
pub const PROTECTION_PAUSE_TIMEOUT_S: u64 = 30;
pub const PROTECTION_PAUSE_TIMEOUT_TICK_S: u64 = 1;
pub const PROTECTION_PAUSE_TIMEOUT_MS: u64 = PROTECTION_PAUSE_TIMEOUT_S * MILLISECONDS_IN_SECOND;
pub const PROTECTION_PAUSE_TIMEOUT_TICK_MS: u64 =
    PROTECTION_PAUSE_TIMEOUT_TICK_S * MILLISECONDS_IN_SECOND;
