use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{
    DEFAULT_STAGE_TIMEOUT, GATT_MAX_MTU_SIZE, OPENVBT_ADDRESS, SCAN_SETTLE_DELAY, SERVICE_DISCOVERY_DELAY,
};
use crate::device::machine::ConnectionSettings;
use crate::device::types::PeripheralIdentity;

/// What the sink does with a record whose capture time is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicatePolicy {
    /// Store the new record at the next free millisecond.
    Shift,
    /// Overwrite the stored record.
    Replace,
    /// Keep the stored record and drop the new one.
    Skip,
}

impl std::fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            DuplicatePolicy::Shift => "shift",
            DuplicatePolicy::Replace => "replace",
            DuplicatePolicy::Skip => "skip",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub peripheral_address: String,
    pub auto_reconnect: bool,
    pub cancel_while_connecting: bool,
    /// Bound on each connection stage, no bound when absent.
    pub stage_timeout_ms: Option<u64>,
    pub duplicate_policy: DuplicatePolicy,
    pub store_path: Option<PathBuf>,
}

impl Config {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            target: PeripheralIdentity::new(&self.peripheral_address),
            auto_reconnect: self.auto_reconnect,
            cancel_while_connecting: self.cancel_while_connecting,
            settle_delay: SCAN_SETTLE_DELAY,
            discovery_delay: SERVICE_DISCOVERY_DELAY,
            stage_timeout: self.stage_timeout_ms.map(Duration::from_millis),
            mtu: GATT_MAX_MTU_SIZE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peripheral_address: OPENVBT_ADDRESS.to_string(),
            auto_reconnect: true,
            cancel_while_connecting: true,
            stage_timeout_ms: Some(DEFAULT_STAGE_TIMEOUT.as_millis() as u64),
            duplicate_policy: DuplicatePolicy::Shift,
            store_path: None,
        }
    }
}
