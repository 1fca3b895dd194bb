use std::io;
use thiserror::Error;
use std::str::Utf8Error;
use btleplug;
use serde_json;

use crate::device::types::GattStatus;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Config file handle is poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("This system has no bluetooth adapter that can scan")]
    BluetoothUnsupported,

    #[error("Connecting failed with status {status}")]
    ConnectFailed { status: GattStatus },

    #[error("The peripheral is not available to the adapter")]
    PeripheralNotFound,

    #[error("The repetition characteristic supports neither indications nor notifications")]
    NotifiableCharacteristicMissing,

    #[error("The platform did not complete {operation} in time")]
    DeadlineExceeded { operation: &'static str },

    #[error("The connection worker has stopped")]
    WorkerStopped,
}

impl DeviceError {
    /// The status a failed platform operation is reported with to the connection state machine.
    pub fn gatt_status(&self) -> GattStatus {
        match self {
            DeviceError::ConnectFailed { status } => *status,
            _ => GattStatus::ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed repetition payload ({reason}): {payload:?}")]
    MalformedPayload { reason: &'static str, payload: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("A repetition captured at {capture_time_ms} is already stored")]
    DuplicateKey { capture_time_ms: i64 },

    #[error("Failed to determine path to repetition store")]
    NoStorePath,

    #[error("Failed to acquire file lock on repetition store: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to read/write repetition store: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build repetition store: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (repetition store): {source}")]
    StoreError { #[from] source: StoreError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (runtime): {source}")]
    RuntimeError { #[from] source: io::Error },

    #[error("Failed to open LOG_FILE {path}: {source}")]
    LogFileError { path: String, source: io::Error },

    #[error("Failed to initialize logger: {source}")]
    LoggerError { #[from] source: log::SetLoggerError },
}
