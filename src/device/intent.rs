use futures::channel::mpsc::Sender;
use futures::SinkExt;
use tokio::sync::watch;

use crate::device::types::ConnectionState;
use crate::error::DeviceError;

/// Latest state published by the connection worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub desired: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus {
            state: ConnectionState::Idle,
            desired: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    SetDesired(bool),
    /// Flip the intent as seen by the worker at the time the command is handled.
    Toggle,
    PermissionChanged(bool),
    BluetoothEnabledChanged(bool),
}

/// Handle through which the user side drives the connection worker.
#[derive(Clone)]
pub struct ConnectionIntent {
    commands: Sender<DeviceCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionIntent {
    pub(crate) fn new(commands: Sender<DeviceCommand>, status: watch::Receiver<ConnectionStatus>) -> Self {
        ConnectionIntent { commands, status }
    }

    async fn send(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
        self.commands.send(command).await.map_err(|_| DeviceError::WorkerStopped)
    }

    /// Asks the worker to connect (`true`) or to disconnect (`false`).
    pub async fn set_desired(&mut self, connected: bool) -> Result<(), DeviceError> {
        self.send(DeviceCommand::SetDesired(connected)).await
    }

    pub async fn toggle(&mut self) -> Result<(), DeviceError> {
        self.send(DeviceCommand::Toggle).await
    }

    /// Reports the outcome of a permission prompt.
    pub async fn permission_changed(&mut self, granted: bool) -> Result<(), DeviceError> {
        self.send(DeviceCommand::PermissionChanged(granted)).await
    }

    pub async fn bluetooth_enabled_changed(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.send(DeviceCommand::BluetoothEnabledChanged(enabled)).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }
}
