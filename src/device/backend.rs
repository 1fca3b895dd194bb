use async_trait::async_trait;
use futures::channel::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

use crate::device::types::{CharacteristicInfo, GattStatus, PeripheralIdentity, ScanFailure, ServiceInfo, SubscriptionMode};
use crate::error::DeviceError;

/// Something the platform reported without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Advertisement {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A running scan was ended by the platform. btleplug has no such callback, so
    /// [`crate::device::btle::BtleBackend`] never sends it; its failures surface from `start_scan`.
    ScanFailed {
        code: i32,
    },
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnected {
        address: String,
        status: GattStatus,
    },
}

pub fn backend_channel() -> (Sender<BackendEvent>, Receiver<BackendEvent>) {
    channel::<BackendEvent>(256)
}

/// The platform operations the connection worker needs. Every operation is started by the
/// worker and its result is fed back into the state machine, unsolicited callbacks arrive as
/// [`BackendEvent`]s instead.
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// Handle of a running scan, consumed when the scan is stopped.
    type Scan: Send + Sync + 'static;
    type Connection: Clone + Send + Sync + 'static;

    async fn start_scan(&self) -> Result<Self::Scan, ScanFailure>;

    async fn stop_scan(&self, scan: Self::Scan);

    async fn connect(&self, target: &PeripheralIdentity) -> Result<Self::Connection, DeviceError>;

    /// Returns the negotiated MTU when the platform reports it.
    async fn request_mtu(&self, connection: &Self::Connection, mtu: u16) -> Result<Option<u16>, DeviceError>;

    async fn discover_services(&self, connection: &Self::Connection) -> Result<Vec<ServiceInfo>, DeviceError>;

    /// Writes the CCCD of `characteristic` and starts forwarding its values as
    /// [`BackendEvent::Notification`].
    async fn enable_notifications(
        &self,
        connection: &Self::Connection,
        characteristic: &CharacteristicInfo,
        mode: SubscriptionMode,
    ) -> Result<(), DeviceError>;

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), DeviceError>;

    /// Releases the handle. Must be safe to call on a handle that is already disconnected.
    async fn close(&self, connection: Self::Connection);
}
