use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{Receiver, Sender};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::backend::{backend_channel, BackendEvent, BleBackend};
use crate::device::constants::{DISCONNECT_DEADLINE, IS_CONNECTED_DEADLINE, SCAN_FAILED_INTERNAL_ERROR};
use crate::device::types::{
    CharacteristicInfo, GattStatus, PeripheralIdentity, ScanFailure, ServiceInfo, SubscriptionMode,
};
use crate::error::DeviceError;

/// [`BleBackend`] on top of the first adapter btleplug reports.
pub struct BtleBackend {
    adapter: Option<Adapter>,
    scanning: Arc<AtomicBool>,
    events: Sender<BackendEvent>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct BtleConnection {
    peripheral: Peripheral,
    forwarder: CancellationToken,
}

impl BtleBackend {
    pub async fn new(cancel: CancellationToken) -> Result<(BtleBackend, Receiver<BackendEvent>), DeviceError> {
        let (events, receiver) = backend_channel();
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        let scanning = Arc::new(AtomicBool::new(false));

        match &adapter {
            Some(adapter) => {
                info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
                watch_adapter_events(cancel.clone(), adapter.clone(), scanning.clone(), events.clone()).await?;
            },
            None => warn!("No bluetooth adapter found"),
        }

        Ok((BtleBackend { adapter, scanning, events, cancel }, receiver))
    }

    async fn find_peripheral(&self, target: &PeripheralIdentity) -> Result<Peripheral, DeviceError> {
        let adapter = self.adapter.as_ref().ok_or(DeviceError::BluetoothUnsupported)?;

        for peripheral in adapter.peripherals().await? {
            if target.matches(&peripheral.address().to_string()) {
                return Ok(peripheral);
            }
        }

        Err(DeviceError::PeripheralNotFound)
    }
}

async fn peripheral_advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<BackendEvent> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Discovered peripheral went away: {}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Ok(Some(properties)) => Some(BackendEvent::Advertisement {
            address: properties.address.to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
        }),
        Ok(None) => Some(BackendEvent::Advertisement {
            address: peripheral.address().to_string(),
            name: None,
            rssi: None,
        }),
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
    }
}

/// Turns the adapter event stream into [`BackendEvent`]s until `cancel` is cancelled.
async fn watch_adapter_events(
    cancel: CancellationToken,
    adapter: Adapter,
    scanning: Arc<AtomicBool>,
    mut events: Sender<BackendEvent>,
) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;

    spawn(async move {
        'mainloop: loop {
            let central_event = tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                central_event = central_events.next() => match central_event {
                    Some(central_event) => central_event,
                    None => break 'mainloop,
                },
            };

            let event = match central_event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if !scanning.load(Ordering::SeqCst) {
                        continue;
                    }
                    peripheral_advertisement(&adapter, &id).await
                },
                CentralEvent::DeviceDisconnected(id) => match adapter.peripheral(&id).await {
                    Ok(peripheral) => Some(BackendEvent::Disconnected {
                        address: peripheral.address().to_string(),
                        status: GattStatus::SUCCESS,
                    }),
                    Err(err) => {
                        warn!("Disconnected peripheral could not be resolved: {}", err);
                        None
                    },
                },
                _ => None,
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    break 'mainloop;
                }
            }
        }

        debug!("Adapter event watcher stopped");
    });

    Ok(())
}

#[async_trait]
impl BleBackend for BtleBackend {
    type Scan = Adapter;
    type Connection = BtleConnection;

    async fn start_scan(&self) -> Result<Adapter, ScanFailure> {
        let adapter = self.adapter.clone().ok_or(ScanFailure::BluetoothUnsupported)?;

        // btleplug offers no scan mode, the platform default is used
        match adapter.start_scan(ScanFilter::default()).await {
            Ok(()) => {
                self.scanning.store(true, Ordering::SeqCst);
                Ok(adapter)
            },
            Err(btleplug::Error::PermissionDenied) => Err(ScanFailure::PermissionDenied),
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                Err(ScanFailure::Code(SCAN_FAILED_INTERNAL_ERROR))
            },
        }
    }

    async fn stop_scan(&self, scan: Adapter) {
        self.scanning.store(false, Ordering::SeqCst);
        if let Err(err) = scan.stop_scan().await {
            warn!("Stopping scan failed: {}", err);
        }
    }

    async fn connect(&self, target: &PeripheralIdentity) -> Result<BtleConnection, DeviceError> {
        let peripheral = self.find_peripheral(target).await?;
        peripheral.connect().await?;

        Ok(BtleConnection {
            peripheral,
            forwarder: self.cancel.child_token(),
        })
    }

    async fn request_mtu(&self, _connection: &BtleConnection, mtu: u16) -> Result<Option<u16>, DeviceError> {
        debug!("MTU {} requested, btleplug negotiates it during connect", mtu);
        Ok(None)
    }

    async fn discover_services(&self, connection: &BtleConnection) -> Result<Vec<ServiceInfo>, DeviceError> {
        connection.peripheral.discover_services().await?;

        let services = connection.peripheral.services().into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service.characteristics.into_iter()
                    .map(|characteristic| CharacteristicInfo {
                        service_uuid: characteristic.service_uuid,
                        uuid: characteristic.uuid,
                        indicate: characteristic.properties.contains(CharPropFlags::INDICATE),
                        notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
                    })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn enable_notifications(
        &self,
        connection: &BtleConnection,
        characteristic: &CharacteristicInfo,
        mode: SubscriptionMode,
    ) -> Result<(), DeviceError> {
        let platform_characteristic = connection.peripheral.characteristics().into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or(DeviceError::NotifiableCharacteristicMissing)?;

        let mut notifications = connection.peripheral.notifications().await?;
        // btleplug writes the CCCD itself and picks the mode from the characteristic properties
        debug!("Subscribing to {} for {:?}", characteristic.uuid, mode);
        connection.peripheral.subscribe(&platform_characteristic).await?;

        let forwarder = connection.forwarder.clone();
        let mut events = self.events.clone();
        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = forwarder.cancelled() => {
                        break 'mainloop;
                    },
                    notification = notifications.next() => match notification {
                        Some(notification) => {
                            let event = BackendEvent::Notification {
                                characteristic: notification.uuid,
                                value: notification.value,
                            };
                            if events.send(event).await.is_err() {
                                break 'mainloop;
                            }
                        },
                        None => break 'mainloop,
                    },
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self, connection: &BtleConnection) -> Result<(), DeviceError> {
        connection.forwarder.cancel();
        disconnect_peripheral(&connection.peripheral).await
    }

    async fn close(&self, connection: BtleConnection) {
        connection.forwarder.cancel();

        tokio::select! {
            _ = sleep(IS_CONNECTED_DEADLINE) => {
                // macOS
                warn!("Checking for connection status took too long");
            }
            result = connection.peripheral.is_connected() => match result {
                Ok(true) => {
                    if let Err(err) = disconnect_peripheral(&connection.peripheral).await {
                        warn!("Disconnecting while releasing the handle failed: {}", err);
                    }
                },
                Ok(false) => {},
                Err(err) => warn!("Error checking for connection state: {:?}", err),
            }
        }
    }
}

async fn disconnect_peripheral(peripheral: &Peripheral) -> Result<(), DeviceError> {
    tokio::select! {
        _ = sleep(DISCONNECT_DEADLINE) => {
            Err(DeviceError::DeadlineExceeded { operation: "disconnect" })
        }
        result = peripheral.disconnect() => Ok(result?),
    }
}
