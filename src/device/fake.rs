//! Scripted [`BleBackend`] for driving the connection worker without an adapter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use futures::channel::mpsc::{Receiver, Sender};
use futures::future::pending;
use tokio::time::sleep;

use crate::device::backend::{backend_channel, BackendEvent, BleBackend};
use crate::device::constants::{OPENVBT_ADDRESS, REP_STATISTICS_CHARACTERISTIC, REP_STATISTICS_SERVICE};
use crate::device::types::{
    CharacteristicInfo, GattStatus, PeripheralIdentity, ScanFailure, ServiceInfo, SubscriptionMode,
};
use crate::error::DeviceError;

#[derive(Default)]
struct FakeState {
    calls: Vec<&'static str>,
    next_scan_id: u64,
    scans_running: usize,
    scan_failures: VecDeque<ScanFailure>,
    connect_results: VecDeque<Result<(), GattStatus>>,
    connect_delay: Duration,
    next_connection_id: u64,
    connections_open: usize,
    max_connections_open: usize,
    services: Option<Vec<ServiceInfo>>,
    subscriptions: Vec<SubscriptionMode>,
    close_hangs: bool,
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    events: Sender<BackendEvent>,
}

impl FakeBackend {
    pub fn new() -> (FakeBackend, Receiver<BackendEvent>) {
        let (events, receiver) = backend_channel();
        let backend = FakeBackend {
            state: Arc::new(Mutex::new(FakeState::default())),
            events,
        };
        (backend, receiver)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    pub fn scans_running(&self) -> usize {
        self.state().scans_running
    }

    pub fn connections_open(&self) -> usize {
        self.state().connections_open
    }

    pub fn max_connections_open(&self) -> usize {
        self.state().max_connections_open
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionMode> {
        self.state().subscriptions.clone()
    }

    pub fn fail_next_scan(&self, failure: ScanFailure) {
        self.state().scan_failures.push_back(failure);
    }

    pub fn script_connect(&self, result: Result<(), GattStatus>) {
        self.state().connect_results.push_back(result);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Makes every later `close` call never return.
    pub fn set_close_hangs(&self, hangs: bool) {
        self.state().close_hangs = hangs;
    }

    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        self.state().services = Some(services);
    }

    /// Injects an unsolicited platform event.
    pub fn emit(&self, event: BackendEvent) {
        self.events.clone().try_send(event).unwrap();
    }

    pub fn advertise(&self, address: &str) {
        self.emit(BackendEvent::Advertisement { address: address.to_string(), name: None, rssi: Some(-60) });
    }

    pub fn notify(&self, value: &[u8]) {
        self.emit(BackendEvent::Notification { characteristic: REP_STATISTICS_CHARACTERISTIC, value: value.to_vec() });
    }

    pub fn drop_link(&self, status: GattStatus) {
        self.emit(BackendEvent::Disconnected { address: OPENVBT_ADDRESS.to_string(), status });
    }
}

pub fn repetition_service(indicate: bool, notify: bool) -> ServiceInfo {
    ServiceInfo {
        uuid: REP_STATISTICS_SERVICE,
        characteristics: vec![CharacteristicInfo {
            service_uuid: REP_STATISTICS_SERVICE,
            uuid: REP_STATISTICS_CHARACTERISTIC,
            indicate,
            notify,
        }],
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    type Scan = u64;
    type Connection = u64;

    async fn start_scan(&self) -> Result<u64, ScanFailure> {
        let mut state = self.state();
        state.calls.push("start_scan");
        if let Some(failure) = state.scan_failures.pop_front() {
            return Err(failure);
        }
        state.scans_running += 1;
        state.next_scan_id += 1;
        Ok(state.next_scan_id)
    }

    async fn stop_scan(&self, _scan: u64) {
        let mut state = self.state();
        state.calls.push("stop_scan");
        state.scans_running -= 1;
    }

    async fn connect(&self, _target: &PeripheralIdentity) -> Result<u64, DeviceError> {
        let delay = {
            let mut state = self.state();
            state.calls.push("connect");
            state.connections_open += 1;
            state.max_connections_open = state.max_connections_open.max(state.connections_open);
            state.connect_delay
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state();
        match state.connect_results.pop_front().unwrap_or(Ok(())) {
            Ok(()) => {
                state.next_connection_id += 1;
                Ok(state.next_connection_id)
            },
            Err(status) => {
                state.connections_open -= 1;
                Err(DeviceError::ConnectFailed { status })
            },
        }
    }

    async fn request_mtu(&self, _connection: &u64, mtu: u16) -> Result<Option<u16>, DeviceError> {
        self.state().calls.push("request_mtu");
        Ok(Some(mtu))
    }

    async fn discover_services(&self, _connection: &u64) -> Result<Vec<ServiceInfo>, DeviceError> {
        let mut state = self.state();
        state.calls.push("discover_services");
        Ok(state.services.clone().unwrap_or_else(|| vec![repetition_service(false, true)]))
    }

    async fn enable_notifications(
        &self,
        _connection: &u64,
        _characteristic: &CharacteristicInfo,
        mode: SubscriptionMode,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.calls.push("enable_notifications");
        state.subscriptions.push(mode);
        Ok(())
    }

    async fn disconnect(&self, _connection: &u64) -> Result<(), DeviceError> {
        self.state().calls.push("disconnect");
        self.drop_link(GattStatus::SUCCESS);
        Ok(())
    }

    async fn close(&self, _connection: u64) {
        let hangs = {
            let mut state = self.state();
            state.calls.push("close");
            state.close_hangs
        };

        if hangs {
            pending::<()>().await;
        }
        self.state().connections_open -= 1;
    }
}
