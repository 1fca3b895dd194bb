use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Receiver, Sender};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::backend::{BackendEvent, BleBackend};
use crate::device::constants::{CCC_DESCRIPTOR, CLOSE_DEADLINE};
use crate::device::intent::{ConnectionIntent, ConnectionStatus, DeviceCommand};
use crate::device::machine::{Action, ConnectionMachine, ConnectionSettings, MachineEvent, Timer};
use crate::device::payload::decode_payload_now;
use crate::device::scan::ScanManager;
use crate::device::types::{
    find_repetition_characteristic, CharacteristicInfo, ConnectionState, DeviceEvent, GattStatus, ServiceInfo,
    SubscriptionMode,
};
use crate::error::DeviceError;
use crate::repetition::sink::SinkCommand;

/// Result of a platform operation started by the worker, or of one of its timers.
enum Completion<C> {
    Connected { attempt: u64, result: Result<C, DeviceError> },
    Mtu { attempt: u64, result: Result<Option<u16>, DeviceError> },
    Services { attempt: u64, result: Result<Vec<ServiceInfo>, DeviceError> },
    Subscribed { attempt: u64, result: Result<(), DeviceError> },
    Disconnected { attempt: u64, result: Result<(), DeviceError> },
    Timer { attempt: u64, timer: Timer },
}

/// The only owner of the connection state machine and of the connection handle.
struct ConnectionWorker<B: BleBackend> {
    backend: Arc<B>,
    machine: ConnectionMachine,
    scan: ScanManager<B::Scan>,
    connection: Option<(u64, B::Connection)>,
    characteristic: Option<Uuid>,
    connect_in_flight: bool,
    deferred_connect: Option<u64>,
    attempt_cancel: CancellationToken,
    attempt_cancel_for: u64,
    cancel: CancellationToken,
    completions: Sender<Completion<B::Connection>>,
    listeners: Vec<Sender<DeviceEvent>>,
    status: watch::Sender<ConnectionStatus>,
    sink: Sender<SinkCommand>,
}

impl<B: BleBackend> ConnectionWorker<B> {
    async fn dispatch(&mut self, event: MachineEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(action).await {
                    pending.push_back(follow_up);
                }
            }
        }

        self.status.send_replace(ConnectionStatus {
            state: self.machine.state().clone(),
            desired: self.machine.intent(),
        });
    }

    async fn perform(&mut self, action: Action) -> Option<MachineEvent> {
        match action {
            Action::Publish(event) => self.publish(event),
            Action::StartScan => return self.scan.start_scan(&*self.backend).await.err(),
            Action::StopScan => self.scan.stop_scan(&*self.backend).await,
            Action::StartTimer { attempt, after, timer } => self.start_timer(attempt, after, timer),
            Action::Connect { attempt } => {
                if self.connect_in_flight {
                    info!("Previous connect still in flight, deferring attempt {}", attempt);
                    self.deferred_connect = Some(attempt);
                } else {
                    self.start_connect(attempt);
                }
            },
            Action::RequestMtu { attempt, mtu } => {
                if let Some(connection) = self.current_connection(attempt) {
                    let backend = self.backend.clone();
                    self.spawn_op(attempt, async move {
                        Completion::Mtu { attempt, result: backend.request_mtu(&connection, mtu).await }
                    });
                }
            },
            Action::DiscoverServices { attempt } => {
                if let Some(connection) = self.current_connection(attempt) {
                    info!("Discovering services...");
                    let backend = self.backend.clone();
                    self.spawn_op(attempt, async move {
                        Completion::Services { attempt, result: backend.discover_services(&connection).await }
                    });
                }
            },
            Action::EnableNotifications { attempt, characteristic, mode } => {
                if let Some(connection) = self.current_connection(attempt) {
                    self.enable_notifications(attempt, connection, characteristic, mode);
                }
            },
            Action::Disconnect { attempt } => {
                if let Some(connection) = self.current_connection(attempt) {
                    info!("Disconnecting...");
                    let backend = self.backend.clone();
                    self.spawn_op(attempt, async move {
                        Completion::Disconnected { attempt, result: backend.disconnect(&connection).await }
                    });
                }
            },
            Action::ReleaseHandle => self.release_handle().await,
        }

        None
    }

    fn publish(&mut self, event: DeviceEvent) {
        if let DeviceEvent::StateChange(state) = &event {
            info!("Connection state: {:?}", state);
        }

        // listeners are never awaited, a slow presenter only loses events
        for listener in &mut self.listeners {
            if let Err(err) = listener.try_send(event.clone()) {
                if err.is_full() {
                    warn!("Device event listener is full, dropping {:?}", event);
                }
            }
        }
    }

    fn attempt_token(&mut self, attempt: u64) -> CancellationToken {
        if attempt != self.attempt_cancel_for {
            self.attempt_cancel = self.cancel.child_token();
            self.attempt_cancel_for = attempt;
        }
        self.attempt_cancel.clone()
    }

    fn current_connection(&self, attempt: u64) -> Option<B::Connection> {
        match &self.connection {
            Some((connection_attempt, connection)) if *connection_attempt == attempt => Some(connection.clone()),
            _ => {
                debug!("No connection handle for attempt {}", attempt);
                None
            },
        }
    }

    fn start_timer(&mut self, attempt: u64, after: Duration, timer: Timer) {
        let token = self.attempt_token(attempt);
        let mut completions = self.completions.clone();

        spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = sleep(after) => {
                    let _ = completions.send(Completion::Timer { attempt, timer }).await;
                },
            }
        });
    }

    /// Runs a platform operation of `attempt`, dropped when the attempt is released.
    fn spawn_op<F>(&mut self, attempt: u64, op: F)
    where
        F: Future<Output = Completion<B::Connection>> + Send + 'static,
    {
        let token = self.attempt_token(attempt);
        let mut completions = self.completions.clone();

        spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                completion = op => {
                    let _ = completions.send(completion).await;
                },
            }
        });
    }

    /// A connect is not dropped when its attempt is released, the handle it produces must be
    /// closed. Only shutdown abandons it.
    fn start_connect(&mut self, attempt: u64) {
        info!("Connecting to {}...", self.machine.settings().target);
        self.connect_in_flight = true;

        let backend = self.backend.clone();
        let target = self.machine.settings().target.clone();
        let cancel = self.cancel.clone();
        let mut completions = self.completions.clone();

        spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                result = backend.connect(&target) => {
                    let _ = completions.send(Completion::Connected { attempt, result }).await;
                },
            }
        });
    }

    fn enable_notifications(
        &mut self,
        attempt: u64,
        connection: B::Connection,
        characteristic: CharacteristicInfo,
        mode: SubscriptionMode,
    ) {
        info!(
            "Enabling {:?} on {} (CCCD {} value {:?})",
            mode, characteristic.uuid, CCC_DESCRIPTOR, mode.descriptor_value(),
        );
        self.characteristic = Some(characteristic.uuid);

        let backend = self.backend.clone();
        self.spawn_op(attempt, async move {
            Completion::Subscribed {
                attempt,
                result: backend.enable_notifications(&connection, &characteristic, mode).await,
            }
        });
    }

    async fn release_handle(&mut self) {
        self.attempt_cancel.cancel();
        self.attempt_cancel = self.cancel.child_token();
        self.characteristic = None;

        if let Some((attempt, connection)) = self.connection.take() {
            info!("Releasing connection handle of attempt {}", attempt);
            self.close_connection(attempt, connection).await;
        }
    }

    async fn close_connection(&self, attempt: u64, connection: B::Connection) {
        tokio::select! {
            _ = sleep(CLOSE_DEADLINE) => {
                warn!("Releasing the connection handle of attempt {} took too long", attempt);
            },
            _ = self.backend.close(connection) => {},
        }
    }

    async fn on_command(&mut self, command: DeviceCommand) {
        debug!("Device command {:?}", command);

        let event = match command {
            DeviceCommand::SetDesired(desired) => MachineEvent::IntentChanged(desired),
            DeviceCommand::Toggle => MachineEvent::IntentChanged(!self.machine.intent()),
            DeviceCommand::PermissionChanged(granted) => MachineEvent::PermissionChanged(granted),
            DeviceCommand::BluetoothEnabledChanged(enabled) => MachineEvent::BluetoothEnabledChanged(enabled),
        };

        self.dispatch(event).await;
    }

    async fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Advertisement { address, name, rssi } => {
                if let Some(found) = self.scan.on_advertisement(&address, name.as_deref()) {
                    debug!("Target RSSI {:?}", rssi);
                    self.dispatch(found).await;
                }
            },
            BackendEvent::ScanFailed { code } => {
                if let Some(failed) = self.scan.on_scan_failed(code) {
                    self.dispatch(failed).await;
                }
            },
            BackendEvent::Notification { characteristic, value } => {
                self.on_notification(characteristic, &value).await;
            },
            BackendEvent::Disconnected { address, status } => {
                if self.machine.settings().target.matches(&address) {
                    info!("Platform reported {} disconnected ({})", address, status);
                    self.dispatch(MachineEvent::LinkLost { status }).await;
                }
            },
        }
    }

    async fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        if !self.machine.state().is_ready() || self.characteristic != Some(characteristic) {
            debug!("Ignoring value of {} while {:?}", characteristic, self.machine.state());
            return;
        }

        match decode_payload_now(value) {
            Ok(record) => {
                debug!("Repetition {:?}", record);
                if let Err(err) = self.sink.send(SinkCommand::Record(record)).await {
                    warn!("Repetition sink is gone: {}", err);
                }
            },
            Err(err) => warn!("Dropping notification: {}", err),
        }
    }

    async fn on_completion(&mut self, completion: Completion<B::Connection>) {
        match completion {
            Completion::Connected { attempt, result } => {
                self.connect_in_flight = false;
                self.on_connected(attempt, result).await;

                if let Some(deferred) = self.deferred_connect.take() {
                    if deferred == self.machine.attempt() && *self.machine.state() == ConnectionState::Connecting {
                        self.start_connect(deferred);
                    }
                }
            },
            Completion::Mtu { attempt, result } => {
                let event = match result {
                    Ok(None) => {
                        info!("ATT MTU is managed by the platform");
                        MachineEvent::MtuChanged { attempt, mtu: None, status: GattStatus::SUCCESS }
                    },
                    Ok(mtu) => MachineEvent::MtuChanged { attempt, mtu, status: GattStatus::SUCCESS },
                    Err(err) => {
                        warn!("Requesting MTU failed: {}", err);
                        MachineEvent::MtuChanged { attempt, mtu: None, status: err.gatt_status() }
                    },
                };
                self.dispatch(event).await;
            },
            Completion::Services { attempt, result } => {
                let event = match result {
                    Ok(services) => {
                        log_gatt_table(&services);
                        let characteristic = find_repetition_characteristic(&services).cloned();
                        if characteristic.is_none() {
                            warn!("Repetition characteristic not found");
                        }
                        MachineEvent::ServicesDiscovered { attempt, status: GattStatus::SUCCESS, characteristic }
                    },
                    Err(err) => {
                        warn!("Service discovery failed: {}", err);
                        MachineEvent::ServicesDiscovered { attempt, status: err.gatt_status(), characteristic: None }
                    },
                };
                self.dispatch(event).await;
            },
            Completion::Subscribed { attempt, result } => {
                let status = match result {
                    Ok(()) => GattStatus::SUCCESS,
                    Err(err) => {
                        warn!("Enabling notifications failed: {}", err);
                        err.gatt_status()
                    },
                };
                self.dispatch(MachineEvent::NotificationsEnabled { attempt, status }).await;
            },
            Completion::Disconnected { attempt, result } => {
                if let Err(err) = result {
                    warn!("Disconnecting failed, releasing the handle anyway: {}", err);
                }
                if attempt == self.machine.attempt() {
                    self.dispatch(MachineEvent::LinkLost { status: GattStatus::SUCCESS }).await;
                }
            },
            Completion::Timer { attempt, timer } => {
                self.dispatch(MachineEvent::TimerElapsed { attempt, timer }).await;
            },
        }
    }

    async fn on_connected(&mut self, attempt: u64, result: Result<B::Connection, DeviceError>) {
        let current = attempt == self.machine.attempt() && *self.machine.state() == ConnectionState::Connecting;

        match result {
            Ok(connection) if current => {
                self.connection = Some((attempt, connection));
                self.dispatch(MachineEvent::Connected { attempt, status: GattStatus::SUCCESS }).await;
            },
            Ok(connection) => {
                info!("Closing connection of abandoned attempt {}", attempt);
                self.close_connection(attempt, connection).await;
            },
            Err(err) => {
                warn!("Connecting failed: {}", err);
                self.dispatch(MachineEvent::Connected { attempt, status: err.gatt_status() }).await;
            },
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping connection worker");
        self.scan.stop_scan(&*self.backend).await;
        self.release_handle().await;
    }
}

fn log_gatt_table(services: &[ServiceInfo]) {
    for service in services {
        info!("Service {}", service.uuid);
        for characteristic in &service.characteristics {
            info!(
                "  Characteristic {} (indicate: {}, notify: {})",
                characteristic.uuid, characteristic.indicate, characteristic.notify,
            );
        }
    }
}

/// Spawns the connection worker. It runs until `cancel` is cancelled.
pub fn connection_task<B: BleBackend>(
    cancel: CancellationToken,
    backend: Arc<B>,
    mut backend_events: Receiver<BackendEvent>,
    settings: ConnectionSettings,
    listeners: Vec<Sender<DeviceEvent>>,
    sink: Sender<SinkCommand>,
) -> (ConnectionIntent, JoinHandle<()>) {
    let (command_sender, mut command_receiver) = channel::<DeviceCommand>(16);
    let (completion_sender, mut completion_receiver) = channel::<Completion<B::Connection>>(64);
    let (status_sender, status_receiver) = watch::channel(ConnectionStatus::default());

    let mut worker = ConnectionWorker {
        backend,
        scan: ScanManager::new(settings.target.clone()),
        machine: ConnectionMachine::new(settings),
        connection: None,
        characteristic: None,
        connect_in_flight: false,
        deferred_connect: None,
        attempt_cancel: cancel.child_token(),
        attempt_cancel_for: 0,
        cancel: cancel.clone(),
        completions: completion_sender,
        listeners,
        status: status_sender,
        sink,
    };

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(command) = command_receiver.next() => {
                    worker.on_command(command).await;
                },
                Some(event) = backend_events.next() => {
                    worker.on_backend_event(event).await;
                },
                Some(completion) = completion_receiver.next() => {
                    worker.on_completion(completion).await;
                },
                else => break 'mainloop,
            }
        }

        worker.shutdown().await;
    });

    (ConnectionIntent::new(command_sender, status_receiver), handle)
}
