//! The connection lifecycle as a pure state machine.
//!
//! [`ConnectionMachine::handle`] consumes one [`MachineEvent`] (an intent change, a platform
//! callback, or an expired timer) and returns the [`Action`]s the connection worker has to
//! perform. The machine never touches the platform itself, so every transition can be
//! exercised without a bluetooth adapter.
//!
//! Each connection attempt gets a new attempt number when the target is found. Callbacks and
//! timers carry the attempt they belong to, anything from an older attempt is discarded.

use std::time::Duration;
use log::{debug, info, warn};

use crate::device::constants::{
    DEFAULT_STAGE_TIMEOUT, GATT_MAX_MTU_SIZE, OPENVBT_ADDRESS, SCAN_SETTLE_DELAY, SERVICE_DISCOVERY_DELAY,
};
use crate::device::types::{
    CharacteristicInfo, ConnectionState, DeviceEvent, DisconnectReason, GattStatus, Notice, PeripheralIdentity,
    ScanFailure, Stage, SubscriptionMode,
};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub target: PeripheralIdentity,
    /// Start scanning again after a failed attempt or a lost link while the intent is set.
    pub auto_reconnect: bool,
    /// Withdrawing the intent cancels an attempt that is not Ready yet. When false, such a
    /// request is ignored and the intent stays set.
    pub cancel_while_connecting: bool,
    pub settle_delay: Duration,
    pub discovery_delay: Duration,
    pub stage_timeout: Option<Duration>,
    pub mtu: u16,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            target: PeripheralIdentity::new(OPENVBT_ADDRESS),
            auto_reconnect: true,
            cancel_while_connecting: true,
            settle_delay: SCAN_SETTLE_DELAY,
            discovery_delay: SERVICE_DISCOVERY_DELAY,
            stage_timeout: Some(DEFAULT_STAGE_TIMEOUT),
            mtu: GATT_MAX_MTU_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    ScanSettle,
    ServiceDiscovery,
    StageTimeout(Stage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    IntentChanged(bool),
    PermissionChanged(bool),
    BluetoothEnabledChanged(bool),
    ScanFailed(ScanFailure),
    TargetFound,
    TimerElapsed { attempt: u64, timer: Timer },
    Connected { attempt: u64, status: GattStatus },
    MtuChanged { attempt: u64, mtu: Option<u16>, status: GattStatus },
    ServicesDiscovered { attempt: u64, status: GattStatus, characteristic: Option<CharacteristicInfo> },
    NotificationsEnabled { attempt: u64, status: GattStatus },
    LinkLost { status: GattStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Publish(DeviceEvent),
    StartScan,
    StopScan,
    StartTimer { attempt: u64, after: Duration, timer: Timer },
    Connect { attempt: u64 },
    RequestMtu { attempt: u64, mtu: u16 },
    DiscoverServices { attempt: u64 },
    EnableNotifications { attempt: u64, characteristic: CharacteristicInfo, mode: SubscriptionMode },
    Disconnect { attempt: u64 },
    /// Cancel everything still pending for the current attempt and close the connection handle.
    ReleaseHandle,
}

pub struct ConnectionMachine {
    settings: ConnectionSettings,
    state: ConnectionState,
    intent: bool,
    permission_granted: bool,
    bluetooth_enabled: bool,
    attempt: u64,
    connect_requested: bool,
    link_up: bool,
    mtu: Option<u16>,
}

impl ConnectionMachine {
    pub fn new(settings: ConnectionSettings) -> Self {
        ConnectionMachine {
            settings,
            state: ConnectionState::Idle,
            intent: false,
            permission_granted: true,
            bluetooth_enabled: true,
            attempt: 0,
            connect_requested: false,
            link_up: false,
            mtu: None,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn intent(&self) -> bool {
        self.intent
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The MTU reported for the current link, if the platform told us.
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            MachineEvent::IntentChanged(true) => self.on_intent_set(&mut actions),
            MachineEvent::IntentChanged(false) => self.on_intent_withdrawn(&mut actions),
            MachineEvent::PermissionChanged(granted) => {
                self.permission_granted = granted;
                if granted {
                    self.retry_if_waiting(&mut actions);
                }
            },
            MachineEvent::BluetoothEnabledChanged(enabled) => {
                self.bluetooth_enabled = enabled;
                if enabled {
                    self.retry_if_waiting(&mut actions);
                } else if self.state == ConnectionState::Scanning {
                    actions.push(Action::StopScan);
                    self.set_state(ConnectionState::Idle, &mut actions);
                    actions.push(Action::Publish(DeviceEvent::Notice(Notice::EnableBluetooth)));
                }
            },
            MachineEvent::ScanFailed(failure) => self.on_scan_failed(failure, &mut actions),
            MachineEvent::TargetFound => {
                if self.state == ConnectionState::Scanning {
                    self.attempt += 1;
                    self.connect_requested = false;
                    info!("Target {} found, connecting (attempt {})", self.settings.target, self.attempt);
                    actions.push(Action::StopScan);
                    self.set_state(ConnectionState::Connecting, &mut actions);
                    actions.push(Action::StartTimer {
                        attempt: self.attempt,
                        after: self.settings.settle_delay,
                        timer: Timer::ScanSettle,
                    });
                }
            },
            MachineEvent::TimerElapsed { attempt, timer } => {
                if attempt == self.attempt {
                    self.on_timer(timer, &mut actions);
                }
            },
            MachineEvent::Connected { attempt, status } => {
                if attempt == self.attempt && self.state == ConnectionState::Connecting {
                    self.on_connected(status, &mut actions);
                }
            },
            MachineEvent::MtuChanged { attempt, mtu, status } => {
                if attempt == self.attempt && self.link_up {
                    if status.is_success() {
                        info!("ATT MTU changed to {:?}", mtu);
                        self.mtu = mtu;
                    } else {
                        warn!("ATT MTU request failed with status {}", status);
                    }
                }
            },
            MachineEvent::ServicesDiscovered { attempt, status, characteristic } => {
                if attempt == self.attempt && self.state == ConnectionState::DiscoveringServices {
                    self.on_services_discovered(status, characteristic, &mut actions);
                }
            },
            MachineEvent::NotificationsEnabled { attempt, status } => {
                if attempt == self.attempt && self.state == ConnectionState::EnablingNotifications {
                    if status.is_success() {
                        info!("Notifications enabled, connection ready");
                        self.set_state(ConnectionState::Ready, &mut actions);
                    } else {
                        self.fail(DisconnectReason::NotificationEnableFailed(status), &mut actions);
                    }
                }
            },
            MachineEvent::LinkLost { status } => self.on_link_lost(status, &mut actions),
        }

        actions
    }

    fn on_intent_set(&mut self, actions: &mut Vec<Action>) {
        self.set_intent(true, actions);

        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected(_) => self.begin_scan(actions),
            // already converging, or a reconnect follows once the link is down
            _ => debug!("Connection already in progress ({:?})", self.state),
        }
    }

    fn on_intent_withdrawn(&mut self, actions: &mut Vec<Action>) {
        if !self.intent {
            return;
        }

        match self.state {
            ConnectionState::Scanning => {
                self.set_intent(false, actions);
                actions.push(Action::StopScan);
                self.set_state(ConnectionState::Idle, actions);
            },
            ConnectionState::Ready => {
                self.set_intent(false, actions);
                self.set_state(ConnectionState::Disconnecting, actions);
                actions.push(Action::Disconnect { attempt: self.attempt });
                self.arm_stage_timeout(Stage::Disconnecting, actions);
            },
            _ if self.state.is_converging() => {
                if self.settings.cancel_while_connecting {
                    self.set_intent(false, actions);
                    self.enter_disconnected(DisconnectReason::IntentWithdrawn, actions);
                } else {
                    info!("Ignoring disconnect request while {:?}", self.state);
                }
            },
            _ => self.set_intent(false, actions),
        }
    }

    fn retry_if_waiting(&mut self, actions: &mut Vec<Action>) {
        let waiting = matches!(self.state, ConnectionState::Idle | ConnectionState::Disconnected(_));
        if self.intent && waiting {
            self.begin_scan(actions);
        }
    }

    fn begin_scan(&mut self, actions: &mut Vec<Action>) {
        if !self.permission_granted {
            info!("Bluetooth permission missing, requesting it before scanning");
            self.set_state(ConnectionState::Idle, actions);
            actions.push(Action::Publish(DeviceEvent::Notice(Notice::PermissionRequired)));
            return;
        }

        if !self.bluetooth_enabled {
            info!("Bluetooth is disabled, asking to enable it before scanning");
            self.set_state(ConnectionState::Idle, actions);
            actions.push(Action::Publish(DeviceEvent::Notice(Notice::EnableBluetooth)));
            return;
        }

        if self.state == ConnectionState::Scanning {
            actions.push(Action::StopScan);
        }
        self.set_state(ConnectionState::Scanning, actions);
        actions.push(Action::StartScan);
    }

    fn on_scan_failed(&mut self, failure: ScanFailure, actions: &mut Vec<Action>) {
        if self.state != ConnectionState::Scanning {
            return;
        }

        match failure {
            ScanFailure::PermissionDenied => {
                warn!("Scanning is not permitted");
                self.permission_granted = false;
                self.set_state(ConnectionState::Idle, actions);
                actions.push(Action::Publish(DeviceEvent::Notice(Notice::PermissionRequired)));
            },
            ScanFailure::BluetoothUnsupported => {
                warn!("No bluetooth adapter available for scanning");
                self.set_state(ConnectionState::Idle, actions);
                self.set_intent(false, actions);
                actions.push(Action::Publish(DeviceEvent::Notice(Notice::BluetoothUnsupported)));
            },
            ScanFailure::Code(code) => {
                warn!("Scan failed with code {}", code);
                actions.push(Action::StopScan);
                self.set_state(ConnectionState::Disconnected(DisconnectReason::ScanFailed(code)), actions);
                self.set_intent(false, actions);
                actions.push(Action::Publish(DeviceEvent::Notice(Notice::ScanFailed(code))));
            },
        }
    }

    fn on_timer(&mut self, timer: Timer, actions: &mut Vec<Action>) {
        match timer {
            Timer::ScanSettle => {
                if self.state == ConnectionState::Connecting && !self.connect_requested {
                    self.connect_requested = true;
                    actions.push(Action::Connect { attempt: self.attempt });
                    self.arm_stage_timeout(Stage::Connecting, actions);
                }
            },
            Timer::ServiceDiscovery => {
                if self.state == ConnectionState::NegotiatingMtu {
                    if self.mtu.is_none() {
                        debug!("No MTU callback before service discovery");
                    }
                    self.set_state(ConnectionState::DiscoveringServices, actions);
                    actions.push(Action::DiscoverServices { attempt: self.attempt });
                    self.arm_stage_timeout(Stage::DiscoveringServices, actions);
                }
            },
            Timer::StageTimeout(stage) => {
                if self.state.stage() != Some(stage) {
                    return;
                }

                warn!("Timed out while {:?}", stage);
                if stage == Stage::Disconnecting {
                    self.enter_disconnected(DisconnectReason::IntentWithdrawn, actions);
                    self.after_disconnect(&DisconnectReason::IntentWithdrawn, actions);
                } else {
                    self.fail(DisconnectReason::Timeout(stage), actions);
                }
            },
        }
    }

    fn on_connected(&mut self, status: GattStatus, actions: &mut Vec<Action>) {
        if !status.is_success() {
            self.fail(DisconnectReason::ConnectFailed(status), actions);
            return;
        }

        info!("Connected to {}, requesting MTU {}", self.settings.target, self.settings.mtu);
        self.link_up = true;
        self.set_state(ConnectionState::NegotiatingMtu, actions);
        actions.push(Action::RequestMtu { attempt: self.attempt, mtu: self.settings.mtu });
        actions.push(Action::StartTimer {
            attempt: self.attempt,
            after: self.settings.discovery_delay,
            timer: Timer::ServiceDiscovery,
        });
    }

    fn on_services_discovered(
        &mut self,
        status: GattStatus,
        characteristic: Option<CharacteristicInfo>,
        actions: &mut Vec<Action>,
    ) {
        if !status.is_success() {
            self.fail(DisconnectReason::DiscoveryFailed(status), actions);
            return;
        }

        let subscription = characteristic.and_then(|characteristic| {
            SubscriptionMode::for_properties(characteristic.indicate, characteristic.notify)
                .map(|mode| (characteristic, mode))
        });

        match subscription {
            Some((characteristic, mode)) => {
                self.set_state(ConnectionState::EnablingNotifications, actions);
                actions.push(Action::EnableNotifications { attempt: self.attempt, characteristic, mode });
                self.arm_stage_timeout(Stage::EnablingNotifications, actions);
            },
            None => self.fail(DisconnectReason::NotifiableCharacteristicMissing, actions),
        }
    }

    fn on_link_lost(&mut self, status: GattStatus, actions: &mut Vec<Action>) {
        if self.state == ConnectionState::Disconnecting {
            self.enter_disconnected(DisconnectReason::IntentWithdrawn, actions);
            self.after_disconnect(&DisconnectReason::IntentWithdrawn, actions);
        } else if self.link_up {
            self.fail(DisconnectReason::LinkLost(status), actions);
        } else {
            debug!("Ignoring disconnect callback while {:?}", self.state);
        }
    }

    fn fail(&mut self, reason: DisconnectReason, actions: &mut Vec<Action>) {
        warn!("Connection attempt {} ended: {}", self.attempt, reason);
        self.enter_disconnected(reason.clone(), actions);
        self.after_disconnect(&reason, actions);
    }

    fn enter_disconnected(&mut self, reason: DisconnectReason, actions: &mut Vec<Action>) {
        actions.push(Action::ReleaseHandle);
        self.link_up = false;
        self.mtu = None;
        self.set_state(ConnectionState::Disconnected(reason), actions);
    }

    fn after_disconnect(&mut self, reason: &DisconnectReason, actions: &mut Vec<Action>) {
        if !self.intent {
            return;
        }

        // a withdrawn intent that was set again while disconnecting is a fresh request
        if self.settings.auto_reconnect || *reason == DisconnectReason::IntentWithdrawn {
            info!("Reconnecting");
            self.begin_scan(actions);
        } else {
            info!("Not reconnecting automatically");
            self.set_intent(false, actions);
        }
    }

    fn arm_stage_timeout(&self, stage: Stage, actions: &mut Vec<Action>) {
        if let Some(after) = self.settings.stage_timeout {
            actions.push(Action::StartTimer {
                attempt: self.attempt,
                after,
                timer: Timer::StageTimeout(stage),
            });
        }
    }

    fn set_intent(&mut self, intent: bool, actions: &mut Vec<Action>) {
        if self.intent != intent {
            self.intent = intent;
            actions.push(Action::Publish(DeviceEvent::IntentChange(intent)));
        }
    }

    fn set_state(&mut self, state: ConnectionState, actions: &mut Vec<Action>) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state.clone();
            actions.push(Action::Publish(DeviceEvent::StateChange(state)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{REP_STATISTICS_CHARACTERISTIC, REP_STATISTICS_SERVICE};

    fn settings() -> ConnectionSettings {
        ConnectionSettings::default()
    }

    fn characteristic(indicate: bool, notify: bool) -> CharacteristicInfo {
        CharacteristicInfo {
            service_uuid: REP_STATISTICS_SERVICE,
            uuid: REP_STATISTICS_CHARACTERISTIC,
            indicate,
            notify,
        }
    }

    fn has(actions: &[Action], wanted: &Action) -> bool {
        actions.iter().any(|action| action == wanted)
    }

    fn count_scans(actions: &[Action]) -> usize {
        actions.iter().filter(|action| **action == Action::StartScan).count()
    }

    /// Drives a fresh machine to the Connecting state, returning it with the current attempt.
    fn connecting(settings: ConnectionSettings) -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(settings);
        machine.handle(MachineEvent::IntentChanged(true));
        machine.handle(MachineEvent::TargetFound);
        machine.handle(MachineEvent::TimerElapsed { attempt: machine.attempt(), timer: Timer::ScanSettle });
        machine
    }

    fn ready(settings: ConnectionSettings) -> ConnectionMachine {
        let mut machine = connecting(settings);
        let attempt = machine.attempt();
        machine.handle(MachineEvent::Connected { attempt, status: GattStatus::SUCCESS });
        machine.handle(MachineEvent::TimerElapsed { attempt, timer: Timer::ServiceDiscovery });
        machine.handle(MachineEvent::ServicesDiscovered {
            attempt,
            status: GattStatus::SUCCESS,
            characteristic: Some(characteristic(false, true)),
        });
        machine.handle(MachineEvent::NotificationsEnabled { attempt, status: GattStatus::SUCCESS });
        assert_eq!(machine.state(), &ConnectionState::Ready);
        machine
    }

    #[test]
    fn intent_starts_scanning() {
        let mut machine = ConnectionMachine::new(settings());
        let actions = machine.handle(MachineEvent::IntentChanged(true));

        assert_eq!(machine.state(), &ConnectionState::Scanning);
        assert!(machine.intent());
        assert_eq!(actions, vec![
            Action::Publish(DeviceEvent::IntentChange(true)),
            Action::Publish(DeviceEvent::StateChange(ConnectionState::Scanning)),
            Action::StartScan,
        ]);
    }

    #[test]
    fn match_stops_scan_and_connects_after_settle_delay() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::IntentChanged(true));

        let actions = machine.handle(MachineEvent::TargetFound);
        assert_eq!(machine.state(), &ConnectionState::Connecting);
        assert!(has(&actions, &Action::StopScan));
        assert!(has(&actions, &Action::StartTimer { attempt: 1, after: SCAN_SETTLE_DELAY, timer: Timer::ScanSettle }));
        assert!(!actions.iter().any(|action| matches!(action, Action::Connect { .. })));

        let actions = machine.handle(MachineEvent::TimerElapsed { attempt: 1, timer: Timer::ScanSettle });
        assert!(has(&actions, &Action::Connect { attempt: 1 }));
    }

    #[test]
    fn connected_requests_mtu_and_schedules_discovery() {
        let mut machine = connecting(settings());
        let actions = machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS });

        assert_eq!(machine.state(), &ConnectionState::NegotiatingMtu);
        assert!(has(&actions, &Action::RequestMtu { attempt: 1, mtu: 517 }));
        assert!(has(&actions, &Action::StartTimer {
            attempt: 1,
            after: SERVICE_DISCOVERY_DELAY,
            timer: Timer::ServiceDiscovery,
        }));
        assert!(!has(&actions, &Action::DiscoverServices { attempt: 1 }));
    }

    #[test]
    fn discovery_does_not_wait_for_the_mtu_callback() {
        let mut machine = connecting(settings());
        machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS });

        let actions = machine.handle(MachineEvent::TimerElapsed { attempt: 1, timer: Timer::ServiceDiscovery });
        assert_eq!(machine.state(), &ConnectionState::DiscoveringServices);
        assert!(has(&actions, &Action::DiscoverServices { attempt: 1 }));
        assert_eq!(machine.mtu(), None);
    }

    #[test]
    fn mtu_callback_is_recorded_without_a_transition() {
        let mut machine = connecting(settings());
        machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS });

        let actions = machine.handle(MachineEvent::MtuChanged { attempt: 1, mtu: Some(247), status: GattStatus::SUCCESS });
        assert!(actions.is_empty());
        assert_eq!(machine.mtu(), Some(247));
        assert_eq!(machine.state(), &ConnectionState::NegotiatingMtu);
    }

    #[test]
    fn indication_is_preferred_over_notification() {
        let mut machine = connecting(settings());
        machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS });
        machine.handle(MachineEvent::TimerElapsed { attempt: 1, timer: Timer::ServiceDiscovery });

        let actions = machine.handle(MachineEvent::ServicesDiscovered {
            attempt: 1,
            status: GattStatus::SUCCESS,
            characteristic: Some(characteristic(true, true)),
        });
        assert_eq!(machine.state(), &ConnectionState::EnablingNotifications);
        assert!(has(&actions, &Action::EnableNotifications {
            attempt: 1,
            characteristic: characteristic(true, true),
            mode: SubscriptionMode::Indication,
        }));
    }

    #[test]
    fn characteristic_without_push_support_fails_the_attempt() {
        let mut machine = connecting(settings());
        machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS });
        machine.handle(MachineEvent::TimerElapsed { attempt: 1, timer: Timer::ServiceDiscovery });

        let actions = machine.handle(MachineEvent::ServicesDiscovered {
            attempt: 1,
            status: GattStatus::SUCCESS,
            characteristic: Some(characteristic(false, false)),
        });
        assert!(has(&actions, &Action::ReleaseHandle));
        assert!(has(&actions, &Action::Publish(DeviceEvent::StateChange(
            ConnectionState::Disconnected(DisconnectReason::NotifiableCharacteristicMissing)
        ))));
        // the intent is still set, so the machine is scanning again
        assert_eq!(machine.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn descriptor_ack_makes_the_connection_ready() {
        let machine = ready(settings());
        assert!(machine.intent());
    }

    #[test]
    fn failed_connect_rescans_while_intent_is_set() {
        let mut machine = connecting(settings());
        let actions = machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus(0x85) });

        let disconnected = ConnectionState::Disconnected(DisconnectReason::ConnectFailed(GattStatus(0x85)));
        assert!(has(&actions, &Action::Publish(DeviceEvent::StateChange(disconnected))));
        assert!(has(&actions, &Action::ReleaseHandle));
        assert_eq!(count_scans(&actions), 1);
        assert_eq!(machine.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn failed_connect_after_withdrawn_intent_does_not_rescan() {
        let mut machine = connecting(settings());
        let actions = machine.handle(MachineEvent::IntentChanged(false));
        assert_eq!(machine.state(), &ConnectionState::Disconnected(DisconnectReason::IntentWithdrawn));
        assert!(has(&actions, &Action::ReleaseHandle));

        let actions = machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus(0x85) });
        assert!(actions.is_empty());
        assert_eq!(machine.state(), &ConnectionState::Disconnected(DisconnectReason::IntentWithdrawn));
    }

    #[test]
    fn failed_connect_without_auto_reconnect_clears_the_intent() {
        let mut machine = connecting(ConnectionSettings { auto_reconnect: false, ..settings() });
        let actions = machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus(0x85) });

        assert_eq!(count_scans(&actions), 0);
        assert!(!machine.intent());
        assert!(has(&actions, &Action::Publish(DeviceEvent::IntentChange(false))));

        // the next request starts over
        let actions = machine.handle(MachineEvent::IntentChanged(true));
        assert_eq!(count_scans(&actions), 1);
    }

    #[test]
    fn withdrawal_while_connecting_can_be_ignored() {
        let mut machine = connecting(ConnectionSettings { cancel_while_connecting: false, ..settings() });
        let actions = machine.handle(MachineEvent::IntentChanged(false));

        assert!(actions.is_empty());
        assert!(machine.intent());
        assert_eq!(machine.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn withdrawal_when_ready_disconnects_gracefully() {
        let mut machine = ready(settings());
        let attempt = machine.attempt();

        let actions = machine.handle(MachineEvent::IntentChanged(false));
        assert_eq!(machine.state(), &ConnectionState::Disconnecting);
        assert!(has(&actions, &Action::Disconnect { attempt }));
        assert!(!has(&actions, &Action::ReleaseHandle));

        let actions = machine.handle(MachineEvent::LinkLost { status: GattStatus::SUCCESS });
        assert!(has(&actions, &Action::ReleaseHandle));
        assert_eq!(count_scans(&actions), 0);
        assert_eq!(machine.state(), &ConnectionState::Disconnected(DisconnectReason::IntentWithdrawn));
    }

    #[test]
    fn lost_link_while_ready_reconnects() {
        let mut machine = ready(settings());

        let actions = machine.handle(MachineEvent::LinkLost { status: GattStatus(0x08) });
        assert!(has(&actions, &Action::ReleaseHandle));
        assert!(has(&actions, &Action::Publish(DeviceEvent::StateChange(
            ConnectionState::Disconnected(DisconnectReason::LinkLost(GattStatus(0x08)))
        ))));
        assert_eq!(machine.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn stale_disconnect_does_not_fail_a_new_attempt() {
        let mut machine = connecting(settings());
        let actions = machine.handle(MachineEvent::LinkLost { status: GattStatus::SUCCESS });

        assert!(actions.is_empty());
        assert_eq!(machine.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn callbacks_of_an_older_attempt_are_ignored() {
        let mut machine = connecting(settings());
        machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus(0x85) });
        machine.handle(MachineEvent::TargetFound);
        assert_eq!(machine.attempt(), 2);

        assert!(machine.handle(MachineEvent::TimerElapsed { attempt: 1, timer: Timer::ScanSettle }).is_empty());
        assert!(machine.handle(MachineEvent::Connected { attempt: 1, status: GattStatus::SUCCESS }).is_empty());
        assert_eq!(machine.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn stage_timeout_fails_the_attempt() {
        let mut machine = connecting(settings());
        let actions = machine.handle(MachineEvent::TimerElapsed {
            attempt: 1,
            timer: Timer::StageTimeout(Stage::Connecting),
        });

        assert!(has(&actions, &Action::Publish(DeviceEvent::StateChange(
            ConnectionState::Disconnected(DisconnectReason::Timeout(Stage::Connecting))
        ))));
        assert_eq!(machine.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn timeout_of_a_finished_stage_is_ignored() {
        let mut machine = ready(settings());
        let actions = machine.handle(MachineEvent::TimerElapsed {
            attempt: machine.attempt(),
            timer: Timer::StageTimeout(Stage::Connecting),
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn denied_permission_prompts_and_retries_on_grant() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::IntentChanged(true));

        let actions = machine.handle(MachineEvent::ScanFailed(ScanFailure::PermissionDenied));
        assert_eq!(machine.state(), &ConnectionState::Idle);
        assert!(has(&actions, &Action::Publish(DeviceEvent::Notice(Notice::PermissionRequired))));

        // asking again without a grant only prompts again
        let actions = machine.handle(MachineEvent::IntentChanged(true));
        assert_eq!(count_scans(&actions), 0);
        assert!(has(&actions, &Action::Publish(DeviceEvent::Notice(Notice::PermissionRequired))));

        let actions = machine.handle(MachineEvent::PermissionChanged(true));
        assert_eq!(count_scans(&actions), 1);
        assert_eq!(machine.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn disabled_bluetooth_prompts_and_retries_when_enabled() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::BluetoothEnabledChanged(false));

        let actions = machine.handle(MachineEvent::IntentChanged(true));
        assert_eq!(count_scans(&actions), 0);
        assert!(has(&actions, &Action::Publish(DeviceEvent::Notice(Notice::EnableBluetooth))));

        let actions = machine.handle(MachineEvent::BluetoothEnabledChanged(true));
        assert_eq!(count_scans(&actions), 1);
    }

    #[test]
    fn missing_adapter_clears_the_intent() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::IntentChanged(true));

        let actions = machine.handle(MachineEvent::ScanFailed(ScanFailure::BluetoothUnsupported));
        assert!(has(&actions, &Action::Publish(DeviceEvent::Notice(Notice::BluetoothUnsupported))));
        assert!(!machine.intent());
        assert_eq!(machine.state(), &ConnectionState::Idle);
    }

    #[test]
    fn scan_failure_is_terminal() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::IntentChanged(true));

        let actions = machine.handle(MachineEvent::ScanFailed(ScanFailure::Code(2)));
        assert_eq!(count_scans(&actions), 0);
        assert!(has(&actions, &Action::StopScan));
        assert!(!machine.intent());
        assert_eq!(machine.state(), &ConnectionState::Disconnected(DisconnectReason::ScanFailed(2)));
    }

    #[test]
    fn withdrawal_while_scanning_stops_the_scan() {
        let mut machine = ConnectionMachine::new(settings());
        machine.handle(MachineEvent::IntentChanged(true));

        let actions = machine.handle(MachineEvent::IntentChanged(false));
        assert!(has(&actions, &Action::StopScan));
        assert_eq!(machine.state(), &ConnectionState::Idle);

        // a match reported after the stop is ignored
        assert!(machine.handle(MachineEvent::TargetFound).is_empty());
    }

    /// Small deterministic generator so the interleavings below are reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    #[test]
    fn never_more_than_one_connection_attempt_in_flight() {
        for seed in 0..200 {
            for cancel_while_connecting in [true, false] {
                let mut rng = Lcg(seed);
                let mut machine = ConnectionMachine::new(ConnectionSettings {
                    cancel_while_connecting,
                    ..settings()
                });
                // attempts that issued a connect and have not been released since
                let mut outstanding: Vec<u64> = Vec::new();

                for _ in 0..60 {
                    let attempt = if rng.next(4) == 0 { machine.attempt().saturating_sub(1) } else { machine.attempt() };
                    let status = if rng.next(3) == 0 { GattStatus(0x85) } else { GattStatus::SUCCESS };
                    let event = match rng.next(10) {
                        0 | 1 => MachineEvent::IntentChanged(rng.next(2) == 0),
                        2 => MachineEvent::TargetFound,
                        3 => MachineEvent::TimerElapsed { attempt, timer: Timer::ScanSettle },
                        4 => MachineEvent::Connected { attempt, status },
                        5 => MachineEvent::TimerElapsed { attempt, timer: Timer::ServiceDiscovery },
                        6 => MachineEvent::ServicesDiscovered {
                            attempt,
                            status,
                            characteristic: Some(characteristic(false, true)),
                        },
                        7 => MachineEvent::NotificationsEnabled { attempt, status },
                        8 => MachineEvent::LinkLost { status },
                        _ => MachineEvent::TimerElapsed { attempt, timer: Timer::StageTimeout(Stage::Connecting) },
                    };

                    for action in machine.handle(event) {
                        match action {
                            Action::Connect { attempt } => {
                                outstanding.push(attempt);
                                assert!(outstanding.len() <= 1, "seed {}: attempts in flight {:?}", seed, outstanding);
                            },
                            Action::ReleaseHandle => outstanding.clear(),
                            _ => {},
                        }
                    }
                }
            }
        }
    }
}
