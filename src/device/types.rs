use std::fmt;
use uuid::Uuid;

use crate::device::constants::{
    CCC_ENABLE_INDICATION, CCC_ENABLE_NOTIFICATION, REP_STATISTICS_CHARACTERISTIC, REP_STATISTICS_SERVICE,
};

/// Hardware address of the one unit this client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralIdentity(String);

impl PeripheralIdentity {
    pub fn new(address: &str) -> Self {
        PeripheralIdentity(address.trim().to_ascii_uppercase())
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, address: &str) -> bool {
        self.0.eq_ignore_ascii_case(address.trim())
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status reported with a platform GATT callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// The generic failure most stacks report when a link could not be established (0x85).
    pub const ERROR: GattStatus = GattStatus(0x85);

    pub fn is_success(&self) -> bool {
        *self == GattStatus::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// The connection stages that wait on a platform callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    EnablingNotifications,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The user no longer wants to be connected.
    IntentWithdrawn,
    /// The platform reported the link as gone.
    LinkLost(GattStatus),
    ConnectFailed(GattStatus),
    DiscoveryFailed(GattStatus),
    NotifiableCharacteristicMissing,
    NotificationEnableFailed(GattStatus),
    ScanFailed(i32),
    Timeout(Stage),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::IntentWithdrawn => write!(f, "connectIntentWithdrawn"),
            DisconnectReason::LinkLost(status) => write!(f, "link lost ({})", status),
            DisconnectReason::ConnectFailed(status) => write!(f, "connect failed ({})", status),
            DisconnectReason::DiscoveryFailed(status) => write!(f, "service discovery failed ({})", status),
            DisconnectReason::NotifiableCharacteristicMissing => write!(f, "notifiable characteristic missing"),
            DisconnectReason::NotificationEnableFailed(status) => write!(f, "enabling notifications failed ({})", status),
            DisconnectReason::ScanFailed(code) => write!(f, "scan failed (code {})", code),
            DisconnectReason::Timeout(stage) => write!(f, "timed out while {:?}", stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    EnablingNotifications,
    Ready,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    /// True while a connection attempt is between the identity match and Ready.
    pub fn is_converging(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::NegotiatingMtu
                | ConnectionState::DiscoveringServices
                | ConnectionState::EnablingNotifications
        )
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ConnectionState::Connecting => Some(Stage::Connecting),
            ConnectionState::NegotiatingMtu => Some(Stage::NegotiatingMtu),
            ConnectionState::DiscoveringServices => Some(Stage::DiscoveringServices),
            ConnectionState::EnablingNotifications => Some(Stage::EnablingNotifications),
            ConnectionState::Disconnecting => Some(Stage::Disconnecting),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == ConnectionState::Ready
    }
}

/// How value pushes are enabled on the repetition characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Indication,
    Notification,
}

impl SubscriptionMode {
    /// Picks indications when supported, otherwise notifications.
    pub fn for_properties(indicate: bool, notify: bool) -> Option<SubscriptionMode> {
        if indicate {
            Some(SubscriptionMode::Indication)
        } else if notify {
            Some(SubscriptionMode::Notification)
        } else {
            None
        }
    }

    /// The value written to the CCCD to enable this mode.
    pub fn descriptor_value(&self) -> [u8; 2] {
        match self {
            SubscriptionMode::Indication => CCC_ENABLE_INDICATION,
            SubscriptionMode::Notification => CCC_ENABLE_NOTIFICATION,
        }
    }
}

/// Prompts for the user that the core cannot resolve by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    PermissionRequired,
    EnableBluetooth,
    BluetoothUnsupported,
    ScanFailed(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    IntentChange(bool),
    Notice(Notice),
}

/// Why a scan could not be started or was ended by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    PermissionDenied,
    BluetoothUnsupported,
    Code(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub indicate: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Locates the repetition statistics characteristic in a discovered GATT table.
pub fn find_repetition_characteristic(services: &[ServiceInfo]) -> Option<&CharacteristicInfo> {
    services.iter()
        .filter(|service| service.uuid == REP_STATISTICS_SERVICE)
        .flat_map(|service| service.characteristics.iter())
        .find(|characteristic| characteristic.uuid == REP_STATISTICS_CHARACTERISTIC)
}
