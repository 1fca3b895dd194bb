use std::time::Duration;
use uuid::Uuid;

/**
 * The hardware address of the OpenVBT unit to connect to.
 */
pub const OPENVBT_ADDRESS: &str = "5C:60:D3:6C:82:1C";

/**
 * The UUID of the Bluetooth BLE service that carries the repetition statistics.
 */
pub const REP_STATISTICS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic that notifies one repetition per value.
 */
pub const REP_STATISTICS_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/**
 * The Client Characteristic Configuration Descriptor (0x2902).
 */
pub const CCC_DESCRIPTOR: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const CCC_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
pub const CCC_ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];

/**
 * The largest ATT MTU, requested so that a full repetition record fits in one notification.
 */
pub const GATT_MAX_MTU_SIZE: u16 = 517;

/**
 * How long to wait between stopping the scan and connecting to the matched unit.
 * The platform connect callback does not fire reliably when connecting right after a scan stop.
 */
pub const SCAN_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/**
 * How long to wait after the connected callback before discovering services.
 * Discovery started earlier does not report back on the first connection, and the MTU callback
 * is not guaranteed to arrive, so discovery is started on this timer instead of after the MTU.
 */
pub const SERVICE_DISCOVERY_DELAY: Duration = Duration::from_millis(1000);

/**
 * Default bound on a single connection stage (connect, discovery, subscribe, disconnect).
 */
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_millis(15_000);

/**
 * Reported by the btleplug backend when a scan fails for a reason other than permissions.
 */
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

/**
 * Bound on asking the platform whether a peripheral is still connected.
 * On macOS this call has been seen to never return.
 */
pub const IS_CONNECTED_DEADLINE: Duration = Duration::from_millis(2000);

/**
 * Bound on a single platform disconnect call.
 */
pub const DISCONNECT_DEADLINE: Duration = Duration::from_millis(2000);

/**
 * Bound on releasing a connection handle, after which the connection worker moves on without it.
 */
pub const CLOSE_DEADLINE: Duration = Duration::from_millis(5000);
