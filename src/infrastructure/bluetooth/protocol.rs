//! IMU Device Protocol
//!
//! Characteristic identifiers, command codes and connection constants for
//! the wearable IMU devices.

/// Length of a 16-bit short UUID written as hex text (e.g. `2a19`)
pub const SHORT_UUID_LENGTH: usize = 4;

/// Command characteristic (write)
pub const COMMAND_UUID: &str = "da9e0002-0000-1000-8000-00805f9b34fb";

/// Data request characteristic
pub const DATA_REQUEST_UUID: &str = "da9e0003-0000-1000-8000-00805f9b34fb";

/// Data stream characteristic (notify)
pub const DATA_STREAM_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

pub const DEVICE_NAME_SHORT_UUID: &str = "2a00";
pub const BATTERY_LEVEL_SHORT_UUID: &str = "2a19";
pub const MODEL_NUMBER_SHORT_UUID: &str = "2a24";
pub const SERIAL_NUMBER_SHORT_UUID: &str = "2a25";
pub const FIRMWARE_REVISION_NUMBER_SHORT_UUID: &str = "2a26";
pub const SOFTWARE_REVISION_NUMBER_SHORT_UUID: &str = "2a28";
pub const MANUFACTURER_SHORT_UUID: &str = "2a29";

/// Advertisement watcher scan bound
pub const QUICK_SCAN_TIMEOUT_SECS: u64 = 10;
/// Full enumeration scan bound
pub const SLOW_SCAN_TIMEOUT_SECS: u64 = 60;

/// Slots in the reference fleet
pub const TOTAL_NUMBER_OF_DEVICES: usize = 3;

/// Characteristic roles a session resolves during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicRole {
    Command,
    DataRequest,
    DataStream,
    DeviceName,
    BatteryLevel,
    ModelNumber,
    SerialNumber,
    FirmwareRevision,
    SoftwareRevision,
    Manufacturer,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 10] = [
        Self::Command,
        Self::DataRequest,
        Self::DataStream,
        Self::DeviceName,
        Self::BatteryLevel,
        Self::ModelNumber,
        Self::SerialNumber,
        Self::FirmwareRevision,
        Self::SoftwareRevision,
        Self::Manufacturer,
    ];

    /// Roles that must resolve before a session is ready
    pub const REQUIRED: [CharacteristicRole; 2] = [Self::Command, Self::DataStream];

    /// Full UUID for vendor roles, short UUID for standard roles
    pub fn uuid(self) -> &'static str {
        match self {
            Self::Command => COMMAND_UUID,
            Self::DataRequest => DATA_REQUEST_UUID,
            Self::DataStream => DATA_STREAM_UUID,
            Self::DeviceName => DEVICE_NAME_SHORT_UUID,
            Self::BatteryLevel => BATTERY_LEVEL_SHORT_UUID,
            Self::ModelNumber => MODEL_NUMBER_SHORT_UUID,
            Self::SerialNumber => SERIAL_NUMBER_SHORT_UUID,
            Self::FirmwareRevision => FIRMWARE_REVISION_NUMBER_SHORT_UUID,
            Self::SoftwareRevision => SOFTWARE_REVISION_NUMBER_SHORT_UUID,
            Self::Manufacturer => MANUFACTURER_SHORT_UUID,
        }
    }
}

/// Device command register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    StartDevice,
    StopLogging,
    StopImu,
    DisableSdLogging,
    EnableSdLogging,
    ToggleBleLogging,
    ToggleSerialLogging,
    EnableUsbMount,
}

impl DeviceCommand {
    /// Application-level command code
    pub fn code(self) -> u16 {
        match self {
            Self::StartDevice => 0x3001,
            Self::StopLogging => 0x3000,
            Self::StopImu => 0x30FF,
            Self::DisableSdLogging => 0x3200,
            Self::EnableSdLogging => 0x3201,
            Self::ToggleBleLogging => 0x3401,
            Self::ToggleSerialLogging => 0x3601,
            Self::EnableUsbMount => 0x3801,
        }
    }

    /// In-memory (little-endian) representation of the code
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.code().to_le_bytes()
    }

    /// Bytes as written to the command characteristic (big-endian)
    pub fn wire_bytes(self) -> Vec<u8> {
        to_wire_order(&self.to_le_bytes())
    }
}

/// Reverse an in-memory little-endian command into wire order
pub fn to_wire_order(command: &[u8]) -> Vec<u8> {
    command.iter().rev().copied().collect()
}

/// Match a characteristic UUID against a lookup key
///
/// Short keys match by containment, anything else by exact equality.
/// Comparison ignores case since platforms differ in UUID formatting.
pub fn uuid_matches(characteristic_uuid: &str, key: &str) -> bool {
    let characteristic_uuid = characteristic_uuid.to_ascii_lowercase();
    let key = key.to_ascii_lowercase();
    if key.len() == SHORT_UUID_LENGTH {
        characteristic_uuid.contains(&key)
    } else {
        characteristic_uuid == key
    }
}
