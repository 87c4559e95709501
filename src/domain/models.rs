use serde::{Deserialize, Serialize};
use std::fmt;

/// Bluetooth device address as reported by the transport (48-bit value)
pub type DeviceAddress = u64;

/// A logical fleet slot bound to a physical device address
///
/// Immutable once a session has been created for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Logical slot name, e.g. `Device_1`
    pub name: String,
    pub address: DeviceAddress,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, address: DeviceAddress) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#014X})", self.name, self.address)
    }
}

/// Per-session connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Pairing,
    Paired,
    Unpaired,
    ServicesResolving,
    Ready,
    Streaming,
    Disconnecting,
    Disconnected,
    Timeout,
}

impl ConnectionState {
    /// True for every state in which the transport link is up
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::Pairing
                | Self::Paired
                | Self::Unpaired
                | Self::ServicesResolving
                | Self::Ready
                | Self::Streaming
        )
    }

    /// A connect attempt is underway or has already succeeded
    pub fn is_active(self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting) || self.is_connected()
    }

    /// Terminal states a fresh connect attempt may start from
    pub fn is_terminal(self) -> bool {
        !self.is_active() && self != Self::Disconnecting
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Notify-stream progress, tracked separately from the link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    /// No subscription on the data-stream characteristic
    Stopped,
    /// Subscribed and start command written, no notification seen yet
    Requested,
    /// At least one notification received since the stream was enabled
    Notifying,
}

/// Connection-status channel payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Timeout,
    Paired,
    Unpaired,
}

/// Classification tag attached to status and data events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Error,
    Warning,
    Empty,
    Status,
    Success,
    Failed,
    Data,
}

impl MsgType {
    /// Numeric code used by the device tooling (negative for problems)
    pub fn code(self) -> i8 {
        match self {
            Self::Error => -1,
            Self::Warning => -2,
            Self::Empty => 0,
            Self::Status => 1,
            Self::Success => 2,
            Self::Failed => 3,
            Self::Data => 4,
        }
    }
}

/// Status channel payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Slot name of the emitting session
    pub source: String,
    pub kind: MsgType,
    pub message: String,
    pub data: Option<Vec<u8>>,
}

/// Connection-status channel payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    pub origin: DisconnectOrigin,
}

/// Who initiated a disconnect; `Local` for every non-disconnect status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectOrigin {
    Local,
    Remote,
}

/// Data-notification channel payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub source: String,
    pub kind: MsgType,
    pub data: Vec<u8>,
}

impl NotificationEvent {
    /// Payload rendered as ASCII text, non-ASCII bytes replaced
    pub fn as_text(&self) -> String {
        ascii_text(&self.data)
    }
}

/// Render bytes the way the devices send them: plain ASCII
pub fn ascii_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Standard device information, read by short UUID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub battery_level: Option<u8>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
    pub software_revision: Option<String>,
    pub manufacturer: Option<String>,
}

/// Point-in-time view of one fleet slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub name: String,
    pub address: DeviceAddress,
    pub state: ConnectionState,
    pub stream: StreamState,
    pub paired: bool,
    pub saving: bool,
}

/// Point-in-time view of the whole fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSnapshot {
    pub streaming: bool,
    pub slots: Vec<SlotSnapshot>,
}
