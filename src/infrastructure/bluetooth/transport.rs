//! Transport capability
//!
//! The platform BLE layer a session drives. Implementations perform
//! discovery, connection, pairing, GATT enumeration and characteristic I/O;
//! sessions only ever see the types in this module.

use crate::domain::errors::TransportError;
use crate::domain::models::DeviceAddress;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

/// Opaque handle for an established link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub uuid: Uuid,
    pub handle: u16,
}

/// GATT characteristic properties relevant to the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub const READ: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
        indicate: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        write_without_response: false,
        notify: false,
        indicate: false,
    };
    pub const NOTIFY: Self = Self {
        read: false,
        write: false,
        write_without_response: false,
        notify: true,
        indicate: false,
    };

    /// Union of two property sets
    pub const fn with(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            write_without_response: self.write_without_response || other.write_without_response,
            notify: self.notify || other.notify,
            indicate: self.indicate || other.indicate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharRef {
    pub service: Uuid,
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: CharProperties,
}

impl CharRef {
    /// Lowercase hyphenated UUID text used for role lookup
    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
    AccessDenied,
}

/// How the transport answers a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPolicy {
    /// Accept every confirmation prompt without user interaction
    AutoConfirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairResult {
    Paired,
    AlreadyPaired,
    Rejected,
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpairResult {
    Unpaired,
    NotPaired,
    Failed,
}

/// Discovery filter: the address a session is looking for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub address: Option<DeviceAddress>,
    /// Full enumeration instead of passive advertisement watching
    pub full_enumeration: bool,
}

/// Link state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// A value pushed by the peripheral on a notifying characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChanged {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Lazy, time-bounded stream of discovered devices
    ///
    /// Dropping the stream cancels the underlying scan.
    async fn scan(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<BoxStream<'static, DeviceRef>, TransportError>;

    async fn connect(&self, device: &DeviceRef) -> Result<ConnectionHandle, TransportError>;

    /// Release the link and every resource tied to `handle`
    async fn release(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    async fn is_paired(&self, handle: ConnectionHandle) -> Result<bool, TransportError>;

    async fn pair(
        &self,
        handle: ConnectionHandle,
        policy: PairingPolicy,
    ) -> Result<PairResult, TransportError>;

    async fn unpair(&self, handle: ConnectionHandle) -> Result<UnpairResult, TransportError>;

    async fn list_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<ServiceRef>, TransportError>;

    async fn list_characteristics(
        &self,
        handle: ConnectionHandle,
        service: &ServiceRef,
    ) -> Result<Vec<CharRef>, TransportError>;

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
        value: &[u8],
    ) -> Result<GattStatus, TransportError>;

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<GattStatus, TransportError>;

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<GattStatus, TransportError>;

    /// Values pushed on any subscribed characteristic of `handle`
    fn value_changes(&self, handle: ConnectionHandle) -> BoxStream<'static, ValueChanged>;

    /// Link status transitions of `handle`
    fn connection_status_changes(&self, handle: ConnectionHandle)
        -> BoxStream<'static, LinkStatus>;
}
