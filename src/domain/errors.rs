//! Error taxonomy for sessions, the fleet and the persistence sink.

use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::infrastructure::bluetooth::transport::Transport)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0:#X} was not found before the scan timed out")]
    TransportUnavailable(u64),
    #[error("pairing was rejected: {0}")]
    PairingRejected(String),
    #[error("connection handle is no longer valid")]
    InvalidHandle,
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("device {0:#X} is unavailable (scan timed out)")]
    TransportUnavailable(u64),
    #[error("required characteristics unresolved: {missing:?}")]
    ServiceDiscoveryIncomplete { missing: Vec<String> },
    #[error("connect attempt superseded by disconnect")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("session is not connected")]
    NotConnected,
    #[error("pairing is not allowed while the stream is enabled")]
    StreamActive,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("session is not connected")]
    NotConnected,
    #[error("characteristic {0} is not resolved")]
    MissingCharacteristic(String),
    #[error("characteristic {0} does not support writes")]
    Unsupported(String),
    #[error("write failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("session is not connected")]
    NotConnected,
    #[error("characteristic {0} is not resolved")]
    MissingCharacteristic(String),
    #[error("characteristic {0} does not support reads")]
    Unsupported(String),
    #[error("read failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("session is not ready (state {0})")]
    NotReady(String),
    #[error("stream is already enabled")]
    AlreadyStreaming,
    #[error("stream is not enabled")]
    NotStreaming,
    #[error("data-stream characteristic does not support notifications")]
    NotifyUnsupported,
    #[error("notify subscription failed: {0}")]
    Subscribe(String),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O failure on {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sink has not been opened")]
    NotOpen,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("fleet has no slots")]
    EmptyFleet,
    #[error("unknown slot {0}")]
    UnknownSlot(String),
    #[error("slots not ready: {slots:?}")]
    NotReady { slots: Vec<String> },
    #[error("stream not confirmed on slots: {slots:?}")]
    StreamNotConfirmed { slots: Vec<String> },
}
