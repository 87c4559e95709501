//! BLE Scanner Module
//!
//! Bounded, cancellable search for one device address.

use crate::domain::errors::TransportError;
use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::transport::{DeviceRef, ScanFilter, Transport};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(DeviceRef),
    TimedOut,
    Cancelled,
}

/// Scan until `address` shows up, `timeout` elapses or `cancel` fires
///
/// The transport scan is stopped on every outcome by dropping its stream.
pub async fn find_device(
    transport: &dyn Transport,
    address: DeviceAddress,
    full_enumeration: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ScanOutcome, TransportError> {
    let filter = ScanFilter {
        address: Some(address),
        full_enumeration,
    };
    info!(
        "Scanning for {:#X} ({}, {:?})",
        address,
        if full_enumeration { "full" } else { "quick" },
        timeout
    );

    let mut stream = transport.scan(filter, timeout).await?;

    let outcome = {
        let search = async {
            while let Some(device) = stream.next().await {
                if device.address == address {
                    return Some(device);
                }
                debug!("Ignoring advertisement from {:#X}", device.address);
            }
            None
        };

        tokio::select! {
            _ = cancel.cancelled() => ScanOutcome::Cancelled,
            found = tokio::time::timeout(timeout, search) => match found {
                Ok(Some(device)) => ScanOutcome::Found(device),
                Ok(None) | Err(_) => ScanOutcome::TimedOut,
            },
        }
    };
    drop(stream);

    debug!("Scan for {:#X} finished: {:?}", address, outcome);
    Ok(outcome)
}
