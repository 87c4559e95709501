//! Simulated Transport
//!
//! In-memory peripherals implementing [`Transport`]. Each simulated IMU
//! advertises its address, exposes the device-information, command and
//! data-stream characteristics, and emits ASCII sample lines on the data
//! stream between a start and a stop command. Used by the headless runner
//! and the test suites.

use crate::domain::errors::TransportError;
use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{
    DeviceCommand, BATTERY_LEVEL_SHORT_UUID, COMMAND_UUID, DATA_REQUEST_UUID, DATA_STREAM_UUID,
    DEVICE_NAME_SHORT_UUID, FIRMWARE_REVISION_NUMBER_SHORT_UUID, MANUFACTURER_SHORT_UUID,
    MODEL_NUMBER_SHORT_UUID, SERIAL_NUMBER_SHORT_UUID, SOFTWARE_REVISION_NUMBER_SHORT_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    CharProperties, CharRef, ConnectionHandle, DeviceRef, GattStatus, LinkStatus, PairResult,
    PairingPolicy, ScanFilter, ServiceRef, Transport, UnpairResult, ValueChanged,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

const DEVICE_INFO_SERVICE: u128 = 0x0000180a_0000_1000_8000_00805f9b34fb;
const GENERIC_ACCESS_SERVICE: u128 = 0x00001800_0000_1000_8000_00805f9b34fb;
const BATTERY_SERVICE: u128 = 0x0000180f_0000_1000_8000_00805f9b34fb;
const COMMAND_SERVICE: u128 = 0xda9e0001_0000_1000_8000_00805f9b34fb;
const STREAM_SERVICE: u128 = 0x6e400001_b5a3_f393_e0a9_e50e24dcca9e;

/// Interval between advertisements yielded by a scan
const ADVERTISING_INTERVAL: Duration = Duration::from_millis(2);

/// Expand a 16-bit short UUID onto the Bluetooth base UUID
pub fn short_uuid(short: &str) -> Uuid {
    let value = u128::from_str_radix(short, 16).unwrap_or_default();
    Uuid::from_u128((value << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

fn full_uuid(text: &str) -> Uuid {
    Uuid::parse_str(text).unwrap_or_default()
}

/// Everything the simulated transport was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Connect(DeviceAddress),
    Release(DeviceAddress),
    Pair(DeviceAddress),
    Unpair(DeviceAddress),
    Read {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    Write {
        address: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Subscribe {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    Unsubscribe {
        address: DeviceAddress,
        characteristic: Uuid,
    },
}

/// Configuration of one simulated peripheral
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub address: DeviceAddress,
    pub name: String,
    pub advertises: bool,
    pub services: Vec<(ServiceRef, Vec<CharRef>)>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub pair_result: PairResult,
    /// Emit samples after the start command
    pub streams_on_start: bool,
    pub stream_interval: Duration,
    pub discovery_delay: Duration,
    /// Time taken to answer a pairing-state query
    pub pairing_query_delay: Duration,
    pub fail_writes: bool,
}

impl SimulatedDevice {
    /// A fully featured IMU at `address`
    pub fn imu(address: DeviceAddress) -> Self {
        let mut next_handle = 0u16;
        let mut make = |service: u128, uuid: Uuid, properties: CharProperties| {
            next_handle += 1;
            CharRef {
                service: Uuid::from_u128(service),
                uuid,
                handle: next_handle,
                properties,
            }
        };

        let read = CharProperties::READ;
        let generic_access = vec![make(
            GENERIC_ACCESS_SERVICE,
            short_uuid(DEVICE_NAME_SHORT_UUID),
            read,
        )];
        let battery = vec![make(
            BATTERY_SERVICE,
            short_uuid(BATTERY_LEVEL_SHORT_UUID),
            read.with(CharProperties::NOTIFY),
        )];
        let device_info: Vec<CharRef> = [
            MODEL_NUMBER_SHORT_UUID,
            SERIAL_NUMBER_SHORT_UUID,
            FIRMWARE_REVISION_NUMBER_SHORT_UUID,
            SOFTWARE_REVISION_NUMBER_SHORT_UUID,
            MANUFACTURER_SHORT_UUID,
        ]
        .into_iter()
        .map(|s| make(DEVICE_INFO_SERVICE, short_uuid(s), read))
        .collect();
        let command = vec![
            make(COMMAND_SERVICE, full_uuid(COMMAND_UUID), CharProperties::WRITE),
            make(
                COMMAND_SERVICE,
                full_uuid(DATA_REQUEST_UUID),
                CharProperties::WRITE.with(read),
            ),
        ];
        let data_stream = vec![make(
            STREAM_SERVICE,
            full_uuid(DATA_STREAM_UUID),
            CharProperties::NOTIFY,
        )];

        let services = [
            (GENERIC_ACCESS_SERVICE, generic_access),
            (BATTERY_SERVICE, battery),
            (DEVICE_INFO_SERVICE, device_info),
            (COMMAND_SERVICE, command),
            (STREAM_SERVICE, data_stream),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (uuid, chars))| {
            (
                ServiceRef {
                    uuid: Uuid::from_u128(uuid),
                    handle: 0x100 + i as u16,
                },
                chars,
            )
        })
        .collect();

        let name = format!("IMU-{:04X}", address & 0xFFFF);
        let mut values = HashMap::new();
        values.insert(short_uuid(DEVICE_NAME_SHORT_UUID), name.clone().into_bytes());
        values.insert(short_uuid(BATTERY_LEVEL_SHORT_UUID), vec![87]);
        values.insert(short_uuid(MODEL_NUMBER_SHORT_UUID), b"IMU-9".to_vec());
        values.insert(
            short_uuid(SERIAL_NUMBER_SHORT_UUID),
            format!("SN{:08}", address).into_bytes(),
        );
        values.insert(
            short_uuid(FIRMWARE_REVISION_NUMBER_SHORT_UUID),
            b"1.4.2".to_vec(),
        );
        values.insert(
            short_uuid(SOFTWARE_REVISION_NUMBER_SHORT_UUID),
            b"2.0.0".to_vec(),
        );
        values.insert(short_uuid(MANUFACTURER_SHORT_UUID), b"Wearable Labs".to_vec());

        Self {
            address,
            name,
            advertises: true,
            services,
            values,
            pair_result: PairResult::Paired,
            streams_on_start: true,
            stream_interval: Duration::from_millis(5),
            discovery_delay: Duration::ZERO,
            pairing_query_delay: Duration::ZERO,
            fail_writes: false,
        }
    }

    /// Never shows up in a scan
    pub fn hidden(mut self) -> Self {
        self.advertises = false;
        self
    }

    /// Accepts the start command but never notifies
    pub fn silent(mut self) -> Self {
        self.streams_on_start = false;
        self
    }

    /// Drop a characteristic so it never resolves
    pub fn without_characteristic(mut self, uuid: &str) -> Self {
        let target = if uuid.len() == 4 {
            short_uuid(uuid)
        } else {
            full_uuid(uuid)
        };
        for (_, chars) in &mut self.services {
            chars.retain(|c| c.uuid != target);
        }
        self
    }

    /// Replace the properties of a characteristic
    pub fn with_properties(mut self, uuid: &str, properties: CharProperties) -> Self {
        let target = full_uuid(uuid);
        for (_, chars) in &mut self.services {
            for c in chars.iter_mut().filter(|c| c.uuid == target) {
                c.properties = properties;
            }
        }
        self
    }

    pub fn with_pair_result(mut self, result: PairResult) -> Self {
        self.pair_result = result;
        self
    }

    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    pub fn with_pairing_query_delay(mut self, delay: Duration) -> Self {
        self.pairing_query_delay = delay;
        self
    }

    pub fn with_failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

struct Connection {
    address: DeviceAddress,
    subscribed: HashSet<Uuid>,
    values: broadcast::Sender<ValueChanged>,
    link: broadcast::Sender<LinkStatus>,
    streamer: Option<JoinHandle<()>>,
}

impl Connection {
    fn stop_streamer(&mut self) {
        if let Some(task) = self.streamer.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct SimState {
    devices: HashMap<DeviceAddress, SimulatedDevice>,
    connections: HashMap<ConnectionHandle, Connection>,
    paired: HashSet<DeviceAddress>,
    ops: Vec<TransportOp>,
    next_handle: u64,
}

struct ScanGuard(Arc<AtomicUsize>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    active_scans: Arc<AtomicUsize>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.state.lock().devices.insert(device.address, device);
    }

    /// Scans whose stream is still alive
    pub fn active_scans(&self) -> usize {
        self.active_scans.load(Ordering::SeqCst)
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.state.lock().ops.clone()
    }

    /// Values written to `address`, in order
    pub fn writes_to(&self, address: DeviceAddress) -> Vec<(Uuid, Vec<u8>)> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                TransportOp::Write {
                    address: a,
                    characteristic,
                    value,
                } if *a == address => Some((*characteristic, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count_ops(&self, predicate: impl Fn(&TransportOp) -> bool) -> usize {
        self.state.lock().ops.iter().filter(|op| predicate(op)).count()
    }

    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.state
            .lock()
            .connections
            .values()
            .any(|c| c.address == address)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Characteristics of `address` with notifications switched on
    pub fn subscriptions(&self, address: DeviceAddress) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| c.address == address)
            .map(|c| c.subscribed.len())
            .sum()
    }

    pub fn is_bonded(&self, address: DeviceAddress) -> bool {
        self.state.lock().paired.contains(&address)
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, address: DeviceAddress) {
        let mut state = self.state.lock();
        let handle = state
            .connections
            .iter()
            .find(|(_, c)| c.address == address)
            .map(|(h, _)| *h);
        if let Some(handle) = handle {
            if let Some(mut conn) = state.connections.remove(&handle) {
                conn.stop_streamer();
                let _ = conn.link.send(LinkStatus::Disconnected);
                debug!("Simulated link loss on {:#X}", address);
            }
        }
    }

    /// Push a value on a characteristic as if the peripheral notified it
    pub fn inject(&self, address: DeviceAddress, characteristic: Uuid, value: Vec<u8>) {
        let state = self.state.lock();
        for conn in state.connections.values().filter(|c| c.address == address) {
            let _ = conn.values.send(ValueChanged {
                characteristic,
                value: value.clone(),
            });
        }
    }

    fn device_for(
        &self,
        handle: ConnectionHandle,
    ) -> Result<(DeviceAddress, SimulatedDevice), TransportError> {
        let state = self.state.lock();
        let address = state
            .connections
            .get(&handle)
            .map(|c| c.address)
            .ok_or(TransportError::InvalidHandle)?;
        let device = state
            .devices
            .get(&address)
            .cloned()
            .ok_or(TransportError::InvalidHandle)?;
        Ok((address, device))
    }

    fn start_streamer(&self, handle: ConnectionHandle, interval: Duration) {
        let state_ref = self.state.clone();
        let data_stream = full_uuid(DATA_STREAM_UUID);
        let task = tokio::spawn(async move {
            let mut seq: u64 = 0;
            loop {
                tokio::time::sleep(interval).await;
                let state = state_ref.lock();
                let Some(conn) = state.connections.get(&handle) else {
                    break;
                };
                if conn.subscribed.contains(&data_stream) {
                    let line = format!(
                        "{},{:.3},{:.3},{:.3}\n",
                        seq,
                        (seq as f64 * 0.1).sin(),
                        (seq as f64 * 0.1).cos(),
                        9.81
                    );
                    trace!("Simulated sample {} on {:#X}", seq, conn.address);
                    let _ = conn.values.send(ValueChanged {
                        characteristic: data_stream,
                        value: line.into_bytes(),
                    });
                    seq += 1;
                }
            }
        });

        let mut state = self.state.lock();
        match state.connections.get_mut(&handle) {
            Some(conn) => {
                conn.stop_streamer();
                conn.streamer = Some(task);
            }
            None => task.abort(),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<BoxStream<'static, DeviceRef>, TransportError> {
        let found: Vec<DeviceRef> = {
            let state = self.state.lock();
            let mut devices: Vec<_> = state
                .devices
                .values()
                .filter(|d| d.advertises)
                .map(|d| DeviceRef {
                    address: d.address,
                    name: Some(d.name.clone()),
                })
                .collect();
            devices.sort_by_key(|d| d.address);
            devices
        };
        trace!("Simulated scan ({:?}): {} advertisers", filter, found.len());

        self.active_scans.fetch_add(1, Ordering::SeqCst);
        let guard = ScanGuard(self.active_scans.clone());
        let deadline = Instant::now() + timeout;

        let stream = stream::unfold(
            (found.into_iter(), guard),
            move |(mut pending, guard)| async move {
                match pending.next() {
                    Some(device) => {
                        tokio::time::sleep(ADVERTISING_INTERVAL).await;
                        Some((device, (pending, guard)))
                    }
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        drop(guard);
                        None
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn connect(&self, device: &DeviceRef) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.state.lock();
        if !state.devices.contains_key(&device.address) {
            return Err(TransportError::Failed(format!(
                "no peripheral at {:#X}",
                device.address
            )));
        }
        state.next_handle += 1;
        let handle = ConnectionHandle(state.next_handle);
        let (values, _) = broadcast::channel(256);
        let (link, _) = broadcast::channel(16);
        state.connections.insert(
            handle,
            Connection {
                address: device.address,
                subscribed: HashSet::new(),
                values,
                link,
                streamer: None,
            },
        );
        state.ops.push(TransportOp::Connect(device.address));
        Ok(handle)
    }

    async fn release(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let mut conn = state
            .connections
            .remove(&handle)
            .ok_or(TransportError::InvalidHandle)?;
        conn.stop_streamer();
        state.ops.push(TransportOp::Release(conn.address));
        Ok(())
    }

    async fn is_paired(&self, handle: ConnectionHandle) -> Result<bool, TransportError> {
        let (address, device) = self.device_for(handle)?;
        if !device.pairing_query_delay.is_zero() {
            tokio::time::sleep(device.pairing_query_delay).await;
        }
        Ok(self.state.lock().paired.contains(&address))
    }

    async fn pair(
        &self,
        handle: ConnectionHandle,
        policy: PairingPolicy,
    ) -> Result<PairResult, TransportError> {
        let (address, device) = self.device_for(handle)?;
        let mut state = self.state.lock();
        state.ops.push(TransportOp::Pair(address));
        debug!("Simulated pairing with {:#X} ({:?})", address, policy);
        if state.paired.contains(&address) {
            return Ok(PairResult::AlreadyPaired);
        }
        if device.pair_result == PairResult::Paired {
            state.paired.insert(address);
        }
        Ok(device.pair_result)
    }

    async fn unpair(&self, handle: ConnectionHandle) -> Result<UnpairResult, TransportError> {
        let (address, _) = self.device_for(handle)?;
        let mut state = self.state.lock();
        state.ops.push(TransportOp::Unpair(address));
        if state.paired.remove(&address) {
            Ok(UnpairResult::Unpaired)
        } else {
            Ok(UnpairResult::NotPaired)
        }
    }

    async fn list_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<ServiceRef>, TransportError> {
        let (_, device) = self.device_for(handle)?;
        Ok(device.services.iter().map(|(s, _)| s.clone()).collect())
    }

    async fn list_characteristics(
        &self,
        handle: ConnectionHandle,
        service: &ServiceRef,
    ) -> Result<Vec<CharRef>, TransportError> {
        let (_, device) = self.device_for(handle)?;
        if !device.discovery_delay.is_zero() {
            tokio::time::sleep(device.discovery_delay).await;
        }
        Ok(device
            .services
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, chars)| chars.clone())
            .unwrap_or_default())
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<Vec<u8>, TransportError> {
        let (address, device) = self.device_for(handle)?;
        self.state.lock().ops.push(TransportOp::Read {
            address,
            characteristic: characteristic.uuid,
        });
        Ok(device
            .values
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
        value: &[u8],
    ) -> Result<GattStatus, TransportError> {
        let (address, device) = self.device_for(handle)?;
        self.state.lock().ops.push(TransportOp::Write {
            address,
            characteristic: characteristic.uuid,
            value: value.to_vec(),
        });
        if device.fail_writes {
            return Ok(GattStatus::Unreachable);
        }
        if !characteristic.properties.write && !characteristic.properties.write_without_response
        {
            return Ok(GattStatus::ProtocolError);
        }

        if characteristic.uuid == full_uuid(COMMAND_UUID) {
            if value == DeviceCommand::StartDevice.wire_bytes().as_slice() {
                if device.streams_on_start {
                    self.start_streamer(handle, device.stream_interval);
                }
            } else if value == DeviceCommand::StopLogging.wire_bytes().as_slice()
                || value == DeviceCommand::StopImu.wire_bytes().as_slice()
            {
                if let Some(conn) = self.state.lock().connections.get_mut(&handle) {
                    conn.stop_streamer();
                }
            }
        }
        Ok(GattStatus::Success)
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<GattStatus, TransportError> {
        let mut state = self.state.lock();
        let conn = state
            .connections
            .get_mut(&handle)
            .ok_or(TransportError::InvalidHandle)?;
        if !characteristic.properties.notify && !characteristic.properties.indicate {
            return Ok(GattStatus::ProtocolError);
        }
        conn.subscribed.insert(characteristic.uuid);
        let address = conn.address;
        state.ops.push(TransportOp::Subscribe {
            address,
            characteristic: characteristic.uuid,
        });
        Ok(GattStatus::Success)
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharRef,
    ) -> Result<GattStatus, TransportError> {
        let mut state = self.state.lock();
        let conn = state
            .connections
            .get_mut(&handle)
            .ok_or(TransportError::InvalidHandle)?;
        conn.subscribed.remove(&characteristic.uuid);
        let address = conn.address;
        state.ops.push(TransportOp::Unsubscribe {
            address,
            characteristic: characteristic.uuid,
        });
        Ok(GattStatus::Success)
    }

    fn value_changes(&self, handle: ConnectionHandle) -> BoxStream<'static, ValueChanged> {
        let receiver = self
            .state
            .lock()
            .connections
            .get(&handle)
            .map(|c| c.values.subscribe());
        match receiver {
            Some(rx) => broadcast_stream(rx),
            None => stream::empty().boxed(),
        }
    }

    fn connection_status_changes(
        &self,
        handle: ConnectionHandle,
    ) -> BoxStream<'static, LinkStatus> {
        let receiver = self
            .state
            .lock()
            .connections
            .get(&handle)
            .map(|c| c.link.subscribe());
        match receiver {
            Some(rx) => broadcast_stream(rx),
            None => stream::empty().boxed(),
        }
    }
}

/// Adapt a broadcast receiver into a stream that ends when the sender closes
fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    BroadcastStream::new(rx)
        .filter_map(|item| async move {
            match item {
                Ok(item) => Some(item),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    debug!("Simulated stream lagged by {} items", n);
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            short_uuid("2a19").hyphenated().to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_commands_drive_samples() {
        let transport = SimulatedTransport::new();
        transport.add_device(SimulatedDevice::imu(0xA1));
        let handle = transport
            .connect(&DeviceRef {
                address: 0xA1,
                name: None,
            })
            .await
            .unwrap();

        let chars: Vec<CharRef> = {
            let mut all = Vec::new();
            for s in transport.list_services(handle).await.unwrap() {
                all.extend(transport.list_characteristics(handle, &s).await.unwrap());
            }
            all
        };
        let stream_char = chars
            .iter()
            .find(|c| c.uuid == full_uuid(DATA_STREAM_UUID))
            .unwrap();
        let command = chars
            .iter()
            .find(|c| c.uuid == full_uuid(COMMAND_UUID))
            .unwrap();

        let mut values = transport.value_changes(handle);
        transport.subscribe(handle, stream_char).await.unwrap();
        transport
            .write(handle, command, &DeviceCommand::StartDevice.wire_bytes())
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), values.next())
            .await
            .unwrap()
            .unwrap();
        assert!(first.value.starts_with(b"0,"));

        transport
            .write(handle, command, &DeviceCommand::StopLogging.wire_bytes())
            .await
            .unwrap();
        transport.release(handle).await.unwrap();
        assert!(!transport.is_connected(0xA1));
    }

    #[tokio::test]
    async fn test_link_loss_is_reported() {
        let transport = SimulatedTransport::new();
        transport.add_device(SimulatedDevice::imu(0xA1));
        let handle = transport
            .connect(&DeviceRef {
                address: 0xA1,
                name: None,
            })
            .await
            .unwrap();
        let mut link = transport.connection_status_changes(handle);

        transport.drop_link(0xA1);
        assert_eq!(link.next().await, Some(LinkStatus::Disconnected));
        assert_eq!(
            transport.release(handle).await,
            Err(TransportError::InvalidHandle)
        );
    }
}
