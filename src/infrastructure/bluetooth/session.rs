//! Device Session Module
//!
//! Drives one peripheral through discovery, connection, optional pairing,
//! GATT resolution, the notify stream and teardown.
//!
//! State lives behind a short-held lock; events are always published after
//! the lock is released. Every connect attempt owns a cancellation token
//! that `disconnect` fires, so a scan or discovery wait in flight ends
//! promptly and never overwrites the teardown state.

use crate::domain::errors::{
    ConnectError, PairError, ReadError, SinkError, StreamError, TransportError, WriteError,
};
use crate::domain::models::{
    ascii_text, ConnectionEvent, ConnectionState, ConnectionStatus, DeviceIdentity, DeviceInfo,
    DisconnectOrigin, MsgType, NotificationEvent, SlotSnapshot, StatusEvent, StreamState,
};
use crate::domain::settings::{
    PollPolicy, ScanMode, Settings, DEFAULT_DISCOVERY_POLL, DEFAULT_NOTIFY_POLL,
};
use crate::infrastructure::bluetooth::catalog::{NotifyingSet, ServiceCatalog};
use crate::infrastructure::bluetooth::poll::poll_until;
use crate::infrastructure::bluetooth::protocol::{
    to_wire_order, CharacteristicRole, DeviceCommand, COMMAND_UUID, QUICK_SCAN_TIMEOUT_SECS,
};
use crate::infrastructure::bluetooth::scanner::{find_device, ScanOutcome};
use crate::infrastructure::bluetooth::transport::{
    CharRef, ConnectionHandle, GattStatus, LinkStatus, PairResult, PairingPolicy, Transport,
    UnpairResult, ValueChanged,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::{generate_file_name, PersistenceSink};
use chrono::Local;
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Transitions kept for inspection
const HISTORY_LIMIT: usize = 64;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the discovery scan
    pub scan_timeout: Duration,
    /// Full enumeration instead of the quick advertisement watch
    pub full_enumeration: bool,
    /// Pair right after the link comes up
    pub pair_on_connect: bool,
    /// Wait for the required characteristics
    pub discovery_poll: PollPolicy,
    /// Wait for the first notification after the start command
    pub notify_poll: PollPolicy,
    /// Pause after the stop command before the stream counts as stopped
    pub stop_grace: Duration,
    /// First line of every save file
    pub save_title: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(QUICK_SCAN_TIMEOUT_SECS),
            full_enumeration: false,
            pair_on_connect: false,
            discovery_poll: DEFAULT_DISCOVERY_POLL,
            notify_poll: DEFAULT_NOTIFY_POLL,
            stop_grace: Duration::from_millis(10),
            save_title: "Device Data:".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scan_timeout: settings.scan_timeout(),
            full_enumeration: settings.scan_mode == ScanMode::Full,
            pair_on_connect: settings.pair_on_connect,
            discovery_poll: settings.discovery_poll,
            notify_poll: settings.notify_poll,
            stop_grace: settings.stop_grace(),
            save_title: settings.save_title.clone(),
        }
    }
}

struct SessionState {
    state: ConnectionState,
    stream: StreamState,
    /// A stream stop is underway; late notifications must not confirm the stream
    stopping: bool,
    paired: bool,
    saving: bool,
    handle: Option<ConnectionHandle>,
    catalog: ServiceCatalog,
    notifying: NotifyingSet,
    attempt: CancellationToken,
    link_task: Option<JoinHandle<()>>,
    value_task: Option<JoinHandle<()>>,
    last_origin: Option<DisconnectOrigin>,
    history: Vec<ConnectionState>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            stream: StreamState::Stopped,
            stopping: false,
            paired: false,
            saving: false,
            handle: None,
            catalog: ServiceCatalog::new(),
            notifying: NotifyingSet::new(),
            attempt: CancellationToken::new(),
            link_task: None,
            value_task: None,
            last_origin: None,
            history: vec![ConnectionState::Idle],
        }
    }

    fn set(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        trace!("{} -> {}", self.state, next);
        self.state = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(next);
    }
}

struct SessionInner {
    identity: DeviceIdentity,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    events: EventBus,
    sink: PersistenceSink,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn status(&self, kind: MsgType, message: impl Into<String>) {
        let event = StatusEvent {
            source: self.identity.name.clone(),
            kind,
            message: message.into(),
            data: None,
        };
        match kind {
            MsgType::Error | MsgType::Failed => warn!("[{}] {}", event.source, event.message),
            _ => debug!("[{}] {}", event.source, event.message),
        }
        self.events.status.publish(&event);
    }

    fn connection(&self, status: ConnectionStatus, origin: DisconnectOrigin) {
        self.events
            .connection
            .publish(&ConnectionEvent { status, origin });
    }

    /// Move to `next` unless the attempt was cancelled
    fn advance(&self, attempt: &CancellationToken, next: ConnectionState) -> bool {
        let mut st = self.state.lock();
        if attempt.is_cancelled() {
            return false;
        }
        st.set(next);
        true
    }

    fn is_notifying(&self) -> bool {
        self.state.lock().stream == StreamState::Notifying
    }

    async fn on_value_changed(&self, change: ValueChanged) {
        let (confirmed, save) = {
            let mut st = self.state.lock();
            let from_stream = st
                .catalog
                .get(CharacteristicRole::DataStream)
                .map_or(false, |c| c.uuid == change.characteristic);
            if from_stream && st.stream == StreamState::Stopped {
                trace!("[{}] Dropping late notification", self.identity.name);
                return;
            }
            let mut confirmed = false;
            if from_stream && st.stream == StreamState::Requested && !st.stopping {
                st.stream = StreamState::Notifying;
                if st.state == ConnectionState::Ready {
                    st.set(ConnectionState::Streaming);
                }
                confirmed = true;
            }
            (confirmed, from_stream && st.saving)
        };

        if confirmed {
            info!("[{}] Data stream active", self.identity.name);
            self.status(MsgType::Success, "Notifications received, stream active");
        }
        if save {
            if let Err(e) = self.sink.write(&payload_line(&change.value)).await {
                self.status(MsgType::Error, format!("Save failed: {}", e));
            }
        }
        self.events.notification.publish(&NotificationEvent {
            source: self.identity.name.clone(),
            kind: MsgType::Data,
            data: change.value,
        });
    }

    /// Shared tail of every teardown path
    async fn finish_teardown(&self, origin: DisconnectOrigin) {
        if let Err(e) = self.sink.close().await {
            error!("[{}] Closing save file failed: {}", self.identity.name, e);
        }
        {
            let mut st = self.state.lock();
            st.catalog.clear();
            st.notifying.drain();
            st.stream = StreamState::Stopped;
            st.stopping = false;
            st.saving = false;
            st.last_origin = Some(origin);
            st.set(ConnectionState::Disconnected);
        }
        let message = match origin {
            DisconnectOrigin::Local => "Device disconnected",
            DisconnectOrigin::Remote => "Connection lost",
        };
        self.status(MsgType::Status, message);
        self.connection(ConnectionStatus::Disconnected, origin);
    }
}

/// One peripheral's session; cheap to clone, clones share the session
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                identity,
                transport,
                config,
                events: EventBus::new(),
                sink: PersistenceSink::new(),
                state: Mutex::new(SessionState::new()),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn name(&self) -> &str {
        &self.inner.identity.name
    }

    /// Status, connection and notification channels of this session
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.state.lock().stream
    }

    /// At least one notification arrived since the stream was enabled
    pub fn is_notifying(&self) -> bool {
        self.inner.is_notifying()
    }

    /// Connected with every required characteristic resolved
    pub fn is_ready(&self) -> bool {
        let st = self.inner.state.lock();
        st.state.is_connected() && st.catalog.is_ready()
    }

    pub fn is_paired(&self) -> bool {
        self.inner.state.lock().paired
    }

    pub fn is_saving(&self) -> bool {
        self.inner.state.lock().saving
    }

    pub fn notifying_count(&self) -> usize {
        self.inner.state.lock().notifying.len()
    }

    pub fn last_disconnect_origin(&self) -> Option<DisconnectOrigin> {
        self.inner.state.lock().last_origin
    }

    /// Recent lifecycle states, oldest first
    pub fn state_history(&self) -> Vec<ConnectionState> {
        self.inner.state.lock().history.clone()
    }

    /// Resolved characteristic by short or full UUID
    pub fn find_characteristic(&self, uuid: &str) -> Option<CharRef> {
        self.inner.state.lock().catalog.find(uuid).cloned()
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let st = self.inner.state.lock();
        SlotSnapshot {
            name: self.inner.identity.name.clone(),
            address: self.inner.identity.address,
            state: st.state,
            stream: st.stream,
            paired: st.paired,
            saving: st.saving,
        }
    }

    /// Find, connect and resolve the device
    ///
    /// Returns the current state without side effects if an attempt is
    /// already underway or the session is already connected.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectError> {
        let inner = &self.inner;
        let identity = &inner.identity;

        let attempt = {
            let mut st = inner.state.lock();
            if !st.state.is_terminal() {
                debug!("[{}] Connect ignored in state {}", identity.name, st.state);
                return Ok(st.state);
            }
            st.attempt = CancellationToken::new();
            st.last_origin = None;
            st.set(ConnectionState::Scanning);
            st.attempt.clone()
        };
        info!("[{}] Connecting to {:#X}", identity.name, identity.address);
        inner.status(MsgType::Status, "Scanning for device...");

        // Step 1: Find the advertiser
        let outcome = find_device(
            inner.transport.as_ref(),
            identity.address,
            inner.config.full_enumeration,
            inner.config.scan_timeout,
            &attempt,
        )
        .await;
        let device = match outcome {
            Ok(ScanOutcome::Found(device)) => device,
            Ok(ScanOutcome::Cancelled) => return Err(ConnectError::Cancelled),
            Ok(ScanOutcome::TimedOut) => {
                if !inner.advance(&attempt, ConnectionState::Timeout) {
                    return Err(ConnectError::Cancelled);
                }
                inner.status(MsgType::Error, "Connection error. Device not found.");
                inner.connection(ConnectionStatus::Timeout, DisconnectOrigin::Local);
                return Err(ConnectError::TransportUnavailable(identity.address));
            }
            Err(e) => {
                if !inner.advance(&attempt, ConnectionState::Disconnected) {
                    return Err(ConnectError::Cancelled);
                }
                inner.status(MsgType::Error, format!("Scan failed: {}", e));
                return Err(e.into());
            }
        };

        // Step 2: Open the link
        if !inner.advance(&attempt, ConnectionState::Connecting) {
            return Err(ConnectError::Cancelled);
        }
        inner.status(MsgType::Status, "Device found, connecting...");
        let handle = match inner.transport.connect(&device).await {
            Ok(handle) => handle,
            Err(e) => {
                if !inner.advance(&attempt, ConnectionState::Disconnected) {
                    return Err(ConnectError::Cancelled);
                }
                inner.status(MsgType::Error, format!("Connection error: {}", e));
                return Err(e.into());
            }
        };

        // Step 3: Adopt the link unless a disconnect got there first
        let adopted = {
            let mut st = inner.state.lock();
            if attempt.is_cancelled() {
                false
            } else {
                st.handle = Some(handle);
                st.set(ConnectionState::Connected);
                st.link_task = Some(self.spawn_link_watch(handle));
                st.value_task = Some(self.spawn_value_pump(handle));
                true
            }
        };
        if !adopted {
            if let Err(e) = inner.transport.release(handle).await {
                debug!("[{}] Release of abandoned link failed: {}", identity.name, e);
            }
            return Err(ConnectError::Cancelled);
        }

        let paired = match inner.transport.is_paired(handle).await {
            Ok(paired) => paired,
            Err(e) => {
                warn!("[{}] Could not read pairing state: {}", identity.name, e);
                false
            }
        };
        {
            let mut st = inner.state.lock();
            if attempt.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            st.paired = paired;
        }
        info!("[{}] Connected (paired: {})", identity.name, paired);
        inner.status(MsgType::Success, "Connected to device");
        inner.connection(ConnectionStatus::Connected, DisconnectOrigin::Local);

        // Step 4: Optional pairing; a refusal keeps the link
        if inner.config.pair_on_connect && !paired {
            if let Err(e) = self.pair().await {
                warn!("[{}] Pairing failed, continuing unpaired: {}", identity.name, e);
            }
        }

        // Step 5: Resolve services and wait for the required characteristics
        if !inner.advance(&attempt, ConnectionState::ServicesResolving) {
            return Err(ConnectError::Cancelled);
        }
        inner.status(MsgType::Status, "Resolving services...");
        let discovery = tokio::spawn(resolve_services(inner.clone(), handle, attempt.clone()));
        let ready = poll_until(inner.config.discovery_poll, Some(&attempt), || {
            inner.state.lock().catalog.is_ready() || discovery.is_finished()
        })
        .await;
        if !ready {
            discovery.abort();
        }

        let missing = {
            let mut st = inner.state.lock();
            if attempt.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            let missing = st.catalog.missing_required();
            if missing.is_empty() {
                st.set(ConnectionState::Ready);
            } else {
                st.set(ConnectionState::Connected);
            }
            missing
        };
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(|r| format!("{:?}", r)).collect();
            inner.status(
                MsgType::Error,
                format!("Required characteristics unavailable: {}", missing.join(", ")),
            );
            return Err(ConnectError::ServiceDiscoveryIncomplete { missing });
        }

        info!("[{}] Ready", identity.name);
        inner.status(MsgType::Success, "Required characteristics resolved");
        Ok(ConnectionState::Ready)
    }

    fn spawn_link_watch(&self, handle: ConnectionHandle) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut changes = self.inner.transport.connection_status_changes(handle);
        tokio::spawn(async move {
            while let Some(status) = changes.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match status {
                    LinkStatus::Connected => {
                        debug!("[{}] Link reported connected", inner.identity.name)
                    }
                    LinkStatus::Disconnected => {
                        DeviceSession { inner }.handle_link_lost(handle).await;
                        break;
                    }
                }
            }
        })
    }

    fn spawn_value_pump(&self, handle: ConnectionHandle) -> JoinHandle<()> {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let mut values = self.inner.transport.value_changes(handle);
        tokio::spawn(async move {
            while let Some(change) = values.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_value_changed(change).await;
            }
        })
    }

    /// Teardown after the peripheral dropped the link
    async fn handle_link_lost(&self, handle: ConnectionHandle) {
        let inner = &self.inner;
        let (link_task, value_task, owned) = {
            let mut st = inner.state.lock();
            if st.handle != Some(handle)
                || matches!(
                    st.state,
                    ConnectionState::Disconnecting | ConnectionState::Disconnected
                )
            {
                return;
            }
            st.attempt.cancel();
            st.set(ConnectionState::Disconnecting);
            st.notifying.drain();
            (st.link_task.take(), st.value_task.take(), st.handle.take())
        };
        warn!("[{}] Link lost", inner.identity.name);

        // This runs on the link task itself; detach rather than abort it
        drop(link_task);
        if let Some(handle) = owned {
            if let Err(e) = inner.transport.release(handle).await {
                debug!("[{}] Release after link loss: {}", inner.identity.name, e);
            }
        }
        if let Some(task) = value_task {
            task.abort();
        }
        inner.finish_teardown(DisconnectOrigin::Remote).await;
    }

    /// Tear the session down; a no-op when already disconnected
    ///
    /// Cancels any connect attempt in flight, stops the stream, switches off
    /// every notification, revokes the link watch and releases the link.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let (stream_active, link_task) = {
            let mut st = inner.state.lock();
            if matches!(
                st.state,
                ConnectionState::Idle
                    | ConnectionState::Disconnected
                    | ConnectionState::Disconnecting
            ) {
                return;
            }
            st.attempt.cancel();
            st.set(ConnectionState::Disconnecting);
            let stream_active = st.stream != StreamState::Stopped && !st.stopping;
            if stream_active {
                st.stopping = true;
            }
            (stream_active && st.handle.is_some(), st.link_task.take())
        };
        info!("[{}] Disconnecting", inner.identity.name);

        // Step 1: Stop the stream
        if stream_active {
            self.stop_stream().await;
        }

        // Step 2: Switch off every remaining notification
        let (handle, remaining) = {
            let mut st = inner.state.lock();
            (st.handle, st.notifying.drain())
        };
        if let Some(handle) = handle {
            for characteristic in remaining {
                if let Err(e) = inner.transport.unsubscribe(handle, &characteristic).await {
                    debug!("[{}] Unsubscribe failed: {}", inner.identity.name, e);
                }
            }
        }

        // Step 3: Revoke the link watch so the release is not seen as a loss
        if let Some(task) = link_task {
            task.abort();
        }

        // Step 4: Release the link exactly once
        let handle = inner.state.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = inner.transport.release(handle).await {
                warn!("[{}] Release failed: {}", inner.identity.name, e);
            }
        }

        // Step 5: Local state
        let value_task = inner.state.lock().value_task.take();
        if let Some(task) = value_task {
            task.abort();
        }
        inner.finish_teardown(DisconnectOrigin::Local).await;
    }

    /// Subscribe to the data stream and send the start command
    ///
    /// Returns whether a notification confirmed the stream within the
    /// notify poll budget. An unconfirmed stream stays requested.
    pub async fn enable_stream(&self) -> Result<bool, StreamError> {
        let inner = &self.inner;
        let prepared = {
            let mut st = inner.state.lock();
            if st.stream != StreamState::Stopped || st.stopping {
                Err(StreamError::AlreadyStreaming)
            } else if st.state != ConnectionState::Ready {
                Err(StreamError::NotReady(st.state.to_string()))
            } else {
                match (st.handle, st.catalog.get(CharacteristicRole::DataStream).cloned()) {
                    (Some(handle), Some(data_stream)) if data_stream.properties.notify => {
                        st.stream = StreamState::Requested;
                        Ok((handle, data_stream))
                    }
                    (Some(_), Some(_)) => Err(StreamError::NotifyUnsupported),
                    _ => Err(StreamError::NotReady(st.state.to_string())),
                }
            }
        };
        let (handle, data_stream) = match prepared {
            Ok(prepared) => prepared,
            Err(StreamError::NotifyUnsupported) => {
                inner.status(
                    MsgType::Error,
                    "The characteristic does not support notify operations.",
                );
                return Err(StreamError::NotifyUnsupported);
            }
            Err(e) => return Err(e),
        };

        // Step 1: Switch notifications on
        let subscribed = inner.state.lock().notifying.contains(&data_stream);
        if !subscribed {
            let reason = match inner.transport.subscribe(handle, &data_stream).await {
                Ok(GattStatus::Success) => None,
                Ok(status) => Some(format!("{:?}", status)),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                inner.state.lock().stream = StreamState::Stopped;
                inner.status(
                    MsgType::Error,
                    "Could not update the client characteristic configuration.",
                );
                return Err(StreamError::Subscribe(reason));
            }
            inner.state.lock().notifying.insert(data_stream.clone());
        }
        inner.status(MsgType::Status, "Notifications requested on the data stream");

        // Step 2: Start the device
        if let Err(e) = self.send_command(DeviceCommand::StartDevice).await {
            let removed = {
                let mut st = inner.state.lock();
                st.stream = StreamState::Stopped;
                st.notifying.remove(&data_stream)
            };
            if removed {
                match inner.transport.unsubscribe(handle, &data_stream).await {
                    Ok(GattStatus::Success) => {}
                    Ok(status) => {
                        warn!("[{}] Unsubscribe returned {:?}", inner.identity.name, status)
                    }
                    Err(e) => warn!("[{}] Unsubscribe failed: {}", inner.identity.name, e),
                }
            }
            return Err(StreamError::Write(e));
        }

        // Step 3: Wait for the first notification
        let confirmed = poll_until(inner.config.notify_poll, None, || inner.is_notifying()).await;
        if !confirmed {
            warn!(
                "[{}] Stream requested but no notification within {:?}",
                inner.identity.name,
                inner.config.notify_poll.budget()
            );
        }
        Ok(confirmed)
    }

    /// Send the stop command and switch the data stream off
    ///
    /// Returns whether the stop command was written. The session returns
    /// to `Ready` either way.
    pub async fn disable_stream(&self) -> Result<bool, StreamError> {
        {
            let mut st = self.inner.state.lock();
            if st.stream == StreamState::Stopped || st.stopping || st.handle.is_none() {
                return Err(StreamError::NotStreaming);
            }
            st.stopping = true;
        }
        Ok(self.stop_stream().await)
    }

    async fn stop_stream(&self) -> bool {
        let inner = &self.inner;

        // Step 1: Stop command
        let written = match self.send_command(DeviceCommand::StopLogging).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] Stop command failed: {}", inner.identity.name, e);
                false
            }
        };

        // Step 2: Forget the subscription before switching it off
        let (handle, removed) = {
            let mut st = inner.state.lock();
            let data_stream = st.catalog.get(CharacteristicRole::DataStream).cloned();
            let removed = data_stream.filter(|c| st.notifying.remove(c));
            (st.handle, removed)
        };
        if let (Some(handle), Some(data_stream)) = (handle, removed) {
            match inner.transport.unsubscribe(handle, &data_stream).await {
                Ok(GattStatus::Success) => {}
                Ok(status) => warn!("[{}] Unsubscribe returned {:?}", inner.identity.name, status),
                Err(e) => warn!("[{}] Unsubscribe failed: {}", inner.identity.name, e),
            }
        }

        // Step 3: Let in-flight notifications drain
        tokio::time::sleep(inner.config.stop_grace).await;
        {
            let mut st = inner.state.lock();
            st.stream = StreamState::Stopped;
            st.stopping = false;
            if st.state == ConnectionState::Streaming {
                st.set(ConnectionState::Ready);
            }
        }
        info!("[{}] Data stream stopped", inner.identity.name);
        inner.status(MsgType::Status, "Data stream stopped");
        written
    }

    /// Write an in-memory (little-endian) command in wire order
    pub async fn write_command(&self, command: &[u8]) -> Result<(), WriteError> {
        self.write_characteristic(COMMAND_UUID, &to_wire_order(command))
            .await
    }

    pub async fn send_command(&self, command: DeviceCommand) -> Result<(), WriteError> {
        debug!("[{}] Sending {:?}", self.name(), command);
        self.write_command(&command.to_le_bytes()).await
    }

    /// Write a single byte to a characteristic
    pub async fn write_byte(&self, uuid: &str, value: u8) -> Result<(), WriteError> {
        self.write_characteristic(uuid, &[value]).await
    }

    /// Write raw bytes to a characteristic found by short or full UUID
    pub async fn write_characteristic(&self, uuid: &str, value: &[u8]) -> Result<(), WriteError> {
        let inner = &self.inner;
        let target = {
            let st = inner.state.lock();
            match st.handle {
                Some(handle)
                    if st.state.is_connected() || st.state == ConnectionState::Disconnecting =>
                {
                    match st.catalog.find(uuid) {
                        Some(c) if c.properties.write || c.properties.write_without_response => {
                            Ok((handle, c.clone()))
                        }
                        Some(_) => Err(WriteError::Unsupported(uuid.to_string())),
                        None => Err(WriteError::MissingCharacteristic(uuid.to_string())),
                    }
                }
                _ => Err(WriteError::NotConnected),
            }
        };
        let (handle, characteristic) = match target {
            Ok(target) => target,
            Err(e) => {
                let message = match &e {
                    WriteError::Unsupported(_) => {
                        "The characteristic does not support write operations.".to_string()
                    }
                    other => other.to_string(),
                };
                inner.status(MsgType::Error, message);
                return Err(e);
            }
        };

        match inner.transport.write(handle, &characteristic, value).await {
            Ok(GattStatus::Success) => {
                inner.status(
                    MsgType::Success,
                    format!("Data {} written to the characteristic.", ascii_text(value)),
                );
                Ok(())
            }
            Ok(status) => {
                inner.status(MsgType::Failed, "Could not write to the characteristic.");
                Err(WriteError::Failed(format!("{:?}", status)))
            }
            Err(e) => {
                inner.status(MsgType::Failed, "Could not write to the characteristic.");
                Err(WriteError::Failed(e.to_string()))
            }
        }
    }

    async fn read_raw(&self, uuid: &str) -> Result<Vec<u8>, ReadError> {
        let target = {
            let st = self.inner.state.lock();
            match st.handle {
                Some(handle) if st.state.is_connected() => match st.catalog.find(uuid) {
                    Some(c) if c.properties.read => Ok((handle, c.clone())),
                    Some(_) => Err(ReadError::Unsupported(uuid.to_string())),
                    None => Err(ReadError::MissingCharacteristic(uuid.to_string())),
                },
                _ => Err(ReadError::NotConnected),
            }
        };
        let (handle, characteristic) = target?;
        self.inner
            .transport
            .read(handle, &characteristic)
            .await
            .map_err(|e| ReadError::Failed(e.to_string()))
    }

    /// Read a characteristic found by short or full UUID
    pub async fn read_characteristic(&self, uuid: &str) -> Result<Vec<u8>, ReadError> {
        let result = self.read_raw(uuid).await;
        match &result {
            Ok(value) => self.inner.status(
                MsgType::Success,
                format!("Read {} from the characteristic.", ascii_text(value)),
            ),
            Err(e) => self.inner.status(MsgType::Error, e.to_string()),
        }
        result
    }

    /// Read the standard identification characteristics that resolved
    pub async fn read_device_info(&self) -> DeviceInfo {
        let text = |bytes: Option<Vec<u8>>| {
            bytes.map(|b| ascii_text(&b).trim_end_matches('\0').to_string())
        };
        let read = move |role: CharacteristicRole| self.read_raw(role.uuid());

        DeviceInfo {
            device_name: text(read(CharacteristicRole::DeviceName).await.ok()),
            battery_level: read(CharacteristicRole::BatteryLevel)
                .await
                .ok()
                .and_then(|b| b.first().copied()),
            model_number: text(read(CharacteristicRole::ModelNumber).await.ok()),
            serial_number: text(read(CharacteristicRole::SerialNumber).await.ok()),
            firmware_revision: text(read(CharacteristicRole::FirmwareRevision).await.ok()),
            software_revision: text(read(CharacteristicRole::SoftwareRevision).await.ok()),
            manufacturer: text(read(CharacteristicRole::Manufacturer).await.ok()),
        }
    }

    /// Pair the connected device, accepting the confirmation automatically
    ///
    /// A refusal is reported but keeps the link.
    pub async fn pair(&self) -> Result<ConnectionStatus, PairError> {
        let inner = &self.inner;
        let (handle, in_lifecycle) = {
            let mut st = inner.state.lock();
            let handle = match st.handle {
                Some(handle) if st.state.is_connected() => handle,
                _ => return Err(PairError::NotConnected),
            };
            if st.stream != StreamState::Stopped {
                return Err(PairError::StreamActive);
            }
            let in_lifecycle = matches!(
                st.state,
                ConnectionState::Connected | ConnectionState::Paired | ConnectionState::Unpaired
            );
            if in_lifecycle {
                st.set(ConnectionState::Pairing);
            }
            (handle, in_lifecycle)
        };
        inner.status(MsgType::Status, "Pairing...");

        let result = inner
            .transport
            .pair(handle, PairingPolicy::AutoConfirm)
            .await;
        let paired = matches!(result, Ok(PairResult::Paired | PairResult::AlreadyPaired));
        {
            let mut st = inner.state.lock();
            if result.is_ok() {
                st.paired = paired;
            }
            if in_lifecycle && st.state == ConnectionState::Pairing {
                st.set(if paired {
                    ConnectionState::Paired
                } else {
                    ConnectionState::Unpaired
                });
            }
        }

        match result {
            Ok(PairResult::Paired | PairResult::AlreadyPaired) => {
                info!("[{}] Paired", inner.identity.name);
                inner.status(MsgType::Success, "Pairing successful");
                inner.connection(ConnectionStatus::Paired, DisconnectOrigin::Local);
                Ok(ConnectionStatus::Paired)
            }
            Ok(refused) => {
                inner.status(MsgType::Failed, format!("Pairing failed: {:?}", refused));
                inner.connection(ConnectionStatus::Unpaired, DisconnectOrigin::Local);
                Err(PairError::Transport(TransportError::PairingRejected(
                    format!("{:?}", refused),
                )))
            }
            Err(e) => {
                inner.status(MsgType::Error, format!("Pairing failed: {}", e));
                inner.connection(ConnectionStatus::Unpaired, DisconnectOrigin::Local);
                Err(e.into())
            }
        }
    }

    /// Remove the bond; returns false if the device was not paired
    pub async fn unpair(&self) -> Result<bool, PairError> {
        let inner = &self.inner;
        let handle = {
            let st = inner.state.lock();
            match st.handle {
                Some(handle) if st.state.is_connected() => handle,
                _ => return Err(PairError::NotConnected),
            }
        };

        match inner.transport.unpair(handle).await? {
            UnpairResult::Unpaired => {
                {
                    let mut st = inner.state.lock();
                    st.paired = false;
                    if st.state == ConnectionState::Paired {
                        st.set(ConnectionState::Unpaired);
                    }
                }
                inner.status(MsgType::Success, "Unpairing successful");
                inner.connection(ConnectionStatus::Unpaired, DisconnectOrigin::Local);
                Ok(true)
            }
            UnpairResult::NotPaired => {
                inner.status(MsgType::Warning, "Device is not paired");
                Ok(false)
            }
            UnpairResult::Failed => {
                inner.status(MsgType::Failed, "Unpairing failed");
                Err(PairError::Transport(TransportError::Failed(
                    "unpair failed".to_string(),
                )))
            }
        }
    }

    /// Start saving data-stream lines to a timestamped file in `dir`
    pub async fn start_saving(&self, dir: &Path) -> Result<PathBuf, SinkError> {
        let file_name = generate_file_name(self.name(), Local::now());
        self.start_saving_as(dir, &file_name).await
    }

    pub async fn start_saving_as(&self, dir: &Path, file_name: &str) -> Result<PathBuf, SinkError> {
        let inner = &self.inner;
        match inner
            .sink
            .open(dir, file_name, &inner.config.save_title)
            .await
        {
            Ok(path) => {
                inner.state.lock().saving = true;
                inner.status(
                    MsgType::Success,
                    format!("Saving data to {}", path.display()),
                );
                Ok(path)
            }
            Err(e) => {
                inner.status(MsgType::Error, format!("Could not create save file: {}", e));
                Err(e)
            }
        }
    }

    pub async fn stop_saving(&self) -> Result<(), SinkError> {
        self.inner.state.lock().saving = false;
        self.inner.sink.close().await
    }
}

/// Resolve every service of `handle` into the session catalog
async fn resolve_services(
    inner: Arc<SessionInner>,
    handle: ConnectionHandle,
    attempt: CancellationToken,
) {
    let services = match inner.transport.list_services(handle).await {
        Ok(services) => services,
        Err(e) => {
            warn!("[{}] Service enumeration failed: {}", inner.identity.name, e);
            return;
        }
    };
    debug!("[{}] {} services found", inner.identity.name, services.len());

    for service in services {
        match inner.transport.list_characteristics(handle, &service).await {
            Ok(characteristics) => {
                let mut st = inner.state.lock();
                if attempt.is_cancelled() || st.handle != Some(handle) {
                    return;
                }
                st.catalog.insert_service(service, characteristics);
            }
            Err(e) => warn!(
                "[{}] Characteristics of {} unavailable: {}",
                inner.identity.name, service.uuid, e
            ),
        }
    }
}

/// Notification payload as a save-file line, without trailing terminators
fn payload_line(value: &[u8]) -> String {
    ascii_text(value)
        .trim_end_matches(['\r', '\n', '\0'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::DATA_STREAM_UUID;
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedDevice, SimulatedTransport, TransportOp,
    };
    use crate::infrastructure::bluetooth::transport::CharProperties;
    use crate::infrastructure::event_bus::handler;
    use uuid::Uuid;

    const ADDRESS: u64 = 0xC0FF_EE00_0001;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            scan_timeout: Duration::from_millis(200),
            discovery_poll: PollPolicy::new(5, 100),
            notify_poll: PollPolicy::new(5, 100),
            stop_grace: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    fn session_with(transport: &SimulatedTransport, config: SessionConfig) -> DeviceSession {
        DeviceSession::new(
            DeviceIdentity::new("Device_1", ADDRESS),
            Arc::new(transport.clone()),
            config,
        )
    }

    fn setup(device: SimulatedDevice) -> (SimulatedTransport, DeviceSession) {
        let transport = SimulatedTransport::new();
        transport.add_device(device);
        let session = session_with(&transport, fast_config());
        (transport, session)
    }

    fn record_connection_events(session: &DeviceSession) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session
            .events()
            .connection
            .subscribe(&handler(move |e: &ConnectionEvent| sink.lock().push(*e)));
        seen
    }

    async fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
        poll_until(PollPolicy::new(5, 200), None, &mut predicate).await
    }

    #[tokio::test]
    async fn test_connect_walks_states_in_order() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        let events = record_connection_events(&session);

        assert_eq!(session.connect().await, Ok(ConnectionState::Ready));
        assert_eq!(
            session.state_history(),
            vec![
                ConnectionState::Idle,
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::ServicesResolving,
                ConnectionState::Ready,
            ]
        );
        assert!(session.is_ready());
        assert!(transport.is_connected(ADDRESS));
        assert_eq!(transport.active_scans(), 0);
        assert_eq!(
            events.lock()[0],
            ConnectionEvent {
                status: ConnectionStatus::Connected,
                origin: DisconnectOrigin::Local
            }
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();
        assert_eq!(session.connect().await, Ok(ConnectionState::Ready));
        assert_eq!(
            transport.count_ops(|op| matches!(op, TransportOp::Connect(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_pair_on_connect() {
        let transport = SimulatedTransport::new();
        transport.add_device(SimulatedDevice::imu(ADDRESS));
        let session = session_with(
            &transport,
            SessionConfig {
                pair_on_connect: true,
                ..fast_config()
            },
        );

        session.connect().await.unwrap();
        let history = session.state_history();
        let pairing = history.iter().position(|s| *s == ConnectionState::Pairing);
        let paired = history.iter().position(|s| *s == ConnectionState::Paired);
        assert!(pairing.is_some() && paired > pairing);
        assert!(session.is_paired());
        assert!(transport.is_bonded(ADDRESS));
    }

    #[tokio::test]
    async fn test_rejected_pairing_keeps_link() {
        let transport = SimulatedTransport::new();
        transport.add_device(SimulatedDevice::imu(ADDRESS).with_pair_result(PairResult::Rejected));
        let session = session_with(
            &transport,
            SessionConfig {
                pair_on_connect: true,
                ..fast_config()
            },
        );

        assert_eq!(session.connect().await, Ok(ConnectionState::Ready));
        assert!(session.state_history().contains(&ConnectionState::Unpaired));
        assert!(!session.is_paired());
        assert!(transport.is_connected(ADDRESS));
    }

    #[tokio::test]
    async fn test_unpair_removes_bond() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();
        assert_eq!(session.pair().await, Ok(ConnectionStatus::Paired));
        assert_eq!(session.unpair().await, Ok(true));
        assert!(!transport.is_bonded(ADDRESS));
        assert_eq!(session.unpair().await, Ok(false));
    }

    #[tokio::test]
    async fn test_scan_timeout_reports_unavailable() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS).hidden());
        let events = record_connection_events(&session);

        assert_eq!(
            session.connect().await,
            Err(ConnectError::TransportUnavailable(ADDRESS))
        );
        assert_eq!(session.state(), ConnectionState::Timeout);
        assert_eq!(events.lock()[0].status, ConnectionStatus::Timeout);
        assert_eq!(transport.active_scans(), 0);

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_stream_characteristic_stays_connected() {
        let (transport, session) =
            setup(SimulatedDevice::imu(ADDRESS).without_characteristic(DATA_STREAM_UUID));

        match session.connect().await {
            Err(ConnectError::ServiceDiscoveryIncomplete { missing }) => {
                assert_eq!(missing, vec!["DataStream".to_string()])
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.is_ready());
        assert!(transport.is_connected(ADDRESS));
        assert!(matches!(
            session.enable_stream().await,
            Err(StreamError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_enable_twice_keeps_single_subscription() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();

        assert_eq!(session.enable_stream().await, Ok(true));
        assert_eq!(session.state(), ConnectionState::Streaming);
        assert_eq!(session.stream_state(), StreamState::Notifying);

        assert_eq!(
            session.enable_stream().await,
            Err(StreamError::AlreadyStreaming)
        );
        assert_eq!(session.notifying_count(), 1);
        assert_eq!(transport.subscriptions(ADDRESS), 1);
        assert_eq!(
            transport.count_ops(|op| matches!(op, TransportOp::Subscribe { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_enable_requires_ready() {
        let transport = SimulatedTransport::new();
        let session = session_with(&transport, fast_config());
        assert_eq!(
            session.enable_stream().await,
            Err(StreamError::NotReady("Idle".to_string()))
        );
        assert_eq!(
            session.disable_stream().await,
            Err(StreamError::NotStreaming)
        );
    }

    #[tokio::test]
    async fn test_enable_without_notify_property() {
        let (_transport, session) = setup(
            SimulatedDevice::imu(ADDRESS).with_properties(DATA_STREAM_UUID, CharProperties::READ),
        );
        session.connect().await.unwrap();
        assert_eq!(
            session.enable_stream().await,
            Err(StreamError::NotifyUnsupported)
        );
        assert_eq!(session.stream_state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_start_command_failure_rolls_back_subscription() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS).with_failing_writes());
        session.connect().await.unwrap();

        assert!(matches!(
            session.enable_stream().await,
            Err(StreamError::Write(WriteError::Failed(_)))
        ));
        assert_eq!(session.stream_state(), StreamState::Stopped);
        assert_eq!(session.notifying_count(), 0);
        assert_eq!(transport.subscriptions(ADDRESS), 0);
        assert_eq!(
            transport.count_ops(|op| matches!(op, TransportOp::Unsubscribe { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_silent_device_is_not_confirmed() {
        let (_transport, session) = setup(SimulatedDevice::imu(ADDRESS).silent());
        session.connect().await.unwrap();

        assert_eq!(session.enable_stream().await, Ok(false));
        assert_eq!(session.stream_state(), StreamState::Requested);
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.disable_stream().await, Ok(true));
        assert_eq!(session.stream_state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_disable_returns_to_ready_and_ignores_late_data() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();
        session.enable_stream().await.unwrap();

        assert_eq!(session.disable_stream().await, Ok(true));
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.stream_state(), StreamState::Stopped);
        assert_eq!(transport.subscriptions(ADDRESS), 0);
        assert_eq!(
            transport.writes_to(ADDRESS).last().map(|(_, v)| v.clone()),
            Some(DeviceCommand::StopLogging.wire_bytes())
        );

        transport.inject(
            ADDRESS,
            Uuid::parse_str(DATA_STREAM_UUID).unwrap(),
            b"late\r\n".to_vec(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_notifying());
        assert_eq!(session.state(), ConnectionState::Ready);

        // The stream can be enabled again after a stop
        assert_eq!(session.enable_stream().await, Ok(true));
    }

    #[tokio::test]
    async fn test_command_is_written_in_wire_order() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();

        session.write_command(&[0x01, 0x30]).await.unwrap();
        let (characteristic, value) = transport.writes_to(ADDRESS).pop().unwrap();
        assert_eq!(characteristic, Uuid::parse_str(COMMAND_UUID).unwrap());
        assert_eq!(value, vec![0x30, 0x01]);

        session
            .send_command(DeviceCommand::EnableSdLogging)
            .await
            .unwrap();
        let (_, value) = transport.writes_to(ADDRESS).pop().unwrap();
        assert_eq!(value, vec![0x32, 0x01]);
    }

    #[tokio::test]
    async fn test_write_errors() {
        let transport = SimulatedTransport::new();
        transport.add_device(
            SimulatedDevice::imu(ADDRESS).with_properties(COMMAND_UUID, CharProperties::READ),
        );
        let session = session_with(&transport, fast_config());

        assert_eq!(
            session.write_command(&[0x01]).await,
            Err(WriteError::NotConnected)
        );

        session.connect().await.unwrap();
        assert_eq!(
            session.write_command(&[0x01, 0x30]).await,
            Err(WriteError::Unsupported(COMMAND_UUID.to_string()))
        );
        assert_eq!(
            session.write_byte("ffff", 1).await,
            Err(WriteError::MissingCharacteristic("ffff".to_string()))
        );
        assert!(transport.writes_to(ADDRESS).is_empty());
    }

    #[tokio::test]
    async fn test_read_device_info() {
        let (_transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();

        let info = session.read_device_info().await;
        assert_eq!(info.battery_level, Some(87));
        assert_eq!(info.model_number.as_deref(), Some("IMU-9"));
        assert_eq!(info.firmware_revision.as_deref(), Some("1.4.2"));
        assert_eq!(info.manufacturer.as_deref(), Some("Wearable Labs"));
        assert_eq!(info.device_name.as_deref(), Some("IMU-0001"));

        assert_eq!(session.read_characteristic("2a19").await, Ok(vec![87]));
        assert_eq!(
            session.read_characteristic(COMMAND_UUID).await,
            Err(ReadError::Unsupported(COMMAND_UUID.to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        let events = record_connection_events(&session);
        session.connect().await.unwrap();
        session.enable_stream().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.stream_state(), StreamState::Stopped);
        assert_eq!(session.notifying_count(), 0);
        assert_eq!(transport.connection_count(), 0);
        assert_eq!(
            transport.count_ops(|op| matches!(op, TransportOp::Release(_))),
            1
        );
        assert!(transport
            .writes_to(ADDRESS)
            .iter()
            .any(|(_, v)| *v == DeviceCommand::StopLogging.wire_bytes()));
        assert_eq!(
            events.lock().last().copied(),
            Some(ConnectionEvent {
                status: ConnectionStatus::Disconnected,
                origin: DisconnectOrigin::Local
            })
        );

        // Second disconnect is a no-op
        session.disconnect().await;
        assert_eq!(
            transport.count_ops(|op| matches!(op, TransportOp::Release(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_scan() {
        let transport = SimulatedTransport::new();
        transport.add_device(SimulatedDevice::imu(ADDRESS).hidden());
        let session = session_with(
            &transport,
            SessionConfig {
                scan_timeout: Duration::from_secs(30),
                ..fast_config()
            },
        );

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        assert!(wait_for(|| session.state() == ConnectionState::Scanning).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.disconnect().await;
        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("connect did not stop")
            .unwrap();
        assert_eq!(result, Err(ConnectError::Cancelled));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_discovery() {
        let (transport, session) = setup(
            SimulatedDevice::imu(ADDRESS).with_discovery_delay(Duration::from_millis(300)),
        );

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        assert!(wait_for(|| session.state() == ConnectionState::ServicesResolving).await);

        session.disconnect().await;
        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("connect did not stop")
            .unwrap();
        assert_eq!(result, Err(ConnectError::Cancelled));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_ready());
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_pairing_query_publishes_no_connected() {
        let (transport, session) = setup(
            SimulatedDevice::imu(ADDRESS).with_pairing_query_delay(Duration::from_millis(200)),
        );
        let events = record_connection_events(&session);

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        assert!(wait_for(|| session.state() == ConnectionState::Connected).await);

        session.disconnect().await;
        let result = connecting.await.unwrap();
        assert_eq!(result, Err(ConnectError::Cancelled));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connection_count(), 0);

        let statuses: Vec<ConnectionStatus> = events.lock().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![ConnectionStatus::Disconnected]);
    }

    #[tokio::test]
    async fn test_remote_link_loss() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        let events = record_connection_events(&session);
        session.connect().await.unwrap();
        session.enable_stream().await.unwrap();

        transport.drop_link(ADDRESS);
        assert!(wait_for(|| session.state() == ConnectionState::Disconnected).await);
        assert_eq!(
            session.last_disconnect_origin(),
            Some(DisconnectOrigin::Remote)
        );
        assert_eq!(session.stream_state(), StreamState::Stopped);
        assert!(events.lock().contains(&ConnectionEvent {
            status: ConnectionStatus::Disconnected,
            origin: DisconnectOrigin::Remote
        }));

        // The session can reconnect afterwards
        assert_eq!(session.connect().await, Ok(ConnectionState::Ready));
    }

    #[tokio::test]
    async fn test_saving_writes_trimmed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, session) = setup(SimulatedDevice::imu(ADDRESS));
        session.connect().await.unwrap();

        let path = session
            .start_saving_as(dir.path(), "Device_1_test.csv")
            .await
            .unwrap();
        assert!(session.is_saving());
        session.enable_stream().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        session.disable_stream().await.unwrap();
        session.stop_saving().await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("Device Data:"));
        let samples: Vec<&str> = lines.collect();
        assert!(!samples.is_empty());
        assert!(samples[0].starts_with("0,"));
        assert!(samples.iter().all(|l| !l.is_empty() && !l.contains('\r')));
    }

    #[tokio::test]
    async fn test_notifications_are_published() {
        let (transport, session) = setup(SimulatedDevice::imu(ADDRESS).silent());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session
            .events()
            .notification
            .subscribe(&handler(move |e: &NotificationEvent| sink.lock().push(e.as_text())));
        session.connect().await.unwrap();
        session.enable_stream().await.unwrap();

        transport.inject(
            ADDRESS,
            Uuid::parse_str(DATA_STREAM_UUID).unwrap(),
            b"1,2,3\n".to_vec(),
        );
        assert!(wait_for(|| session.is_notifying()).await);
        assert_eq!(session.state(), ConnectionState::Streaming);
        assert!(wait_for(|| !seen.lock().is_empty()).await);
        assert!(seen.lock()[0].starts_with("1,2,3"));
    }

    #[test]
    fn test_payload_line_trims_terminators() {
        assert_eq!(payload_line(b"1,2,3\r\n\0"), "1,2,3");
        assert_eq!(payload_line(b"a b"), "a b");
    }

    #[test]
    fn test_transport_error_maps_into_connect_error() {
        let e: ConnectError = TransportError::InvalidHandle.into();
        assert_eq!(e, ConnectError::Transport(TransportError::InvalidHandle));
    }
}
