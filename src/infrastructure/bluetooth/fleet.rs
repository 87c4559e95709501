//! Fleet Orchestrator
//!
//! Owns a fixed set of device sessions and coordinates them: concurrent
//! connects, a readiness barrier, all-or-nothing streaming and a fail-fast
//! teardown when any slot times out or loses its link.

use crate::domain::errors::{ConnectError, FleetError, SinkError, StreamError};
use crate::domain::models::{
    ConnectionEvent, ConnectionState, ConnectionStatus, DeviceIdentity, DisconnectOrigin,
    FleetSnapshot, StreamState,
};
use crate::domain::settings::{PollPolicy, Settings};
use crate::infrastructure::bluetooth::poll::poll_until;
use crate::infrastructure::bluetooth::session::{DeviceSession, SessionConfig};
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::event_bus::{handler, Handler};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for fleet behavior
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub session: SessionConfig,
    /// Pause between the connects and the readiness barrier
    pub settle_delay: Duration,
    /// Readiness barrier
    pub ready_poll: PollPolicy,
    /// Where `start_saving_all` creates its files
    pub data_dir: PathBuf,
}

impl FleetConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            session: SessionConfig::from_settings(settings),
            settle_delay: settings.settle_delay(),
            ready_poll: settings.discovery_poll,
            data_dir: settings.data_dir.clone(),
        }
    }
}

struct FleetInner {
    slots: Vec<DeviceSession>,
    config: FleetConfig,
    streaming: AtomicBool,
    tearing_down: AtomicBool,
    watchers: Vec<Handler<ConnectionEvent>>,
}

impl FleetInner {
    /// Disconnect every slot after one of them failed
    async fn cascade(&self, origin_slot: &str, status: ConnectionStatus) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            debug!("Teardown already underway, ignoring {} ({:?})", origin_slot, status);
            return;
        }
        warn!(
            "Slot {} reported {:?}; disconnecting every device",
            origin_slot, status
        );
        self.streaming.store(false, Ordering::SeqCst);
        join_all(self.slots.iter().map(|s| s.disconnect())).await;
        self.tearing_down.store(false, Ordering::SeqCst);
        info!("Fleet teardown complete");
    }
}

impl Drop for FleetInner {
    fn drop(&mut self) {
        for (slot, watcher) in self.slots.iter().zip(&self.watchers) {
            slot.events().connection.unsubscribe(watcher);
        }
    }
}

/// Cheap to clone, clones share the fleet
#[derive(Clone)]
pub struct FleetOrchestrator {
    inner: Arc<FleetInner>,
}

impl FleetOrchestrator {
    /// One session per identity, in slot order
    pub fn new(
        identities: Vec<DeviceIdentity>,
        transport: Arc<dyn Transport>,
        config: FleetConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<FleetInner>| {
            let slots: Vec<DeviceSession> = identities
                .into_iter()
                .map(|identity| {
                    DeviceSession::new(identity, transport.clone(), config.session.clone())
                })
                .collect();
            let watchers = slots
                .iter()
                .map(|slot| {
                    let watcher = cascade_watcher(weak.clone(), slot.name().to_string());
                    slot.events().connection.subscribe(&watcher);
                    watcher
                })
                .collect();
            FleetInner {
                slots,
                config,
                streaming: AtomicBool::new(false),
                tearing_down: AtomicBool::new(false),
                watchers,
            }
        });
        info!("Fleet created with {} slots", inner.slots.len());
        Self { inner }
    }

    pub fn from_settings(settings: &Settings, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        Ok(Self::new(
            settings.identities()?,
            transport,
            FleetConfig::from_settings(settings),
        ))
    }

    pub fn slots(&self) -> &[DeviceSession] {
        &self.inner.slots
    }

    pub fn slot(&self, name: &str) -> Result<&DeviceSession, FleetError> {
        self.inner
            .slots
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| FleetError::UnknownSlot(name.to_string()))
    }

    /// True only while every slot has a confirmed stream
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
            && self.inner.slots.iter().all(DeviceSession::is_notifying)
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            streaming: self.is_streaming(),
            slots: self.inner.slots.iter().map(DeviceSession::snapshot).collect(),
        }
    }

    /// Connect every slot concurrently; results are in slot order
    pub async fn connect_all(&self) -> Vec<Result<ConnectionState, ConnectError>> {
        info!("Connecting {} devices", self.inner.slots.len());
        let results = join_all(self.inner.slots.iter().map(|s| s.connect())).await;
        for (slot, result) in self.inner.slots.iter().zip(&results) {
            match result {
                Ok(state) => debug!("Slot {} connect finished in {}", slot.name(), state),
                Err(e) => warn!("Slot {} failed to connect: {}", slot.name(), e),
            }
        }
        results
    }

    /// Wait until every slot has its required characteristics
    ///
    /// Slots that did become ready stay connected on failure.
    pub async fn await_ready(&self, policy: PollPolicy) -> Result<(), FleetError> {
        let slots = &self.inner.slots;
        if slots.is_empty() {
            return Err(FleetError::EmptyFleet);
        }
        if poll_until(policy, None, || slots.iter().all(DeviceSession::is_ready)).await {
            info!("All {} devices ready", slots.len());
            return Ok(());
        }
        let pending = self.not_ready();
        warn!("Devices not ready: {:?}", pending);
        Err(FleetError::NotReady { slots: pending })
    }

    fn not_ready(&self) -> Vec<String> {
        self.inner
            .slots
            .iter()
            .filter(|s| !s.is_ready())
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Enable the stream on every slot, or on none
    ///
    /// Refuses outright unless every slot is ready. If any slot fails to
    /// confirm, every slot that got as far as requesting its stream is
    /// stopped again before the error is returned.
    pub async fn start_streaming(&self) -> Result<(), FleetError> {
        let slots = &self.inner.slots;
        if slots.is_empty() {
            return Err(FleetError::EmptyFleet);
        }
        let pending = self.not_ready();
        if !pending.is_empty() {
            warn!("Not streaming, devices not ready: {:?}", pending);
            return Err(FleetError::NotReady { slots: pending });
        }

        info!("Enabling streams on {} devices", slots.len());
        let results = join_all(slots.iter().map(|s| s.enable_stream())).await;
        let unconfirmed: Vec<String> = slots
            .iter()
            .zip(results)
            .filter(|(slot, result)| match result {
                Ok(true) => false,
                Ok(false) | Err(StreamError::AlreadyStreaming) => !slot.is_notifying(),
                Err(e) => {
                    warn!("Slot {} could not enable its stream: {}", slot.name(), e);
                    true
                }
            })
            .map(|(slot, _)| slot.name().to_string())
            .collect();

        if unconfirmed.is_empty() {
            self.inner.streaming.store(true, Ordering::SeqCst);
            // A teardown may have finished while the streams were confirming
            if self.inner.tearing_down.load(Ordering::SeqCst)
                || !slots.iter().all(DeviceSession::is_notifying)
            {
                self.inner.streaming.store(false, Ordering::SeqCst);
                let lost = slots
                    .iter()
                    .filter(|s| !s.is_notifying())
                    .map(|s| s.name().to_string())
                    .collect();
                warn!("Streams dropped before the fleet was confirmed");
                return Err(FleetError::StreamNotConfirmed { slots: lost });
            }
            info!("All devices streaming");
            return Ok(());
        }

        warn!(
            "Streams not confirmed on {:?}; stopping every stream",
            unconfirmed
        );
        join_all(
            slots
                .iter()
                .filter(|s| s.stream_state() != StreamState::Stopped)
                .map(|s| s.disable_stream()),
        )
        .await;
        self.inner.streaming.store(false, Ordering::SeqCst);
        Err(FleetError::StreamNotConfirmed {
            slots: unconfirmed,
        })
    }

    /// Stop every enabled stream; returns whether every stop command was written
    pub async fn stop_streaming(&self) -> bool {
        let results = join_all(
            self.inner
                .slots
                .iter()
                .filter(|s| s.stream_state() != StreamState::Stopped)
                .map(|s| s.disable_stream()),
        )
        .await;
        self.inner.streaming.store(false, Ordering::SeqCst);

        let mut all_written = true;
        for result in results {
            match result {
                Ok(true) | Err(StreamError::NotStreaming) => {}
                Ok(false) => all_written = false,
                Err(e) => {
                    warn!("Stream stop failed: {}", e);
                    all_written = false;
                }
            }
        }
        info!("Streams stopped (all commands written: {})", all_written);
        all_written
    }

    /// Disconnect every slot concurrently
    pub async fn disconnect_all(&self) {
        self.inner.tearing_down.store(true, Ordering::SeqCst);
        self.inner.streaming.store(false, Ordering::SeqCst);
        join_all(self.inner.slots.iter().map(|s| s.disconnect())).await;
        self.inner.tearing_down.store(false, Ordering::SeqCst);
        info!("All devices disconnected");
    }

    /// Save every slot's data stream to a timestamped file in `dir`
    pub async fn start_saving_all(&self, dir: &Path) -> Vec<Result<PathBuf, SinkError>> {
        join_all(self.inner.slots.iter().map(|s| s.start_saving(dir))).await
    }

    /// `start_saving_all` into the configured data directory
    pub async fn start_saving_default(&self) -> Vec<Result<PathBuf, SinkError>> {
        let dir = self.inner.config.data_dir.clone();
        self.start_saving_all(&dir).await
    }

    pub async fn stop_saving_all(&self) -> Vec<Result<(), SinkError>> {
        join_all(self.inner.slots.iter().map(|s| s.stop_saving())).await
    }

    /// Connect all, settle, wait for readiness, then start streaming
    pub async fn run_sequence(&self) -> Result<(), FleetError> {
        self.connect_all().await;
        tokio::time::sleep(self.inner.config.settle_delay).await;
        self.await_ready(self.inner.config.ready_poll).await?;
        self.start_streaming().await
    }
}

/// Connection handler that turns a slot failure into a fleet teardown
fn cascade_watcher(fleet: Weak<FleetInner>, slot: String) -> Handler<ConnectionEvent> {
    handler(move |event: &ConnectionEvent| {
        let fatal = match event.status {
            ConnectionStatus::Timeout => true,
            ConnectionStatus::Disconnected => event.origin == DisconnectOrigin::Remote,
            _ => false,
        };
        let lost = fatal || event.status == ConnectionStatus::Disconnected;
        if !lost {
            return;
        }
        let Some(fleet) = fleet.upgrade() else {
            return;
        };
        if fleet.streaming.swap(false, Ordering::SeqCst) {
            info!("Slot {} dropped out; fleet is no longer streaming", slot);
        }
        if !fatal {
            return;
        }
        let status = event.status;
        let slot = slot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { fleet.cascade(&slot, status).await });
            }
            Err(_) => warn!("No runtime available to tear down the fleet after {}", slot),
        }
    })
}
