use anyhow::Context;
use multi_device_connect::domain::models::{DeviceIdentity, NotificationEvent};
use multi_device_connect::domain::settings::{Settings, SettingsService};
use multi_device_connect::infrastructure::bluetooth::simulated::{
    SimulatedDevice, SimulatedTransport,
};
use multi_device_connect::infrastructure::bluetooth::{FleetConfig, FleetOrchestrator};
use multi_device_connect::infrastructure::event_bus::handler;
use multi_device_connect::infrastructure::logging::init_logger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Streaming time when no duration argument is given
const DEFAULT_RUN_SECS: u64 = 5;

/// First address handed to slots without a configured address
const SIMULATED_ADDRESS_BASE: u64 = 0xD0_0000_0001;

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting Multi Device Connect v{}",
        multi_device_connect::VERSION
    );
    info!("Settings: {}", settings_service.path().display());

    let run_for = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>())
        .transpose()
        .context("Run duration must be a whole number of seconds")?
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_RUN_SECS));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run(settings, run_for))
}

/// Slots without an address get a distinct simulated one
fn simulated_identities(identities: Vec<DeviceIdentity>) -> Vec<DeviceIdentity> {
    identities
        .into_iter()
        .enumerate()
        .map(|(i, identity)| {
            if identity.address != 0 {
                return identity;
            }
            let address = SIMULATED_ADDRESS_BASE + i as u64;
            warn!(
                "Slot {} has no address configured, simulating {:#X}",
                identity.name, address
            );
            DeviceIdentity::new(identity.name, address)
        })
        .collect()
}

async fn run(settings: Settings, run_for: Duration) -> anyhow::Result<()> {
    let identities = simulated_identities(settings.identities()?);
    let transport = SimulatedTransport::new();
    for identity in &identities {
        transport.add_device(SimulatedDevice::imu(identity.address));
    }

    let fleet = FleetOrchestrator::new(
        identities,
        Arc::new(transport),
        FleetConfig::from_settings(&settings),
    );

    let counters: Vec<Arc<AtomicUsize>> = fleet
        .slots()
        .iter()
        .map(|slot| {
            let counter = Arc::new(AtomicUsize::new(0));
            let seen = counter.clone();
            slot.events()
                .notification
                .subscribe(&handler(move |_: &NotificationEvent| {
                    seen.fetch_add(1, Ordering::Relaxed);
                }));
            counter
        })
        .collect();

    if let Err(e) = fleet.run_sequence().await {
        error!("Fleet did not start streaming: {}", e);
        fleet.disconnect_all().await;
        return Err(e.into());
    }

    for result in fleet.start_saving_default().await {
        if let Err(e) = result {
            warn!("Saving unavailable: {}", e);
        }
    }

    info!("Streaming for {:?} (Ctrl+C to stop early)", run_for);
    tokio::select! {
        _ = tokio::time::sleep(run_for) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    if !fleet.stop_streaming().await {
        warn!("Not every device acknowledged the stop command");
    }
    for result in fleet.stop_saving_all().await {
        if let Err(e) = result {
            warn!("Closing save file failed: {}", e);
        }
    }

    for (slot, counter) in fleet.slots().iter().zip(&counters) {
        info!(
            "{}: {} samples received",
            slot.name(),
            counter.load(Ordering::Relaxed)
        );
    }
    info!("Final state: {}", serde_json::to_string(&fleet.snapshot())?);

    fleet.disconnect_all().await;
    info!("Shutdown complete");
    Ok(())
}
