use crate::domain::models::{DeviceAddress, DeviceIdentity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "multi_device_connect".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Bounded polling: check every `interval_ms`, give up after `max_cycles`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_cycles: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, max_cycles: u32) -> Self {
        Self {
            interval_ms,
            max_cycles,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Worst-case time spent before the policy gives up
    pub fn budget(&self) -> Duration {
        self.interval() * self.max_cycles
    }
}

/// Service discovery wait: 10 ms × 1000 cycles
pub const DEFAULT_DISCOVERY_POLL: PollPolicy = PollPolicy::new(10, 1000);
/// Notify-active confirmation wait: 10 ms × 100 cycles
pub const DEFAULT_NOTIFY_POLL: PollPolicy = PollPolicy::new(10, 100);

/// Which discovery path a connect attempt uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Advertisement watcher, short timeout
    Quick,
    /// Full device enumeration, long timeout
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlotConfig {
    pub name: String,
    /// Decimal, `0x` hexadecimal or `AA:BB:CC:DD:EE:FF`
    pub address: String,
}

impl DeviceSlotConfig {
    pub fn identity(&self) -> anyhow::Result<DeviceIdentity> {
        let address = parse_address(&self.address)?;
        Ok(DeviceIdentity::new(self.name.clone(), address))
    }
}

/// Parse a device address in any of the notations the settings file accepts
pub fn parse_address(text: &str) -> anyhow::Result<DeviceAddress> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("Empty device address");
    }

    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)?
    } else if text.contains(':') {
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() != 6 {
            anyhow::bail!("Invalid MAC address: {}", text);
        }
        let mut value = 0u64;
        for part in parts {
            value = (value << 8) | u64::from(u8::from_str_radix(part, 16)?);
        }
        value
    } else {
        text.parse::<u64>()?
    };

    if value > 0xFFFF_FFFF_FFFF {
        anyhow::bail!("Address {} exceeds 48 bits", text);
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceSlotConfig>,

    // Connection Settings
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
    #[serde(default = "default_quick_scan_timeout_secs")]
    pub quick_scan_timeout_secs: u64,
    #[serde(default = "default_slow_scan_timeout_secs")]
    pub slow_scan_timeout_secs: u64,
    #[serde(default = "default_false")]
    pub pair_on_connect: bool,

    // Barrier Settings
    #[serde(default = "default_discovery_poll")]
    pub discovery_poll: PollPolicy,
    #[serde(default = "default_notify_poll")]
    pub notify_poll: PollPolicy,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    // Saving Settings
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_save_title")]
    pub save_title: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            scan_mode: default_scan_mode(),
            quick_scan_timeout_secs: default_quick_scan_timeout_secs(),
            slow_scan_timeout_secs: default_slow_scan_timeout_secs(),
            pair_on_connect: false,
            discovery_poll: default_discovery_poll(),
            notify_poll: default_notify_poll(),
            settle_delay_ms: default_settle_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            data_dir: default_data_dir(),
            save_title: default_save_title(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Scan bound for the configured discovery path
    pub fn scan_timeout(&self) -> Duration {
        match self.scan_mode {
            ScanMode::Quick => Duration::from_secs(self.quick_scan_timeout_secs),
            ScanMode::Full => Duration::from_secs(self.slow_scan_timeout_secs),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Identities for every configured slot, in slot order
    pub fn identities(&self) -> anyhow::Result<Vec<DeviceIdentity>> {
        self.devices.iter().map(DeviceSlotConfig::identity).collect()
    }
}

fn default_devices() -> Vec<DeviceSlotConfig> {
    (1..=crate::infrastructure::bluetooth::protocol::TOTAL_NUMBER_OF_DEVICES)
        .map(|n| DeviceSlotConfig {
            name: format!("Device_{}", n),
            address: "0".to_string(),
        })
        .collect()
}
fn default_scan_mode() -> ScanMode {
    ScanMode::Quick
}
fn default_quick_scan_timeout_secs() -> u64 {
    crate::infrastructure::bluetooth::protocol::QUICK_SCAN_TIMEOUT_SECS
}
fn default_slow_scan_timeout_secs() -> u64 {
    crate::infrastructure::bluetooth::protocol::SLOW_SCAN_TIMEOUT_SECS
}
fn default_discovery_poll() -> PollPolicy {
    DEFAULT_DISCOVERY_POLL
}
fn default_notify_poll() -> PollPolicy {
    DEFAULT_NOTIFY_POLL
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_stop_grace_ms() -> u64 {
    10
}
fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("MultiDeviceConnect");
    path.push("Device_Data");
    path
}
fn default_save_title() -> String {
    "Device Data:".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MultiDeviceConnect");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_formats() {
        assert_eq!(parse_address("254").unwrap(), 254);
        assert_eq!(parse_address("0xC0FFEE").unwrap(), 0xC0FFEE);
        assert_eq!(
            parse_address("AA:BB:CC:DD:EE:FF").unwrap(),
            0xAABB_CCDD_EEFF
        );
        assert!(parse_address("").is_err());
        assert!(parse_address("AA:BB").is_err());
        assert!(parse_address("0x1FFFFFFFFFFFF").is_err());
    }

    #[test]
    fn test_defaults_describe_three_slots() {
        let settings = Settings::default();
        let names: Vec<_> = settings.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Device_1", "Device_2", "Device_3"]);
        assert_eq!(settings.scan_timeout(), Duration::from_secs(10));
        assert_eq!(settings.discovery_poll.budget(), Duration::from_secs(10));
        assert_eq!(settings.notify_poll.budget(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "scan_mode": "full", "pair_on_connect": true }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.scan_mode, ScanMode::Full);
        assert_eq!(settings.scan_timeout(), Duration::from_secs(60));
        assert!(settings.pair_on_connect);
        assert_eq!(settings.devices.len(), 3);
        assert_eq!(settings.save_title, "Device Data:");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().devices[0].address = "0xA1".to_string();
        service.get_mut().stop_grace_ms = 25;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().devices[0].address, "0xA1");
        assert_eq!(reloaded.get().stop_grace_ms, 25);
        assert_eq!(reloaded.get().identities().unwrap()[0].address, 0xA1);
    }
}
