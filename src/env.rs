//! Defines logic to grab settings from the environment.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;

use crate::devices::DeviceConfig;
use crate::location::fixed::FixedPosition;
use crate::location::{
    AcceptancePolicy, ACCURACY_THRESHOLD_METERS, LOCATION_UPDATE_INTERVAL, STALENESS_THRESHOLD,
};
use crate::protocol::DEFAULT_REQUESTED_MTU;

/// Path to the default settings file.
const CONFIG_FP: &str = "/etc/camera-gps-link/config.json";

/// Environment variable overriding `CONFIG_FP`.
const CONFIG_ENV_VAR: &str = "CAMERA_GPS_LINK_CONFIG";

/// Default gpsd endpoint.
const DEFAULT_GPSD_ADDRESS: &str = "127.0.0.1:2947";

const DEFAULT_SHUTDOWN_DEBOUNCE_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub update_interval_ms: u64,
    pub accuracy_threshold_m: f32,
    pub staleness_threshold_ms: u64,
    pub shutdown_debounce_ms: u64,
    pub requested_mtu: u16,
    pub gpsd_address: String,
    /// Fallback position when gpsd cannot be reached.
    pub fixed_position: Option<FixedPosition>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            update_interval_ms: LOCATION_UPDATE_INTERVAL.as_millis() as u64,
            accuracy_threshold_m: ACCURACY_THRESHOLD_METERS,
            staleness_threshold_ms: STALENESS_THRESHOLD.as_millis() as u64,
            shutdown_debounce_ms: DEFAULT_SHUTDOWN_DEBOUNCE_MS,
            requested_mtu: DEFAULT_REQUESTED_MTU,
            gpsd_address: DEFAULT_GPSD_ADDRESS.to_string(),
            fixed_position: None,
            devices: vec![],
        }
    }
}

impl Settings {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn shutdown_debounce(&self) -> Duration {
        Duration::from_millis(self.shutdown_debounce_ms)
    }

    pub fn acceptance_policy(&self) -> AcceptancePolicy {
        AcceptancePolicy {
            accuracy_threshold_meters: self.accuracy_threshold_m,
            staleness_threshold: Duration::from_millis(self.staleness_threshold_ms),
        }
    }
}

/// Reads settings from `path`.
pub fn read_settings(path: &Path) -> Result<Settings> {
    let file = File::open(path).with_context(|| {
        format!("could not open settings file from file path {path:?}")
    })?;
    let settings: Settings = serde_json::from_reader(file).with_context(|| {
        format!("contents of {path:?} are not valid settings; ensure the file is well formed")
    })?;
    if settings.update_interval_ms == 0 {
        anyhow::bail!("`update_interval_ms` in {path:?} must be positive");
    }
    Ok(settings)
}

/// Path of the settings file, honouring `CAMERA_GPS_LINK_CONFIG`.
pub fn settings_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FP))
}

/// Finds settings at `settings_path()` or falls back to defaults.
pub fn load_settings() -> Settings {
    let path = settings_path();
    match read_settings(&path) {
        Ok(settings) => {
            info!("Loaded settings for {} devices from {path:?}", settings.devices.len());
            settings
        }
        Err(e) => {
            warn!("{e:#}; using default settings");
            Settings::default()
        }
    }
}
