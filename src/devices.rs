//! Defines the read-only view of the user's device preferences.

use serde::{Deserialize, Serialize};

use crate::registry::DeviceId;

/// User flags for one paired camera.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub address: DeviceId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub always_on_enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Query surface over the externally owned device store.
pub trait DeviceRegistry: Send + Sync {
    /// Devices the user marked as always-on.
    fn list_always_on_devices(&self) -> Vec<DeviceConfig>;

    fn is_always_on_enabled(&self, id: &DeviceId) -> bool;

    /// Devices missing from the store count as enabled.
    fn is_enabled(&self, id: &DeviceId) -> bool;

    /// Whether the store has an entry for `id` at all.
    fn is_configured(&self, id: &DeviceId) -> bool;

    fn count_always_on_enabled(&self) -> usize {
        self.list_always_on_devices()
            .iter()
            .filter(|device| self.is_always_on_enabled(&device.address))
            .count()
    }
}

/// Device store read from the settings file.
#[derive(Clone, Debug, Default)]
pub struct FileDeviceRegistry {
    devices: Vec<DeviceConfig>,
}

impl FileDeviceRegistry {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        FileDeviceRegistry { devices }
    }

    fn find(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| &device.address == id)
    }
}

impl DeviceRegistry for FileDeviceRegistry {
    fn list_always_on_devices(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .filter(|device| device.always_on_enabled)
            .cloned()
            .collect()
    }

    fn is_always_on_enabled(&self, id: &DeviceId) -> bool {
        self.find(id)
            .is_some_and(|device| device.enabled && device.always_on_enabled)
    }

    fn is_enabled(&self, id: &DeviceId) -> bool {
        self.find(id).map_or(true, |device| device.enabled)
    }

    fn is_configured(&self, id: &DeviceId) -> bool {
        self.find(id).is_some()
    }
}
