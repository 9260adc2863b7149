//! Defines the per-device "is transmitting" status published to the host.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::registry::DeviceId;

pub type StatusMap = BTreeMap<DeviceId, bool>;

/// Observable map of device id to whether location is being transmitted to it.
#[derive(Clone)]
pub struct TransmissionStatus {
    sender: Arc<watch::Sender<StatusMap>>,
}

impl Default for TransmissionStatus {
    fn default() -> Self {
        let (sender, _) = watch::channel(StatusMap::new());
        TransmissionStatus {
            sender: Arc::new(sender),
        }
    }
}

impl TransmissionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusMap> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> StatusMap {
        self.sender.borrow().clone()
    }

    pub fn set(&self, id: &DeviceId, transmitting: bool) {
        self.sender.send_if_modified(|map| {
            map.insert(id.clone(), transmitting) != Some(transmitting)
        });
    }

    pub fn remove(&self, id: &DeviceId) {
        self.sender.send_if_modified(|map| map.remove(id).is_some());
    }

    pub fn clear(&self) {
        self.sender.send_if_modified(|map| {
            let changed = !map.is_empty();
            map.clear();
            changed
        });
    }

    pub fn is_transmitting(&self, id: &DeviceId) -> bool {
        self.sender.borrow().get(id).copied().unwrap_or(false)
    }
}
