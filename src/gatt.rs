//! Defines the seam between the connection engine and a BLE stack.
//!
//! Operations on a [`GattLink`] only initiate work; each completion is delivered later as a
//! [`GattEvent`] on the channel handed to [`Transport::connect`].

use std::collections::HashSet;
use std::sync::Arc;

use async_channel::Sender;
use uuid::Uuid;

use crate::error::LinkError;
use crate::registry::DeviceId;

/// Completion status of a GATT operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failed(u16),
}

impl GattStatus {
    /// Generic failure, reported when the stack gives no specific code.
    pub const GATT_ERROR: GattStatus = GattStatus::Failed(0x85);

    /// Link supervision timeout; the camera went out of range.
    pub const CONNECTION_TIMEOUT: u16 = 0x08;

    /// Remote user terminated the connection; the camera was switched off.
    pub const TERMINATED_BY_PEER: u16 = 0x13;

    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Services and characteristics a device exposed during discovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GattTable {
    entries: HashSet<(Uuid, Uuid)>,
}

impl GattTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Uuid, characteristic: Uuid) {
        self.entries.insert((service, characteristic));
    }

    pub fn with(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.insert(service, characteristic);
        self
    }

    pub fn contains(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.entries.contains(&(service, characteristic))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A characteristic that has been found during discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Hardware completions, one variant per callback the BLE stack delivers.
#[derive(Clone, Debug, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged { status: GattStatus, connected: bool },
    ConnectFailed(LinkError),
    MtuChanged { mtu: u16, status: GattStatus },
    ServicesDiscovered { status: GattStatus, table: GattTable },
    CharacteristicRead { uuid: Uuid, status: GattStatus, value: Vec<u8> },
    CharacteristicWritten { uuid: Uuid, status: GattStatus },
    CharacteristicChanged { uuid: Uuid, value: Vec<u8> },
}

/// An open connection to one device.
pub trait GattLink: Send + Sync {
    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError>;

    fn discover_services(&self) -> Result<(), LinkError>;

    fn read(&self, characteristic: CharacteristicRef) -> Result<(), LinkError>;

    fn write(&self, characteristic: CharacteristicRef, value: Vec<u8>) -> Result<(), LinkError>;

    /// Tears the connection down. No further events are delivered afterwards.
    fn close(&self);
}

/// Opens links to bonded devices.
pub trait Transport: Send + Sync {
    /// Starts connecting to `device`. Fails immediately when the device is unknown to the stack
    /// or the request cannot be issued; otherwise the outcome arrives on `events`.
    fn connect(
        &self,
        device: &DeviceId,
        events: Sender<GattEvent>,
    ) -> Result<Arc<dyn GattLink>, LinkError>;
}
