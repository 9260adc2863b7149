//! Defines the per-device negotiation sequence as a pure state machine.
//!
//! The machine never touches hardware. It consumes [`GattEvent`]s and answers with the
//! [`Action`]s the caller must perform; every hardware acknowledgement moves it at most one step.

use log::{debug, error, info, warn};

use crate::gatt::{CharacteristicRef, GattEvent, GattStatus, GattTable};
use crate::protocol::{
    encode_time_sync_packet, has_timezone_dst_flag, LocationConfig, ZonedTime,
    CAPABILITY_CHAR_UUID, CONTROL_SERVICE_UUID, GPS_ENABLE_COMMAND, GPS_LOCK_CHAR_UUID,
    GPS_UNLOCK_CHAR_UUID, LOCATION_CHAR_UUID, LOCATION_SERVICE_UUID, LOCATION_STATUS_CHAR_UUID,
    TIME_SYNC_CHAR_UUID,
};
use crate::registry::{DeviceId, SessionState};

const CAPABILITY: CharacteristicRef = CharacteristicRef {
    service: LOCATION_SERVICE_UUID,
    uuid: CAPABILITY_CHAR_UUID,
};
const LOCATION_STATUS: CharacteristicRef = CharacteristicRef {
    service: LOCATION_SERVICE_UUID,
    uuid: LOCATION_STATUS_CHAR_UUID,
};
const GPS_UNLOCK: CharacteristicRef = CharacteristicRef {
    service: LOCATION_SERVICE_UUID,
    uuid: GPS_UNLOCK_CHAR_UUID,
};
const GPS_LOCK: CharacteristicRef = CharacteristicRef {
    service: LOCATION_SERVICE_UUID,
    uuid: GPS_LOCK_CHAR_UUID,
};
const TIME_SYNC: CharacteristicRef = CharacteristicRef {
    service: CONTROL_SERVICE_UUID,
    uuid: TIME_SYNC_CHAR_UUID,
};
const LOCATION: CharacteristicRef = CharacteristicRef {
    service: LOCATION_SERVICE_UUID,
    uuid: LOCATION_CHAR_UUID,
};

/// Work the session's driver must carry out after an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    RequestMtu(u16),
    DiscoverServices,
    Read(CharacteristicRef),
    Write(CharacteristicRef, Vec<u8>),
    /// The session reached the steady state and should receive fixes.
    StartTransmitting,
    /// The connection dropped; stop sending but keep the session.
    Pause,
    /// Close the transport and forget the session.
    Teardown,
}

pub struct SessionMachine {
    device_id: DeviceId,
    state: SessionState,
    table: GattTable,
    config: LocationConfig,
    write_capability: Option<CharacteristicRef>,
    requested_mtu: u16,
    clock: fn() -> ZonedTime,
}

impl SessionMachine {
    pub fn new(device_id: DeviceId, requested_mtu: u16) -> Self {
        SessionMachine {
            device_id,
            state: SessionState::Connecting,
            table: GattTable::new(),
            config: LocationConfig::default(),
            write_capability: None,
            requested_mtu,
            clock: ZonedTime::now,
        }
    }

    /// Replaces the clock used to stamp time sync packets.
    pub fn with_clock(mut self, clock: fn() -> ZonedTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> LocationConfig {
        self.config
    }

    pub fn write_capability(&self) -> Option<CharacteristicRef> {
        self.write_capability
    }

    pub fn handle(&mut self, event: &GattEvent) -> Vec<Action> {
        if self.state == SessionState::Disconnected {
            debug!("Device {} is torn down; ignoring {event:?}", self.device_id);
            return vec![];
        }

        match event {
            GattEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state(*status, *connected)
            }
            GattEvent::ConnectFailed(e) => {
                error!("Failed to connect to device {}: {e}", self.device_id);
                self.state = SessionState::Disconnected;
                vec![Action::Teardown]
            }
            GattEvent::MtuChanged { mtu, status } if self.state == SessionState::McuNegotiating => {
                debug!("MTU for {} is {mtu} (status {status:?}); discovering services", self.device_id);
                vec![Action::DiscoverServices]
            }
            GattEvent::ServicesDiscovered { status, table }
                if self.state == SessionState::McuNegotiating =>
            {
                self.on_services_discovered(*status, table)
            }
            GattEvent::CharacteristicRead { uuid, status, value }
                if self.state == SessionState::CapabilityReading =>
            {
                self.on_read(*uuid, *status, value)
            }
            GattEvent::CharacteristicWritten { uuid, status } => self.on_written(*uuid, *status),
            GattEvent::CharacteristicChanged { uuid, value } => {
                if *uuid == LOCATION_STATUS_CHAR_UUID {
                    warn!("Device {} changed location status: {value:02x?}", self.device_id);
                } else {
                    info!("Device {} changed characteristic {uuid}: {value:02x?}", self.device_id);
                }
                vec![]
            }
            _ => {
                debug!("Device {} ignoring {event:?} in state {:?}", self.device_id, self.state);
                vec![]
            }
        }
    }

    fn on_connection_state(&mut self, status: GattStatus, connected: bool) -> Vec<Action> {
        if !status.is_success() || !connected {
            match status {
                GattStatus::Failed(code)
                    if code == GattStatus::CONNECTION_TIMEOUT
                        || code == GattStatus::TERMINATED_BY_PEER =>
                {
                    info!("Device {} disconnected, turned off or out of range: {code}", self.device_id);
                }
                GattStatus::Failed(code) => {
                    error!("Connection error on device {}: {code}", self.device_id);
                }
                GattStatus::Success => {
                    info!("Device {} disconnected", self.device_id);
                }
            }
            self.state = SessionState::Paused;
            return vec![Action::Pause];
        }

        match self.state {
            SessionState::Connecting | SessionState::Paused => {
                info!("Connected to device {}", self.device_id);
                self.state = SessionState::McuNegotiating;
                vec![Action::RequestMtu(self.requested_mtu)]
            }
            _ => {
                debug!("Device {} already connected", self.device_id);
                vec![]
            }
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, table: &GattTable) -> Vec<Action> {
        if !status.is_success() {
            warn!("Service discovery failed on device {}: {status:?}", self.device_id);
            self.state = SessionState::Disconnected;
            return vec![Action::Teardown];
        }

        self.table = table.clone();
        self.write_capability = self.has(LOCATION).then_some(LOCATION);
        if self.write_capability.is_none() {
            warn!("Device {} exposes no location characteristic", self.device_id);
        }

        if self.has(CAPABILITY) {
            info!("Reading characteristic for timezone and DST support on {}", self.device_id);
            self.state = SessionState::CapabilityReading;
            return vec![Action::Read(CAPABILITY)];
        }
        self.config = LocationConfig::default();
        self.unlock_gps()
    }

    fn on_read(&mut self, uuid: uuid::Uuid, status: GattStatus, value: &[u8]) -> Vec<Action> {
        if uuid == CAPABILITY_CHAR_UUID {
            self.config = if status.is_success() {
                LocationConfig {
                    include_timezone_and_dst: has_timezone_dst_flag(value),
                }
            } else {
                warn!("Capability read failed on {}: {status:?}; using defaults", self.device_id);
                LocationConfig::default()
            };
            info!(
                "Device {} include timezone and DST: {}",
                self.device_id, self.config.include_timezone_and_dst
            );

            if self.has(LOCATION_STATUS) {
                return vec![Action::Read(LOCATION_STATUS)];
            }
            return self.unlock_gps();
        }

        if uuid == LOCATION_STATUS_CHAR_UUID {
            info!("Device {} location status: {value:02x?}", self.device_id);
            return self.unlock_gps();
        }

        debug!("Device {} unexpected read of {uuid}", self.device_id);
        vec![]
    }

    fn on_written(&mut self, uuid: uuid::Uuid, status: GattStatus) -> Vec<Action> {
        match (self.state, uuid) {
            (SessionState::GpsUnlocking, u) if u == GPS_UNLOCK_CHAR_UUID => {
                if self.has(GPS_LOCK) {
                    info!("GPS unlocked on {} (status {status:?}); locking", self.device_id);
                    vec![Action::Write(GPS_LOCK, GPS_ENABLE_COMMAND.to_vec())]
                } else {
                    self.sync_time()
                }
            }
            (SessionState::GpsUnlocking, u) if u == GPS_LOCK_CHAR_UUID => {
                info!("GPS flag enabled on {} (status {status:?})", self.device_id);
                self.sync_time()
            }
            (SessionState::TimeSyncing, u) if u == TIME_SYNC_CHAR_UUID => {
                info!("Time sync sent to {} (status {status:?})", self.device_id);
                self.start_transmitting()
            }
            _ => vec![],
        }
    }

    fn unlock_gps(&mut self) -> Vec<Action> {
        if !self.has(GPS_UNLOCK) {
            debug!("Device {} has no GPS unlock characteristic", self.device_id);
            return self.sync_time();
        }
        self.state = SessionState::GpsUnlocking;
        vec![Action::Write(GPS_UNLOCK, GPS_ENABLE_COMMAND.to_vec())]
    }

    fn sync_time(&mut self) -> Vec<Action> {
        if !self.has(TIME_SYNC) {
            info!("Time sync characteristic not found on {}", self.device_id);
            return self.start_transmitting();
        }
        self.state = SessionState::TimeSyncing;
        vec![Action::Write(TIME_SYNC, encode_time_sync_packet(&(self.clock)()))]
    }

    fn start_transmitting(&mut self) -> Vec<Action> {
        self.state = SessionState::Transmitting;
        vec![Action::StartTransmitting]
    }

    fn has(&self, characteristic: CharacteristicRef) -> bool {
        self.table.contains(characteristic.service, characteristic.uuid)
    }
}
