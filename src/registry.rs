//! Defines the registry of live device sessions.

use std::fmt;
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::gatt::{CharacteristicRef, GattLink};
use crate::protocol::LocationConfig;

/// Hardware address of a camera, canonicalised to uppercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl AsRef<str>) -> Self {
        DeviceId(address.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(address: String) -> Self {
        DeviceId::new(address)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        DeviceId::new(address)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of a device session. A device with no session is idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    McuNegotiating,
    CapabilityReading,
    GpsUnlocking,
    TimeSyncing,
    Transmitting,
    /// Connection lost; kept so the stack can reconnect and negotiation can resume.
    Paused,
    Disconnected,
}

impl SessionState {
    /// Whether the transport reported the device as connected in this state.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            SessionState::Connecting | SessionState::Paused | SessionState::Disconnected
        )
    }
}

/// One connected camera.
#[derive(Clone)]
pub struct DeviceSession {
    pub device_id: DeviceId,
    pub link: Arc<dyn GattLink>,
    pub state: SessionState,
    /// Set only once service discovery found the location characteristic.
    pub write_capability: Option<CharacteristicRef>,
    pub location_config: LocationConfig,
    pub consecutive_write_errors: u32,
    worker: Option<AbortHandle>,
}

impl DeviceSession {
    pub fn new(device_id: DeviceId, link: Arc<dyn GattLink>) -> Self {
        DeviceSession {
            device_id,
            link,
            state: SessionState::Connecting,
            write_capability: None,
            location_config: LocationConfig::default(),
            consecutive_write_errors: 0,
            worker: None,
        }
    }

    /// Attaches the task driving this session so closing the session also stops it.
    pub fn attach_worker(&mut self, worker: AbortHandle) {
        self.worker = Some(worker);
    }

    /// Closes the transport and stops the session's task.
    pub fn close(&self) {
        self.link.close();
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("state", &self.state)
            .field("write_capability", &self.write_capability)
            .field("location_config", &self.location_config)
            .field("consecutive_write_errors", &self.consecutive_write_errors)
            .finish()
    }
}

/// Concurrent map of device id to session. At most one session exists per id.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<DeviceId, DeviceSession>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` unless one already exists for its id, in which case `session` is handed
    /// back untouched.
    pub fn add(&self, session: DeviceSession) -> Result<(), DeviceSession> {
        match self.sessions.entry(session.device_id.clone()) {
            Entry::Occupied(_) => Err(session),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Removes the session without closing it.
    pub fn remove(&self, id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Returns a snapshot of the session.
    pub fn get(&self, id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Applies `mutation` to the session as one step. Readers see either the old or the new
    /// record. Returns false if no session exists for `id`.
    ///
    /// `mutation` runs while the entry is locked and must not call back into the registry.
    pub fn update<F>(&self, id: &DeviceId, mutation: F) -> bool
    where
        F: FnOnce(&mut DeviceSession),
    {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                let mut next = entry.value().clone();
                mutation(&mut next);
                *entry.value_mut() = next;
                true
            }
            None => false,
        }
    }

    pub fn all_sessions(&self) -> Vec<DeviceSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn sessions_in_state(&self, state: SessionState) -> Vec<DeviceSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state == state)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connected_sessions(&self) -> Vec<DeviceSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state.is_connected())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes every session and hands them back for closing.
    pub fn clear_all(&self) -> Vec<DeviceSession> {
        let ids: Vec<DeviceId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLink;

    fn session(id: &str) -> (DeviceSession, Arc<FakeLink>) {
        let link = FakeLink::new();
        (DeviceSession::new(DeviceId::new(id), link.clone()), link)
    }

    #[test]
    fn test_device_id_is_uppercased() {
        assert_eq!(DeviceId::new(" aa:bb:cc:dd:ee:ff ").as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(DeviceId::from("aa:bb"), DeviceId::from("AA:BB"));
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let registry = ConnectionRegistry::new();
        let (first, first_link) = session("aa:bb:cc:dd:ee:01");
        let (second, _) = session("AA:BB:CC:DD:EE:01");

        assert!(registry.add(first).is_ok());
        let rejected = registry.add(second).unwrap_err();
        assert_eq!(rejected.device_id, DeviceId::new("AA:BB:CC:DD:EE:01"));

        assert_eq!(registry.len(), 1);
        let kept = registry.get(&DeviceId::new("AA:BB:CC:DD:EE:01")).unwrap();
        kept.close();
        assert!(first_link.is_closed());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let registry = ConnectionRegistry::new();
        let id = DeviceId::new("AA:BB:CC:DD:EE:02");

        assert!(registry.remove(&id).is_none());
        assert!(!registry.update(&id, |s| s.consecutive_write_errors += 1));
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_update_is_visible_to_later_reads() {
        let registry = ConnectionRegistry::new();
        let (s, _) = session("AA:BB:CC:DD:EE:03");
        let id = s.device_id.clone();
        registry.add(s).unwrap();

        assert!(registry.update(&id, |s| {
            s.state = SessionState::Transmitting;
            s.location_config.include_timezone_and_dst = false;
        }));

        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Transmitting);
        assert!(!snapshot.location_config.include_timezone_and_dst);
    }

    #[test]
    fn test_sessions_in_state_filters() {
        let registry = ConnectionRegistry::new();
        for (id, state) in [
            ("AA:00", SessionState::Transmitting),
            ("AA:01", SessionState::CapabilityReading),
            ("AA:02", SessionState::Transmitting),
            ("AA:03", SessionState::Paused),
        ] {
            let (mut s, _) = session(id);
            s.state = state;
            registry.add(s).unwrap();
        }

        assert_eq!(registry.sessions_in_state(SessionState::Transmitting).len(), 2);
        assert_eq!(registry.connected_sessions().len(), 3);
        assert_eq!(registry.all_sessions().len(), 4);
    }

    #[test]
    fn test_clear_all_drains_registry() {
        let registry = ConnectionRegistry::new();
        registry.add(session("AA:00").0).unwrap();
        registry.add(session("AA:01").0).unwrap();

        let drained = registry.clear_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (s, _) = session("AA:BB:CC:DD:EE:04");
        let id = s.device_id.clone();
        registry.add(s).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.update(&id, |s| s.consecutive_write_errors += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get(&id).unwrap().consecutive_write_errors, 800);
    }

    #[test]
    fn test_close_closes_link() {
        let (s, link) = session("AA:BB:CC:DD:EE:05");
        s.close();
        assert!(link.is_closed());
    }
}
