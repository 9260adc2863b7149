//! Defines the location source coordinator.
//!
//! One coordinator serves every session. It pulls fixes from the best available provider, keeps
//! the single current fix, and writes it to every transmitting session both when a fix is
//! accepted and on a heartbeat, so a stationary phone still reaches the cameras.

pub mod fixed;
pub mod gpsd;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_channel::Sender;
use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::LinkError;
use crate::protocol::{encode_location_packet, ZoneInfo};
use crate::registry::{ConnectionRegistry, SessionState};

/// Accuracy difference beyond which a new fix is considered much worse.
pub const ACCURACY_THRESHOLD_METERS: f32 = 200.0;

/// Age difference beyond which a worse fix still replaces the current one.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Reference interval for provider updates and the heartbeat.
pub const LOCATION_UPDATE_INTERVAL: Duration = Duration::from_millis(10_000);

/// A GPS sample from the phone.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_meters: f32,
    pub timestamp_millis: i64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
}

/// Decides whether a new fix supersedes the current one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AcceptancePolicy {
    pub accuracy_threshold_meters: f32,
    pub staleness_threshold: Duration,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        AcceptancePolicy {
            accuracy_threshold_meters: ACCURACY_THRESHOLD_METERS,
            staleness_threshold: STALENESS_THRESHOLD,
        }
    }
}

impl AcceptancePolicy {
    pub fn should_accept(&self, new: &LocationFix, current: Option<&LocationFix>) -> bool {
        let Some(current) = current else {
            return true;
        };

        let accuracy_difference = new.accuracy_meters - current.accuracy_meters;
        if accuracy_difference <= self.accuracy_threshold_meters {
            return true;
        }

        let age_difference = new.timestamp_millis - current.timestamp_millis;
        if age_difference > self.staleness_threshold.as_millis() as i64 {
            debug!("Current location is older than {:?}; accepting less accurate one", self.staleness_threshold);
            return true;
        }

        debug!("New location is {accuracy_difference}m less accurate than the current one; rejecting");
        false
    }
}

/// Where a provider's fixes come from, in order of preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderKind {
    /// High level fused location service.
    Fused,
    /// Fused provider built into the platform.
    PlatformFused,
    Gps,
    Network,
}

/// A source of phone location fixes.
pub trait LocationProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn is_available(&self) -> bool;

    fn last_known(&self) -> Option<LocationFix>;

    /// Starts delivering fixes to `sink`, at most about once per `interval`.
    fn start(&self, interval: Duration, sink: Sender<LocationFix>) -> Result<(), LinkError>;

    fn stop(&self);
}

/// Available providers, best first.
pub fn rank_providers(providers: &[Arc<dyn LocationProvider>]) -> Vec<Arc<dyn LocationProvider>> {
    let mut ranked: Vec<_> = providers
        .iter()
        .filter(|provider| provider.is_available())
        .cloned()
        .collect();
    ranked.sort_by_key(|provider| provider.kind());
    ranked
}

struct Updates {
    provider: Arc<dyn LocationProvider>,
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

pub struct LocationCoordinator {
    registry: Arc<ConnectionRegistry>,
    providers: Vec<Arc<dyn LocationProvider>>,
    policy: AcceptancePolicy,
    interval: Duration,
    current: Mutex<Option<LocationFix>>,
    updates: Mutex<Option<Updates>>,
}

impl LocationCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        providers: Vec<Arc<dyn LocationProvider>>,
        policy: AcceptancePolicy,
        interval: Duration,
    ) -> Self {
        LocationCoordinator {
            registry,
            providers,
            policy,
            interval,
            current: Mutex::new(None),
            updates: Mutex::new(None),
        }
    }

    pub fn current_fix(&self) -> Option<LocationFix> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the current fix with `fix` if the acceptance policy allows it.
    pub fn offer(&self, fix: LocationFix) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.policy.should_accept(&fix, current.as_ref()) {
            return false;
        }
        *current = Some(fix);
        true
    }

    /// Writes the current fix to every transmitting session. Returns how many writes were issued.
    pub fn broadcast(&self) -> usize {
        let Some(fix) = self.current_fix() else {
            warn!("No location available to send");
            return 0;
        };
        let zone = ZoneInfo::local();

        let mut sent = 0;
        for session in self.registry.sessions_in_state(SessionState::Transmitting) {
            let Some(characteristic) = session.write_capability else {
                debug!("Device {} has no location characteristic; skipping", session.device_id);
                continue;
            };

            let packet = encode_location_packet(&fix, &session.location_config, &zone);
            trace!("Location packet for {} is {packet:02x?}", session.device_id);
            match session.link.write(characteristic, packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Failed to send location data to {}: {e}", session.device_id);
                    self.registry
                        .update(&session.device_id, |s| s.consecutive_write_errors += 1);
                }
            }
        }
        sent
    }

    /// Heartbeat: re-sends the current fix even if nothing new arrived.
    pub fn tick(&self) -> usize {
        debug!("Periodic: sending last known location to cameras");
        self.broadcast()
    }

    pub fn is_running(&self) -> bool {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts updates when the first session transmits and stops them when the last one stops.
    pub fn sync(self: &Arc<Self>) {
        let transmitting = !self
            .registry
            .sessions_in_state(SessionState::Transmitting)
            .is_empty();

        if transmitting && !self.is_running() {
            if let Err(e) = self.start() {
                error!("Cannot start location transmission: {e}");
            }
        } else if !transmitting && self.is_running() {
            debug!("No active cameras remaining, stopping location updates");
            self.stop();
        }
    }

    /// Starts provider updates and the heartbeat. Does nothing if already started.
    pub fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        let mut updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        if updates.is_some() {
            return Ok(());
        }

        let (fix_send, fix_receive) = async_channel::unbounded::<LocationFix>();
        let mut started = None;
        for provider in rank_providers(&self.providers) {
            match provider.start(self.interval, fix_send.clone()) {
                Ok(()) => {
                    info!("Started location updates from {:?} provider", provider.kind());
                    started = Some(provider);
                    break;
                }
                Err(e) => {
                    warn!("{:?} provider failed to start: {e}; trying next provider", provider.kind());
                }
            }
        }
        let Some(provider) = started else {
            return Err(LinkError::NoLocationProvider);
        };

        if let Some(fix) = provider.last_known() {
            if self.offer(fix) {
                debug!("Sending initial location to all active connections");
                self.broadcast();
            }
        }

        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Ok(fix) = fix_receive.recv().await {
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                debug!("Got a new location with accuracy {}m", fix.accuracy_meters);
                if coordinator.offer(fix) {
                    coordinator.broadcast();
                }
            }
        });

        let heartbeat = tokio::spawn(Self::heartbeat(Arc::downgrade(self), self.interval));
        info!("Started periodic location transmission every {:?}", self.interval);

        *updates = Some(Updates {
            provider,
            pump,
            heartbeat,
        });
        Ok(())
    }

    async fn heartbeat(coordinator: Weak<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match coordinator.upgrade() {
                Some(coordinator) => {
                    coordinator.tick();
                }
                None => break,
            }
        }
    }

    pub fn stop(&self) {
        let Some(updates) = self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        updates.provider.stop();
        updates.pump.abort();
        updates.heartbeat.abort();
        info!("Stopped location updates");
    }
}

impl Drop for LocationCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
