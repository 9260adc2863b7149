//! Defines a provider for a camera rig that never moves: a surveyed position from the settings
//! file, re-stamped with the current time on every update.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_channel::Sender;
use chrono::Utc;
use log::debug;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{LocationFix, LocationProvider, ProviderKind};
use crate::error::LinkError;

fn default_accuracy() -> f32 {
    100.0
}

/// A position configured by hand.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FixedPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default = "default_accuracy")]
    pub accuracy_m: f32,
}

impl FixedPosition {
    fn fix_now(&self) -> LocationFix {
        LocationFix {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            accuracy_meters: self.accuracy_m,
            timestamp_millis: Utc::now().timestamp_millis(),
            bearing: None,
            speed: None,
        }
    }
}

/// Lowest ranked provider: used only when no live source starts.
pub struct FixedProvider {
    position: Option<FixedPosition>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FixedProvider {
    pub fn new(position: Option<FixedPosition>) -> Self {
        FixedProvider {
            position,
            task: Mutex::new(None),
        }
    }
}

impl LocationProvider for FixedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Network
    }

    fn is_available(&self) -> bool {
        self.position.is_some()
    }

    fn last_known(&self) -> Option<LocationFix> {
        self.position.as_ref().map(FixedPosition::fix_now)
    }

    fn start(&self, period: Duration, sink: Sender<LocationFix>) -> Result<(), LinkError> {
        let position = self
            .position
            .clone()
            .ok_or_else(|| LinkError::Provider("no fixed position configured".to_string()))?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sink.send(position.fix_now()).await.is_err() {
                    debug!("Location sink closed; stopping fixed position updates");
                    return;
                }
            }
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
