//! Defines a location provider backed by gpsd.

use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_channel::Sender;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{LocationFix, LocationProvider, ProviderKind};
use crate::error::LinkError;

/// Request gpsd sends JSON reports for.
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Wait before reconnecting to gpsd after the connection dropped.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on the first connection made by `start`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Accuracy assumed when gpsd reports no error estimate.
const UNKNOWN_ACCURACY_METERS: f32 = 50.0;

#[derive(Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "altHAE")]
    alt_hae: Option<f64>,
    alt: Option<f64>,
    time: Option<String>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    track: Option<f64>,
    speed: Option<f64>,
}

/// Parses one line of gpsd output into a fix. Only `TPV` reports with at least a 2D fix qualify.
pub fn parse_tpv(line: &str) -> Option<LocationFix> {
    let report: Report = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }

    let accuracy_meters = match (report.epx, report.epy, report.eph) {
        (Some(epx), Some(epy), _) => epx.max(epy) as f32,
        (_, _, Some(eph)) => eph as f32,
        _ => UNKNOWN_ACCURACY_METERS,
    };
    let timestamp_millis = report
        .time
        .as_deref()
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
        .map(|time| time.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Some(LocationFix {
        latitude: report.lat?,
        longitude: report.lon?,
        altitude: if report.mode >= 3 {
            report.alt_hae.or(report.alt)
        } else {
            None
        },
        accuracy_meters,
        timestamp_millis,
        bearing: report.track.map(|track| track as f32),
        speed: report.speed.map(|speed| speed as f32),
    })
}

/// Reads fixes from a gpsd daemon over TCP.
pub struct GpsdProvider {
    address: String,
    last: Arc<Mutex<Option<LocationFix>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GpsdProvider {
    pub fn new(address: String) -> Self {
        GpsdProvider {
            address,
            last: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Opens the first connection synchronously so an unreachable gpsd fails `start`.
    fn open(&self) -> Result<TcpStream, LinkError> {
        let unreachable = |e: std::io::Error| {
            LinkError::Provider(format!("gpsd at {} is unreachable: {e}", self.address))
        };
        let address = self
            .address
            .to_socket_addrs()
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| LinkError::Provider(format!("{} resolved to nothing", self.address)))?;
        let stream =
            std::net::TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(unreachable)?;
        stream.set_nonblocking(true).map_err(unreachable)?;
        TcpStream::from_std(stream).map_err(unreachable)
    }

    async fn stream_forever(
        address: String,
        first: TcpStream,
        interval: Duration,
        last: Arc<Mutex<Option<LocationFix>>>,
        sink: Sender<LocationFix>,
    ) {
        let mut last_forwarded: Option<Instant> = None;
        let mut connected = Some(first);
        loop {
            let stream = match connected.take() {
                Some(stream) => stream,
                None => match TcpStream::connect(&address).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Could not reach gpsd at {address}: {e}; retrying in {RECONNECT_INTERVAL:?}");
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                        continue;
                    }
                },
            };
            match Self::stream_once(stream, &address, interval, &last, &sink, &mut last_forwarded).await {
                Ok(()) => {
                    debug!("Location sink closed; stopping gpsd reader");
                    return;
                }
                Err(e) => {
                    warn!("Lost gpsd at {address}: {e}; reconnecting in {RECONNECT_INTERVAL:?}");
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
            }
        }
    }

    // Returns Ok only once the sink is closed.
    async fn stream_once(
        mut stream: TcpStream,
        address: &str,
        interval: Duration,
        last: &Mutex<Option<LocationFix>>,
        sink: &Sender<LocationFix>,
        last_forwarded: &mut Option<Instant>,
    ) -> Result<(), LinkError> {
        stream
            .write_all(WATCH_COMMAND)
            .await
            .map_err(|e| LinkError::Provider(format!("could not send watch command: {e}")))?;
        info!("Watching gpsd at {address}");

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(LinkError::Provider("gpsd closed the connection".to_string())),
                Err(e) => return Err(LinkError::Provider(format!("could not read report: {e}"))),
            };
            trace!("gpsd report: {line}");

            let Some(fix) = parse_tpv(&line) else {
                continue;
            };
            *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix.clone());

            let due = last_forwarded.map_or(true, |at| at.elapsed() >= interval);
            if !due {
                continue;
            }
            *last_forwarded = Some(Instant::now());
            if sink.send(fix).await.is_err() {
                return Ok(());
            }
        }
    }
}

impl LocationProvider for GpsdProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gps
    }

    fn is_available(&self) -> bool {
        !self.address.is_empty()
    }

    fn last_known(&self) -> Option<LocationFix> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn start(&self, interval: Duration, sink: Sender<LocationFix>) -> Result<(), LinkError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let first = self.open()?;
        *task = Some(tokio::spawn(Self::stream_forever(
            self.address.clone(),
            first,
            interval,
            self.last.clone(),
            sink,
        )));
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
