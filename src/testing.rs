//! In-memory stand-ins for the hardware and host seams, shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::Sender;
use uuid::Uuid;

use crate::devices::{DeviceConfig, DeviceRegistry};
use crate::error::LinkError;
use crate::gatt::{CharacteristicRef, GattEvent, GattLink, Transport};
use crate::lifecycle::{Notice, RestartRequest, ServiceHost};
use crate::location::{LocationFix, LocationProvider, ProviderKind};
use crate::registry::DeviceId;

pub fn fix_at(accuracy_meters: f32, timestamp_millis: i64) -> LocationFix {
    LocationFix {
        latitude: 35.6586,
        longitude: 139.7454,
        altitude: Some(40.0),
        accuracy_meters,
        timestamp_millis,
        bearing: None,
        speed: None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkOp {
    RequestMtu(u16),
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
}

#[derive(Default)]
pub struct FakeLink {
    ops: Mutex<Vec<LinkOp>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl FakeLink {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeLink::default())
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                LinkOp::Write(target, value) if target == uuid => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: LinkOp) {
        self.ops.lock().unwrap().push(op);
    }
}

impl GattLink for FakeLink {
    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError> {
        self.record(LinkOp::RequestMtu(mtu));
        Ok(())
    }

    fn discover_services(&self) -> Result<(), LinkError> {
        self.record(LinkOp::DiscoverServices);
        Ok(())
    }

    fn read(&self, characteristic: CharacteristicRef) -> Result<(), LinkError> {
        self.record(LinkOp::Read(characteristic.uuid));
        Ok(())
    }

    fn write(&self, characteristic: CharacteristicRef, value: Vec<u8>) -> Result<(), LinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("write refused".to_string()));
        }
        self.record(LinkOp::Write(characteristic.uuid, value));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakeLink`]s and keeps each device's event sender so tests can play the stack.
#[derive(Default)]
pub struct FakeTransport {
    links: Mutex<HashMap<DeviceId, (Arc<FakeLink>, Sender<GattEvent>)>>,
    attempts: Mutex<Vec<DeviceId>>,
    fail_with: Mutex<Option<LinkError>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeTransport::default())
    }

    pub fn fail_with(&self, error: Option<LinkError>) {
        *self.fail_with.lock().unwrap() = error;
    }

    pub fn attempts(&self) -> Vec<DeviceId> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn link(&self, id: &str) -> Arc<FakeLink> {
        self.links.lock().unwrap()[&DeviceId::new(id)].0.clone()
    }

    pub fn events(&self, id: &str) -> Sender<GattEvent> {
        self.links.lock().unwrap()[&DeviceId::new(id)].1.clone()
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        device: &DeviceId,
        events: Sender<GattEvent>,
    ) -> Result<Arc<dyn GattLink>, LinkError> {
        self.attempts.lock().unwrap().push(device.clone());
        if let Some(e) = self.fail_with.lock().unwrap().clone() {
            return Err(e);
        }
        let link = FakeLink::new();
        self.links
            .lock()
            .unwrap()
            .insert(device.clone(), (link.clone(), events));
        Ok(link)
    }
}

#[derive(Default)]
pub struct FakeHost {
    deny_promotion: AtomicBool,
    promotions: AtomicUsize,
    stops: AtomicUsize,
    restarts: Mutex<Vec<RestartRequest>>,
    notices: Mutex<Vec<Notice>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHost::default())
    }

    pub fn deny_promotion(&self, deny: bool) {
        self.deny_promotion.store(deny, Ordering::SeqCst);
    }

    pub fn promotions(&self) -> usize {
        self.promotions.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> Vec<RestartRequest> {
        self.restarts.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl ServiceHost for FakeHost {
    fn promote_to_foreground(&self) -> Result<(), LinkError> {
        if self.deny_promotion.load(Ordering::SeqCst) {
            return Err(LinkError::ForegroundDenied("denied in test".to_string()));
        }
        self.promotions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_service(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn request_restart(&self, request: RestartRequest) {
        self.restarts.lock().unwrap().push(request);
    }

    fn update_notification(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

#[derive(Default)]
pub struct FakeDevices {
    devices: Mutex<Vec<DeviceConfig>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeDevices::default())
    }

    pub fn add(&self, address: &str, enabled: bool, always_on_enabled: bool) {
        self.devices.lock().unwrap().push(DeviceConfig {
            address: DeviceId::new(address),
            display_name: address.to_string(),
            enabled,
            always_on_enabled,
        });
    }

    fn find(&self, id: &DeviceId) -> Option<DeviceConfig> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|device| &device.address == id)
            .cloned()
    }
}

impl DeviceRegistry for FakeDevices {
    fn list_always_on_devices(&self) -> Vec<DeviceConfig> {
        self.devices
            .lock()
            .unwrap()
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

pub struct FakeProvider {
    kind: ProviderKind,
    available: AtomicBool,
    fail_start: AtomicBool,
    last_known: Mutex<Option<LocationFix>>,
    sink: Mutex<Option<Sender<LocationFix>>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(FakeProvider {
            kind,
            available: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            last_known: Mutex::new(None),
            sink: Mutex::new(None),
        })
    }

    pub fn as_provider(self: &Arc<Self>) -> Arc<dyn LocationProvider> {
        self.clone()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_last_known(&self, fix: Option<LocationFix>) {
        *self.last_known.lock().unwrap() = fix;
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub async fn push(&self, fix: LocationFix) {
        let sink = self.sink.lock().unwrap().clone();
        sink.expect("provider not started").send(fix).await.unwrap();
    }
}

impl LocationProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn last_known(&self) -> Option<LocationFix> {
        self.last_known.lock().unwrap().clone()
    }

    fn start(&self, _interval: Duration, sink: Sender<LocationFix>) -> Result<(), LinkError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(LinkError::Provider("start refused".to_string()));
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        *self.sink.lock().unwrap() = None;
    }
}
