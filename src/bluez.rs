//! Defines the BlueZ transport: GATT links to bonded cameras over bluer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_channel::Sender;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, AdapterEvent, AdapterProperty, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, select, FutureExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::task::JoinSet;
use tokio::time::sleep;
use uuid::Uuid;

use crate::devices::DeviceRegistry;
use crate::error::LinkError;
use crate::gatt::{CharacteristicRef, GattEvent, GattLink, GattStatus, GattTable, Transport};
use crate::lifecycle::{Command, ShutdownTarget};
use crate::protocol::LOCATION_STATUS_CHAR_UUID;
use crate::registry::DeviceId;

/// How long to wait for BlueZ to resolve GATT services after connecting.
const SERVICE_RESOLUTION_WAIT: Duration = Duration::from_secs(30);

/// Wait between connection attempts while the camera is off or out of range.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

type CharacteristicMap = HashMap<(Uuid, Uuid), Characteristic>;

/// Turns an adapter event into a lifecycle command. A configured camera appearing on the adapter
/// is connected; one disappearing asks for a debounced shutdown. Other devices are ignored.
pub fn adapter_command(event: &AdapterEvent, devices: &dyn DeviceRegistry) -> Option<Command> {
    match event {
        AdapterEvent::PropertyChanged(AdapterProperty::Powered(enabled)) => {
            Some(Command::RadioStateChanged { enabled: *enabled })
        }
        AdapterEvent::DeviceAdded(address) => {
            let id = DeviceId::new(address.to_string());
            devices.is_configured(&id).then(|| Command::Connect(id))
        }
        AdapterEvent::DeviceRemoved(address) => {
            let id = DeviceId::new(address.to_string());
            devices
                .is_configured(&id)
                .then(|| Command::RequestShutdown(ShutdownTarget::Device(id)))
        }
        _ => None,
    }
}

/// Opens links through a BlueZ adapter.
pub struct BluezTransport {
    adapter: bluer::Adapter,
}

impl BluezTransport {
    pub fn new(adapter: bluer::Adapter) -> Self {
        BluezTransport { adapter }
    }
}

impl Transport for BluezTransport {
    fn connect(
        &self,
        device: &DeviceId,
        events: Sender<GattEvent>,
    ) -> Result<Arc<dyn GattLink>, LinkError> {
        let address: Address = device
            .as_str()
            .parse()
            .map_err(|_| LinkError::InvalidAddress(device.to_string()))?;
        let handle = self.adapter.device(address)?;

        let link = Arc::new(BluezLink {
            id: device.clone(),
            device: handle,
            events,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            operation: Arc::new(tokio::sync::Mutex::new(())),
            tasks: Mutex::new(JoinSet::new()),
        });
        link.spawn(maintain_connection(
            link.id.clone(),
            link.device.clone(),
            link.events.clone(),
        ));
        Ok(link)
    }
}

/// One camera reached through BlueZ. Every operation completes asynchronously on `events`.
pub struct BluezLink {
    id: DeviceId,
    device: Device,
    events: Sender<GattEvent>,
    characteristics: Arc<Mutex<CharacteristicMap>>,
    // GATT allows one outstanding request per connection.
    operation: Arc<tokio::sync::Mutex<()>>,
    tasks: Mutex<JoinSet<()>>,
}

impl BluezLink {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn characteristic(&self, characteristic: CharacteristicRef) -> Result<Characteristic, LinkError> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(characteristic.service, characteristic.uuid))
            .cloned()
            .ok_or(LinkError::MissingCharacteristic(characteristic.uuid))
    }

    fn emit(&self, event: GattEvent) -> Result<(), LinkError> {
        self.events
            .try_send(event)
            .map_err(|_| LinkError::Transport(format!("session for {} is gone", self.id)))
    }
}

impl GattLink for BluezLink {
    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError> {
        // BlueZ exchanges the MTU itself when the link comes up.
        debug!("Requested MTU {mtu} for {}; leaving exchange to BlueZ", self.id);
        self.emit(GattEvent::MtuChanged {
            mtu,
            status: GattStatus::Success,
        })
    }

    fn discover_services(&self) -> Result<(), LinkError> {
        let id = self.id.clone();
        let device = self.device.clone();
        let events = self.events.clone();
        let characteristics = self.characteristics.clone();

        self.spawn(async move {
            let mut status_char = None;
            let event = match discover(&device).await {
                Ok((table, found)) => {
                    info!("Discovered {} characteristics on {id}", table.len());
                    status_char = found
                        .iter()
                        .find(|((_, uuid), _)| *uuid == LOCATION_STATUS_CHAR_UUID)
                        .map(|(_, characteristic)| characteristic.clone());
                    *characteristics.lock().unwrap_or_else(PoisonError::into_inner) = found;
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::Success,
                        table,
                    }
                }
                Err(e) => {
                    warn!("Service discovery on {id} failed: {e}");
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::GATT_ERROR,
                        table: GattTable::new(),
                    }
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
            if let Some(characteristic) = status_char {
                forward_notifications(id, characteristic, events).await;
            }
        });
        Ok(())
    }

    fn read(&self, characteristic: CharacteristicRef) -> Result<(), LinkError> {
        let remote = self.characteristic(characteristic)?;
        let id = self.id.clone();
        let events = self.events.clone();
        let operation = self.operation.clone();

        self.spawn(async move {
            let _guard = operation.lock().await;
            let event = match remote.read().await {
                Ok(value) => {
                    trace!("Read {value:02x?} from {} on {id}", characteristic.uuid);
                    GattEvent::CharacteristicRead {
                        uuid: characteristic.uuid,
                        status: GattStatus::Success,
                        value,
                    }
                }
                Err(e) => {
                    warn!("Reading {} on {id} failed: {e}", characteristic.uuid);
                    GattEvent::CharacteristicRead {
                        uuid: characteristic.uuid,
                        status: GattStatus::GATT_ERROR,
                        value: vec![],
                    }
                }
            };
            let _ = events.send(event).await;
        });
        Ok(())
    }

    fn write(&self, characteristic: CharacteristicRef, value: Vec<u8>) -> Result<(), LinkError> {
        let remote = self.characteristic(characteristic)?;
        let id = self.id.clone();
        let events = self.events.clone();
        let operation = self.operation.clone();

        self.spawn(async move {
            let _guard = operation.lock().await;
            let status = match remote.write(&value).await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    debug!("Writing {} on {id} failed: {e}", characteristic.uuid);
                    GattStatus::GATT_ERROR
                }
            };
            let _ = events
                .send(GattEvent::CharacteristicWritten {
                    uuid: characteristic.uuid,
                    status,
                })
                .await;
        });
        Ok(())
    }

    fn close(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.events.close();

        let id = self.id.clone();
        let device = self.device.clone();
        tokio::spawn(async move {
            match device.disconnect().await {
                Ok(()) => info!("Disconnected from {id}"),
                Err(e) => debug!("Disconnecting from {id} failed: {e}"),
            }
        });
    }
}

/// Connects to `device` and keeps reconnecting for as long as the session lives, reporting each
/// change of connection state.
async fn maintain_connection(id: DeviceId, device: Device, events: Sender<GattEvent>) {
    match device.is_paired().await {
        Ok(true) => {}
        Ok(false) => {
            let _ = events
                .send(GattEvent::ConnectFailed(LinkError::NotPaired(id.to_string())))
                .await;
            return;
        }
        Err(e) => {
            let _ = events.send(GattEvent::ConnectFailed(e.into())).await;
            return;
        }
    }

    let changes = match device.events().await {
        Ok(changes) => changes,
        Err(e) => {
            let _ = events.send(GattEvent::ConnectFailed(e.into())).await;
            return;
        }
    };
    pin_mut!(changes);

    let mut reported: Option<bool> = None;
    loop {
        if !device.is_connected().await.unwrap_or(false) {
            if let Err(e) = device.connect().await {
                debug!("Could not connect to {id}: {e}; retrying in {RECONNECT_INTERVAL:?}");
                if reported != Some(false) {
                    reported = Some(false);
                    let event = GattEvent::ConnectionStateChanged {
                        status: GattStatus::Failed(GattStatus::CONNECTION_TIMEOUT),
                        connected: false,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                sleep(RECONNECT_INTERVAL).await;
                continue;
            }
        }

        if reported != Some(true) {
            reported = Some(true);
            let event = GattEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                connected: true,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }

        loop {
            match changes.next().await {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => break,
                Some(_) => continue,
                None => {
                    debug!("Changes for {id} stopped streaming");
                    return;
                }
            }
        }

        info!("Lost connection to {id}");
        reported = Some(false);
        let event = GattEvent::ConnectionStateChanged {
            status: GattStatus::Failed(GattStatus::TERMINATED_BY_PEER),
            connected: false,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

async fn discover(device: &Device) -> Result<(GattTable, CharacteristicMap), LinkError> {
    wait_for_services(device).await?;

    let mut table = GattTable::new();
    let mut found = CharacteristicMap::new();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        debug!("Service UUID: {service_uuid}");
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            debug!("Characteristic UUID: {uuid}");
            table.insert(service_uuid, uuid);
            found.insert((service_uuid, uuid), characteristic);
        }
    }
    Ok((table, found))
}

async fn wait_for_services(device: &Device) -> Result<(), LinkError> {
    if device.is_services_resolved().await? {
        return Ok(());
    }

    let changes = device.events().await?.fuse();
    pin_mut!(changes);
    let timeout = sleep(SERVICE_RESOLUTION_WAIT).fuse();
    pin_mut!(timeout);

    debug!("Waiting for GATT services to resolve");
    loop {
        select! {
            change = changes.next() => {
                match change {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => {
                        debug!("GATT services resolved");
                        return Ok(());
                    }
                    Some(_) => {
                        if device.is_services_resolved().await? {
                            debug!("GATT services resolved");
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(LinkError::Transport(
                            "device changes stopped streaming".to_string(),
                        ));
                    }
                }
            },
            () = &mut timeout => {
                return Err(LinkError::Transport(format!(
                    "GATT services failed to resolve after {SERVICE_RESOLUTION_WAIT:?}"
                )));
            },
        }
    }
}

async fn forward_notifications(id: DeviceId, characteristic: Characteristic, events: Sender<GattEvent>) {
    let uuid = match characteristic.uuid().await {
        Ok(uuid) => uuid,
        Err(e) => {
            debug!("Could not read characteristic UUID on {id}: {e}");
            return;
        }
    };
    match characteristic.flags().await {
        Ok(flags) if flags.notify => {}
        _ => return,
    }

    let notifications = match characteristic.notify().await {
        Ok(notifications) => notifications,
        Err(e) => {
            warn!("Could not subscribe to {uuid} on {id}: {e}");
            return;
        }
    };
    pin_mut!(notifications);
    while let Some(value) = notifications.next().await {
        if events
            .send(GattEvent::CharacteristicChanged { uuid, value })
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceConfig, FileDeviceRegistry};

    const CAMERA: [u8; 6] = [0xD8, 0x3A, 0xDD, 0x10, 0x20, 0x3F];
    const HEADPHONES: [u8; 6] = [0x00, 0x1B, 0x66, 0x01, 0x02, 0x03];

    fn devices() -> FileDeviceRegistry {
        FileDeviceRegistry::new(vec![DeviceConfig {
            address: DeviceId::new("d8:3a:dd:10:20:3f"),
            display_name: "ILCE-7M4".to_string(),
            enabled: true,
            always_on_enabled: false,
        }])
    }

    #[test]
    fn test_configured_camera_appearing_connects() {
        let event = AdapterEvent::DeviceAdded(Address::new(CAMERA));
        assert_eq!(
            adapter_command(&event, &devices()),
            Some(Command::Connect(DeviceId::new("D8:3A:DD:10:20:3F")))
        );
    }

    #[test]
    fn test_configured_camera_disappearing_requests_device_shutdown() {
        let event = AdapterEvent::DeviceRemoved(Address::new(CAMERA));
        assert_eq!(
            adapter_command(&event, &devices()),
            Some(Command::RequestShutdown(ShutdownTarget::Device(DeviceId::new(
                "D8:3A:DD:10:20:3F"
            ))))
        );
    }

    #[test]
    fn test_unconfigured_devices_are_ignored() {
        let devices = devices();
        assert_eq!(
            adapter_command(&AdapterEvent::DeviceAdded(Address::new(HEADPHONES)), &devices),
            None
        );
        assert_eq!(
            adapter_command(&AdapterEvent::DeviceRemoved(Address::new(HEADPHONES)), &devices),
            None
        );
    }

    #[test]
    fn test_power_change_maps_to_radio_state() {
        let event = AdapterEvent::PropertyChanged(AdapterProperty::Powered(false));
        assert_eq!(
            adapter_command(&event, &devices()),
            Some(Command::RadioStateChanged { enabled: false })
        );
        let event = AdapterEvent::PropertyChanged(AdapterProperty::Discovering(true));
        assert_eq!(adapter_command(&event, &devices()), None);
    }
}
