//! The camera GPS link process (runs as a systemd service.)

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_channel::Sender;
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::signal::unix::{signal, SignalKind};

use camera_gps_link::bluez::{adapter_command, BluezTransport};
use camera_gps_link::devices::{DeviceRegistry, FileDeviceRegistry};
use camera_gps_link::env;
use camera_gps_link::error::LinkError;
use camera_gps_link::lifecycle::{
    Command, CommandQueue, LifecycleController, Notice, RestartRequest, ServiceHost,
};
use camera_gps_link::location::fixed::FixedProvider;
use camera_gps_link::location::gpsd::GpsdProvider;
use camera_gps_link::location::{LocationCoordinator, LocationProvider};
use camera_gps_link::registry::{ConnectionRegistry, DeviceId};
use camera_gps_link::session::SessionContext;
use camera_gps_link::status::TransmissionStatus;

/// The daemon itself as seen by the lifecycle controller. Stopping ends the main loop; a restart
/// request is remembered and turned into a failing exit code so systemd starts us again.
struct DaemonHost {
    stop: Sender<()>,
    restart: Mutex<Option<RestartRequest>>,
}

impl DaemonHost {
    fn restart_request(&self) -> Option<RestartRequest> {
        *self.restart.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceHost for DaemonHost {
    fn promote_to_foreground(&self) -> Result<(), LinkError> {
        // A systemd service is already persistent.
        Ok(())
    }

    fn stop_service(&self) {
        info!("Stopping the camera GPS link");
        let _ = self.stop.try_send(());
    }

    fn request_restart(&self, request: RestartRequest) {
        *self.restart.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }

    fn update_notification(&self, notice: Notice) {
        match notice {
            Notice::Standby => info!("Status: standby"),
            Notice::Transmitting { count } => info!("Status: sending location to {count} camera(s)"),
        }
    }
}

/// Forwards adapter power changes and configured cameras coming and going to the controller
/// until the adapter goes away.
async fn watch_adapter(
    adapter: bluer::Adapter,
    devices: Arc<dyn DeviceRegistry>,
    queue: CommandQueue,
) -> Result<()> {
    let events = adapter.events().await?;
    pin_mut!(events);

    while let Some(event) = events.next().await {
        if let Some(command) = adapter_command(&event, devices.as_ref()) {
            info!("Bluetooth adapter event: {event:?}");
            queue.send(command).await;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Started the camera GPS link");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let settings = env::load_settings();

    debug!("Getting bluer session");
    let session = bluer::Session::new().await?;
    debug!("Getting default adapter");
    let adapter = session.default_adapter().await?;
    log_adapter_info(&adapter).await?;
    let radio_enabled = adapter.is_powered().await?;

    let registry = Arc::new(ConnectionRegistry::new());
    let providers: Vec<Arc<dyn LocationProvider>> = vec![
        Arc::new(GpsdProvider::new(settings.gpsd_address.clone())),
        Arc::new(FixedProvider::new(settings.fixed_position.clone())),
    ];
    let coordinator = Arc::new(LocationCoordinator::new(
        registry.clone(),
        providers,
        settings.acceptance_policy(),
        settings.update_interval(),
    ));

    let (stop_send, stop_receive) = async_channel::bounded(1);
    let host = Arc::new(DaemonHost {
        stop: stop_send,
        restart: Mutex::new(None),
    });
    let context = Arc::new(SessionContext {
        registry,
        coordinator,
        status: TransmissionStatus::new(),
        host: host.clone(),
    });
    let devices: Arc<dyn DeviceRegistry> =
        Arc::new(FileDeviceRegistry::new(settings.devices.clone()));
    let controller = Arc::new(LifecycleController::new(
        context,
        Arc::new(BluezTransport::new(adapter.clone())),
        devices.clone(),
        &settings,
        radio_enabled,
    ));
    let (queue, consumer) = controller.clone().spawn();

    let addresses: Vec<DeviceId> = std::env::args().skip(1).map(DeviceId::from).collect();
    if addresses.is_empty() {
        queue.send(Command::Bootstrap).await;
    } else {
        for address in addresses {
            queue.send(Command::Connect(address)).await;
        }
    }

    let mut watcher = tokio::spawn(watch_adapter(adapter.clone(), devices, queue.clone()));

    tokio::select! {
        _ = stop_receive.recv() => {
            debug!("Service asked to stop");
        }
        watched = &mut watcher => {
            match watched {
                Ok(Ok(())) => warn!("Bluetooth adapter events stopped streaming"),
                Ok(Err(e)) => warn!("Could not watch the Bluetooth adapter: {e}"),
                Err(e) => warn!("Bluetooth adapter watcher failed: {e}"),
            }
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal; stopping the camera GPS link");
            controller.request_shutdown().await;
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal; stopping the camera GPS link");
            controller.request_shutdown().await;
        }
    }

    watcher.abort();
    queue.close();
    consumer.abort();
    controller.terminate().await;

    if let Some(request) = host.restart_request() {
        if request.should_restart() {
            return Err(anyhow!(
                "camera GPS link terminated while running (always-on devices: {}); exiting for restart",
                request.had_always_on_devices
            ));
        }
    }

    info!("Stopped the camera GPS link");
    Ok(())
}

// Logs (at debug level) the adapter properties relevant to reaching cameras.
async fn log_adapter_info(adapter: &bluer::Adapter) -> Result<()> {
    let mut properties_log = String::new();

    properties_log.push_str("Bluetooth adapter properties:\n");
    properties_log.push_str("{\n");

    properties_log.push_str(&format!("\tName: {}\n", adapter.name()));
    if let Ok(addr) = adapter.address().await {
        properties_log.push_str(&format!("\tAddress: {addr}\n"));
    }
    if let Ok(alias) = adapter.alias().await {
        properties_log.push_str(&format!("\tAlias: {alias}\n"));
    }
    if let Ok(powered) = adapter.is_powered().await {
        properties_log.push_str(&format!("\tPowered: {powered}\n"));
    }
    if let Ok(discovering) = adapter.is_discovering().await {
        properties_log.push_str(&format!("\tDiscovering: {discovering}\n"));
    }
    for address in adapter.device_addresses().await? {
        let device = adapter.device(address)?;
        let paired = device.is_paired().await.unwrap_or(false);
        let connected = device.is_connected().await.unwrap_or(false);
        let name = device.name().await.ok().flatten().unwrap_or_default();
        properties_log.push_str(&format!(
            "\tKnown device: {address} name={name:?} paired={paired} connected={connected}\n"
        ));
    }

    properties_log.push('}');

    debug!("{}", properties_log);
    Ok(())
}
