//! Defines the service lifecycle: the serialized command queue and the start/stop decisions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::devices::DeviceRegistry;
use crate::env::Settings;
use crate::error::LinkError;
use crate::gatt::Transport;
use crate::registry::{DeviceId, DeviceSession};
use crate::session::{notice_for, run_session, SessionContext, SessionMachine};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownTarget {
    All,
    Device(DeviceId),
}

/// Requests accepted by the lifecycle controller, processed strictly one at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect(DeviceId),
    RequestShutdown(ShutdownTarget),
    /// Start without a specific device; keeps only the always-on devices.
    Bootstrap,
    RadioStateChanged { enabled: bool },
}

/// What the persistent status notification should show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    Standby,
    Transmitting { count: usize },
}

/// Sent when the service dies without having been asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartRequest {
    pub was_running: bool,
    pub had_always_on_devices: bool,
}

impl RestartRequest {
    pub fn should_restart(&self) -> bool {
        self.was_running
    }
}

/// The process hosting the service.
pub trait ServiceHost: Send + Sync {
    /// Enters the persistent execution mode required before connecting.
    fn promote_to_foreground(&self) -> Result<(), LinkError>;

    fn stop_service(&self);

    fn request_restart(&self, request: RestartRequest);

    fn update_notification(&self, notice: Notice);
}

/// Sending half of the controller's command queue.
#[derive(Clone)]
pub struct CommandQueue {
    sender: Sender<Command>,
}

impl CommandQueue {
    pub async fn send(&self, command: Command) {
        if self.sender.send(command).await.is_err() {
            warn!("Command queue is closed; dropping command");
        }
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

pub struct LifecycleController {
    context: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    devices: Arc<dyn DeviceRegistry>,
    requested_mtu: u16,
    shutdown_debounce: Duration,
    running: AtomicBool,
    radio_enabled: AtomicBool,
    commands: Mutex<()>,
}

impl LifecycleController {
    pub fn new(
        context: Arc<SessionContext>,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceRegistry>,
        settings: &Settings,
        radio_enabled: bool,
    ) -> Self {
        LifecycleController {
            context,
            transport,
            devices,
            requested_mtu: settings.requested_mtu,
            shutdown_debounce: settings.shutdown_debounce(),
            running: AtomicBool::new(true),
            radio_enabled: AtomicBool::new(radio_enabled),
            commands: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the single consumer of the command queue.
    pub fn spawn(self: Arc<Self>) -> (CommandQueue, JoinHandle<()>) {
        let (sender, receiver) = async_channel::unbounded();
        let task = tokio::spawn(self.consume(receiver));
        (CommandQueue { sender }, task)
    }

    async fn consume(self: Arc<Self>, receiver: Receiver<Command>) {
        while let Ok(command) = receiver.recv().await {
            self.handle(command).await;
        }
        debug!("Command queue closed");
    }

    pub async fn handle(&self, command: Command) {
        let _guard = self.commands.lock().await;
        debug!("Handling {command:?}");

        match command {
            Command::Connect(id) => match self.admit() {
                Ok(()) => self.connect(&id),
                Err(e) => debug!("Not connecting {id}: {e}"),
            },
            Command::Bootstrap => match self.admit() {
                Ok(()) => self.bootstrap(),
                Err(e) => debug!("Not bootstrapping: {e}"),
            },
            Command::RequestShutdown(ShutdownTarget::All) => self.shutdown_all(),
            Command::RequestShutdown(ShutdownTarget::Device(id)) => {
                info!("Shutdown requested for device {id}");
                tokio::time::sleep(self.shutdown_debounce).await;
                if self.context.registry.connected_sessions().is_empty() {
                    debug!("No connected cameras remaining, shutting down service");
                    self.stop_now();
                }
            }
            Command::RadioStateChanged { enabled } => {
                self.radio_enabled.store(enabled, Ordering::SeqCst);
                if !enabled {
                    warn!("{}, will shutdown service", LinkError::RadioOff);
                    self.stop_now();
                }
            }
        }
    }

    // Radio and foreground checks every connecting command must pass. Failing either stops.
    fn admit(&self) -> Result<(), LinkError> {
        self.ensure_radio()?;
        self.promote()
    }

    fn ensure_radio(&self) -> Result<(), LinkError> {
        if self.radio_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        warn!("{}, will shutdown service", LinkError::RadioOff);
        if let Err(e) = self.context.host.promote_to_foreground() {
            debug!("Promotion before shutdown failed: {e}");
        }
        self.stop_now();
        Err(LinkError::RadioOff)
    }

    fn promote(&self) -> Result<(), LinkError> {
        match self.context.host.promote_to_foreground() {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                self.context.host.update_notification(notice_for(&self.context.status));
                Ok(())
            }
            Err(e) => {
                error!("Failed to enter foreground mode: {e}");
                self.stop_now();
                Err(e)
            }
        }
    }

    fn bootstrap(&self) {
        if self.devices.count_always_on_enabled() == 0 {
            info!("No always-on devices configured, shutting down service");
            self.stop_now();
            return;
        }

        for device in self.devices.list_always_on_devices() {
            if self.devices.is_always_on_enabled(&device.address) {
                info!("Connecting always-on device {}", device.address);
                self.connect(&device.address);
            }
        }
    }

    fn connect(&self, id: &DeviceId) {
        if !self.devices.is_enabled(id) {
            info!("Device {id} is disabled; not connecting");
            return;
        }
        if self.context.registry.contains(id) {
            debug!("Device {id} already has a session; ignoring connect");
            return;
        }

        let (events, receiver) = async_channel::unbounded();
        let link = match self.transport.connect(id, events) {
            Ok(link) => link,
            Err(e) => {
                error!("Could not connect to {id}: {e}");
                return;
            }
        };

        if let Err(rejected) = self
            .context
            .registry
            .add(DeviceSession::new(id.clone(), link.clone()))
        {
            rejected.close();
            return;
        }
        self.context.status.set(id, false);

        let machine = SessionMachine::new(id.clone(), self.requested_mtu);
        let worker = tokio::spawn(run_session(self.context.clone(), machine, link, receiver));
        self.context
            .registry
            .update(id, |session| session.attach_worker(worker.abort_handle()));
        info!("Connecting to device {id}");
    }

    fn shutdown_all(&self) {
        if self.devices.count_always_on_enabled() == 0 {
            info!("No always-on devices found, disconnecting all cameras and shutting down service");
            self.stop_now();
        } else {
            info!("At least one always-on device found, not shutting down service");
        }
    }

    fn disconnect_all(&self) {
        for session in self.context.registry.clear_all() {
            info!("Disconnecting device {}", session.device_id);
            session.close();
        }
        self.context.status.clear();
        self.context.coordinator.stop();
    }

    /// Tears everything down and stops the service, after any command in progress finishes.
    pub async fn request_shutdown(&self) {
        let _guard = self.commands.lock().await;
        self.stop_now();
    }

    // Caller holds `commands`. Only the first call after running stops the service.
    fn stop_now(&self) {
        self.disconnect_all();
        self.context.host.update_notification(notice_for(&self.context.status));
        if self.running.swap(false, Ordering::SeqCst) {
            self.context.host.stop_service();
        }
    }

    /// Called when the process goes away. If nobody asked it to stop, ask to be restarted.
    pub async fn terminate(&self) {
        let _guard = self.commands.lock().await;
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.disconnect_all();
        if was_running {
            let request = RestartRequest {
                was_running,
                had_always_on_devices: self.devices.count_always_on_enabled() > 0,
            };
            warn!("Service terminated while running; requesting restart: {request:?}");
            self.context.host.request_restart(request);
        }
    }
}
