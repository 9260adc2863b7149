use std::collections::VecDeque;
use std::sync::Arc;

use async_channel::Receiver;
use log::{debug, info, warn};

use super::machine::{Action, SessionMachine};
use crate::gatt::{GattEvent, GattLink, GattStatus, GattTable};
use crate::lifecycle::{Notice, ServiceHost};
use crate::location::LocationCoordinator;
use crate::protocol::LOCATION_CHAR_UUID;
use crate::registry::{ConnectionRegistry, DeviceId};
use crate::status::TransmissionStatus;

/// MTU assumed when a negotiation request could not be issued.
const DEFAULT_ATT_MTU: u16 = 23;

/// Shared components every session task reports to.
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub coordinator: Arc<LocationCoordinator>,
    pub status: TransmissionStatus,
    pub host: Arc<dyn ServiceHost>,
}

impl SessionContext {
    fn publish_notice(&self) {
        self.host.update_notification(notice_for(&self.status));
    }
}

pub fn notice_for(status: &TransmissionStatus) -> Notice {
    let count = status.snapshot().values().filter(|transmitting| **transmitting).count();
    if count == 0 {
        Notice::Standby
    } else {
        Notice::Transmitting { count }
    }
}

/// Consumes hardware events for one device until the session is torn down, removed from the
/// registry by someone else, or the event stream ends.
pub async fn run_session(
    context: Arc<SessionContext>,
    mut machine: SessionMachine,
    link: Arc<dyn GattLink>,
    events: Receiver<GattEvent>,
) {
    let id = machine.device_id().clone();
    debug!("Session task for {id} started");

    let mut pending = VecDeque::new();
    while let Ok(event) = events.recv().await {
        pending.push_back(event);

        while let Some(event) = pending.pop_front() {
            record_write_result(&context.registry, &id, &event);

            let actions = machine.handle(&event);
            let mirrored = context.registry.update(&id, |session| {
                session.state = machine.state();
                session.location_config = machine.config();
                session.write_capability = machine.write_capability();
            });
            if !mirrored {
                debug!("Session {id} is no longer registered; stopping its task");
                return;
            }

            for action in actions {
                match perform(&context, &id, link.as_ref(), action) {
                    Step::Continue => {}
                    Step::Synthesized(event) => pending.push_back(event),
                    Step::Finished => return,
                }
            }
        }
    }
    debug!("Event stream for {id} closed");
}

enum Step {
    Continue,
    Synthesized(GattEvent),
    Finished,
}

fn perform(context: &SessionContext, id: &DeviceId, link: &dyn GattLink, action: Action) -> Step {
    match action {
        Action::RequestMtu(mtu) => match link.request_mtu(mtu) {
            Ok(()) => Step::Continue,
            Err(e) => {
                warn!("Could not request MTU {mtu} on {id}: {e}");
                Step::Synthesized(GattEvent::MtuChanged {
                    mtu: DEFAULT_ATT_MTU,
                    status: GattStatus::GATT_ERROR,
                })
            }
        },
        Action::DiscoverServices => match link.discover_services() {
            Ok(()) => Step::Continue,
            Err(e) => {
                warn!("Could not start service discovery on {id}: {e}");
                Step::Synthesized(GattEvent::ServicesDiscovered {
                    status: GattStatus::GATT_ERROR,
                    table: GattTable::new(),
                })
            }
        },
        Action::Read(characteristic) => match link.read(characteristic) {
            Ok(()) => Step::Continue,
            Err(e) => {
                warn!("Could not read {} on {id}: {e}", characteristic.uuid);
                Step::Synthesized(GattEvent::CharacteristicRead {
                    uuid: characteristic.uuid,
                    status: GattStatus::GATT_ERROR,
                    value: vec![],
                })
            }
        },
        Action::Write(characteristic, value) => match link.write(characteristic, value) {
            Ok(()) => Step::Continue,
            Err(e) => {
                warn!("Could not write {} on {id}: {e}", characteristic.uuid);
                Step::Synthesized(GattEvent::CharacteristicWritten {
                    uuid: characteristic.uuid,
                    status: GattStatus::GATT_ERROR,
                })
            }
        },
        Action::StartTransmitting => {
            info!("Device {id} is ready to receive location");
            context.status.set(id, true);
            context.coordinator.sync();
            context.publish_notice();
            Step::Continue
        }
        Action::Pause => {
            context.status.set(id, false);
            context.coordinator.sync();
            context.publish_notice();
            Step::Continue
        }
        Action::Teardown => {
            info!("Tearing down session for {id}");
            context.registry.remove(id);
            link.close();
            context.status.remove(id);
            context.coordinator.sync();
            context.publish_notice();
            Step::Finished
        }
    }
}

fn record_write_result(registry: &ConnectionRegistry, id: &DeviceId, event: &GattEvent) {
    let GattEvent::CharacteristicWritten { uuid, status } = event else {
        return;
    };
    if status.is_success() {
        if *uuid == LOCATION_CHAR_UUID {
            registry.update(id, |session| session.consecutive_write_errors = 0);
        }
        return;
    }

    registry.update(id, |session| session.consecutive_write_errors += 1);
    if let Some(session) = registry.get(id) {
        warn!(
            "Write to {uuid} on {id} failed with {status:?} ({} consecutive)",
            session.consecutive_write_errors
        );
    }
}
