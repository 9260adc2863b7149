//! Defines the error type shared by the connection engine.

use thiserror::Error;

/// Errors surfaced by transports, location providers and the service host.
///
/// None of these cross the command queue as failures of the queue itself; they are logged and
/// turned into a session teardown or a service stop where they occur.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("device {0} is not paired")]
    NotPaired(String),

    #[error("bluetooth radio is off")]
    RadioOff,

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("characteristic {0} not present on device")]
    MissingCharacteristic(uuid::Uuid),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not promote service to foreground: {0}")]
    ForegroundDenied(String),

    #[error("no location provider available")]
    NoLocationProvider,

    #[error("location provider error: {0}")]
    Provider(String),
}

impl From<bluer::Error> for LinkError {
    fn from(e: bluer::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}
