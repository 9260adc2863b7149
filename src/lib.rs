//! Keeps bonded Sony cameras supplied with GPS fixes and the current time over BLE.

pub mod bluez;
pub mod devices;
pub mod env;
pub mod error;
pub mod gatt;
pub mod lifecycle;
pub mod location;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;
