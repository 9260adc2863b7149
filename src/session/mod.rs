//! Per-device negotiation and the task that drives it.

mod machine;
mod worker;

pub use machine::{Action, SessionMachine};
pub use worker::{notice_for, run_session, SessionContext};
