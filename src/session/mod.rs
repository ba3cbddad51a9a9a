//! Session orchestration
//!
//! The controller owns the connection lifecycle and the state machine;
//! `SessionHandle` is the caller-facing surface of an open session.

mod controller;
mod state;

pub use controller::{AudioIo, Session, SessionCallbacks, SessionHandle};
pub use state::SessionState;
