//! Admission control for message consumption.
//!
//! - [`AsyncGate`] - lock-free broadcast barrier
//! - [`ReceiveGate`] - receive-pipeline observer built on it

mod async_gate;
mod receive_gate;

pub use async_gate::AsyncGate;
pub use receive_gate::ReceiveGate;
