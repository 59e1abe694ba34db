//! RabbitMQ (AMQP 0-9-1) transport, backed by `lapin`.
//!
//! Compiled only with the `transport_lapin` feature; without it
//! [`crate::create_lapin_transport`] reports the transport as disabled.

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub(super) use lapin::create_transport as create_lapin_transport;
