//! Azure Service Bus transport.
//!
//! Talks to the namespace through the Service Bus REST API with SAS
//! authentication, using peek-lock receives:
//!
//! - `Complete`: send the reply, then delete the locked message
//! - `Requeue`: abandon (unlock) the message for redelivery
//! - `Discard`: delete the locked message without dead-lettering
//!
//! Redelivery counts against the queue's max delivery count, which the
//! tuning policy keeps above the concurrency cap.

mod client;
mod sas;
mod transport;

pub use transport::create_transport;
