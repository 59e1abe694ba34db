//! Transport-independent vocabulary.
//!
//! Envelopes, addresses, the receive context and observer hooks, and the
//! `Transport` trait every bus binding implements. Nothing here knows about
//! AMQP, Service Bus or HTTP.
//!
//! Import these through the crate root, not from the inner file.

mod transport;

pub use transport::{
    //
    Address,
    Credentials,
    Disposition,
    Envelope,
    ReceiveContext,
    ReceiveObserver,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
    JSON_CONTENT_TYPE,
};
