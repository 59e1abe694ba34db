//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker transports are hidden behind feature flags
//! and exposed only through constructor functions; a constructor whose
//! feature is disabled fails with [`crate::RelayError::TransportDisabled`].
//!
//! Domain code must not depend on transport-specific types.

use std::sync::Arc;

use crate::{Result, TransportConfig, TransportPtr};

mod amqp;
mod memory;
mod pipeline;

#[cfg(feature = "transport_servicebus")]
mod servicebus;

pub use memory::{create_memory_transport, MemoryBroker};
pub use pipeline::{ReceivePipeline, Settlement, StopHandle, StopSignal};

/// Start a RabbitMQ transport consuming `config.queue`.
pub async fn create_lapin_transport(
    config: &TransportConfig,
    pipeline: Arc<ReceivePipeline>,
) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "transport_lapin")]
    {
        amqp::create_lapin_transport(config, pipeline).await
    }

    #[cfg(not(feature = "transport_lapin"))]
    {
        let _ = (config, pipeline);
        Err(crate::RelayError::TransportDisabled("lapin"))
    }
}

/// Start an Azure Service Bus transport consuming `config.queue`.
pub async fn create_service_bus_transport(
    config: &TransportConfig,
    pipeline: Arc<ReceivePipeline>,
) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "transport_servicebus")]
    {
        servicebus::create_transport(config, pipeline).await
    }

    #[cfg(not(feature = "transport_servicebus"))]
    {
        let _ = (config, pipeline);
        Err(crate::RelayError::TransportDisabled("servicebus"))
    }
}
