//! Report relay: bus admission and lifecycle control.
//!
//! This library consumes `ExecuteReport` requests from RabbitMQ or Azure
//! Service Bus, renders them through a report server, stores the artifact and
//! replies with its URI. The reusable part is the control layer around the
//! bus:
//!
//! - transport selection from a host uri scheme (`rabbitmq://`, `sb://`)
//! - per-transport flow-control tuning so competing instances share a backlog
//! - a receive gate that pauses and drains consumption without losing
//!   admitted work or acknowledging anything early
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use report_relay::{
//!     BusConfiguration, ExecuteReportConsumer, FileBlobStore, ReportRelay, UrlAccessRenderer,
//! };
//!
//! # async fn example() -> report_relay::Result<()> {
//! let config = BusConfiguration::builder()
//!     .host_uri("rabbitmq://localhost")
//!     .build()?;
//!
//! let renderer = UrlAccessRenderer::new("http://reports/ReportServer", Duration::from_secs(300))?;
//! let store = FileBlobStore::new("/var/lib/report-relay", None);
//! let consumer = ExecuteReportConsumer::new(Arc::new(renderer), Arc::new(store));
//!
//! let relay = ReportRelay::start(&config, consumer).await?;
//! relay.pause();
//! relay.resume();
//! relay.shutdown(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod bus_config;
mod bus_registration;
mod consumer;
mod domain;
mod encoding;
mod error;
mod gate;
mod macros;
mod protocol;
mod relay;
mod transport;
mod tuning;

pub mod services;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use error::{RelayError, Result};

pub use bus_config::{
    //
    BusConfiguration,
    BusConfigurationBuilder,
    BusScheme,
    BusUri,
    DEFAULT_QUEUE_NAME,
    RABBITMQ_SCHEME,
    SERVICE_BUS_SCHEME,
};

pub use bus_registration::{
    //
    gated_pipeline,
    plan_transport,
    start_bus,
    StartedBus,
    SERVICE_BUS_HOST_SUFFIX,
};

pub use tuning::{
    //
    available_processors,
    concurrency_cap,
    TransportTuningProfile,
    MAX_CONCURRENCY,
    MIN_MAX_DELIVERY_COUNT,
    SERVICE_BUS_LOCK_DURATION,
    SERVICE_BUS_MAX_AUTO_RENEW,
    SERVICE_BUS_MESSAGE_TTL,
};

pub use domain::{
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

pub use gate::{AsyncGate, ReceiveGate};

pub use protocol::{
    //
    ExecuteReport,
    ReportCredential,
    ReportExecuted,
    ReportFormat,
    ReportParameter,
};

pub use consumer::{ExecuteReportConsumer, MessageConsumer};

pub use services::{BlobStore, FileBlobStore, RenderingService, UrlAccessRenderer};

pub use transport::{
    //
    create_lapin_transport,
    create_memory_transport,
    create_service_bus_transport,
    MemoryBroker,
    ReceivePipeline,
    Settlement,
    StopHandle,
    StopSignal,
};

pub use relay::ReportRelay;
