//! Bus transport selection.
//!
//! Turns a [`BusConfiguration`] into a running transport in two steps:
//!
//! 1. [`plan_transport`] validates the host uri and resolves scheme,
//!    normalized endpoint, credentials and tuning. It is pure; no connection
//!    is attempted, so an invalid scheme fails before any network activity.
//! 2. [`start_bus`] registers the receive gate on a pipeline bound to the
//!    consumer and hands the plan to the matching transport factory.
//!
//! # Examples
//!
//! ```
//! use report_relay::{plan_transport, BusConfiguration, BusScheme};
//!
//! # fn example() -> report_relay::Result<()> {
//! let config = BusConfiguration::builder()
//!     .host_uri("sb://reports-prod")
//!     .secret_name("RootManageSharedAccessKey")
//!     .secret("c2VjcmV0")
//!     .build()?;
//!
//! let plan = plan_transport(&config, 8)?;
//! assert_eq!(plan.scheme, BusScheme::ServiceBus);
//! assert_eq!(plan.endpoint.to_string(), "sb://reports-prod.servicebus.windows.net");
//! assert_eq!(plan.tuning.concurrency_cap, 8);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::{
    //
    create_lapin_transport,
    create_service_bus_transport,
    log_info,
    BusConfiguration,
    BusScheme,
    BusUri,
    Credentials,
    MessageConsumer,
    ReceiveGate,
    ReceivePipeline,
    RelayError,
    Result,
    TransportConfig,
    TransportPtr,
    TransportTuningProfile,
};

/// Scheme of the AMQP uri a RabbitMQ host is rewritten to.
const AMQP_SCHEME: &str = "amqp";
const AMQP_PORT: u16 = 5672;

const RABBITMQ_DEFAULT_USER: &str = "guest";
const RABBITMQ_DEFAULT_PASSWORD: &str = "guest";

/// Host suffix of Azure Service Bus namespaces.
pub const SERVICE_BUS_HOST_SUFFIX: &str = ".servicebus.windows.net";

/// A started bus: the consuming transport and the pipeline it dispatches to.
pub struct StartedBus {
    pub transport: TransportPtr,
    pub pipeline: Arc<ReceivePipeline>,
}

/// Resolve everything needed to start the transport for `config`.
///
/// `processors` feeds the tuning policy; pass
/// [`crate::available_processors`] outside tests.
///
/// # Errors
///
/// - [`RelayError::InvalidScheme`] when the scheme is neither `rabbitmq` nor
///   `sb` (case-insensitive)
/// - [`RelayError::MissingConfig`] when a Service Bus host has no SAS key
///   name or key
pub fn plan_transport(config: &BusConfiguration, processors: usize) -> Result<TransportConfig> {
    // ---
    let host_uri = config.host_uri();
    let scheme = BusScheme::from_uri(host_uri)?;

    let (endpoint, credentials) = match scheme {
        BusScheme::RabbitMq => (rabbitmq_endpoint(host_uri), rabbitmq_credentials(config)),
        BusScheme::ServiceBus => (
            service_bus_endpoint(host_uri),
            service_bus_credentials(config)?,
        ),
    };

    Ok(TransportConfig {
        node_id: format!("report-relay-{}", short_id()),
        scheme,
        endpoint,
        queue: config.queue_name().to_string(),
        credentials,
        tuning: TransportTuningProfile::for_scheme(scheme, processors),
    })
}

/// Bind `consumer`, register `gate` and start consuming.
///
/// The gate is registered before the transport starts, so no delivery can
/// bypass it.
///
/// # Errors
///
/// Configuration errors from [`plan_transport`],
/// [`RelayError::TransportDisabled`] when the selected transport is compiled
/// out, or a transport error if the broker cannot be reached.
pub async fn start_bus<C>(
    config: &BusConfiguration,
    consumer: C,
    gate: Arc<ReceiveGate>,
) -> Result<StartedBus>
where
    C: MessageConsumer,
{
    // ---
    let plan = plan_transport(config, crate::available_processors())?;
    let pipeline = Arc::new(gated_pipeline(consumer, gate));

    log_info!(
        "[{}] starting {} transport for {} on queue {}",
        plan.node_id,
        plan.scheme,
        pipeline.message_type(),
        plan.queue
    );

    let transport = match plan.scheme {
        BusScheme::RabbitMq => create_lapin_transport(&plan, Arc::clone(&pipeline)).await?,
        BusScheme::ServiceBus => {
            create_service_bus_transport(&plan, Arc::clone(&pipeline)).await?
        }
    };

    Ok(StartedBus {
        transport,
        pipeline,
    })
}

/// Pipeline for `consumer` with `gate` as its admission observer.
pub fn gated_pipeline<C>(consumer: C, gate: Arc<ReceiveGate>) -> ReceivePipeline
where
    C: MessageConsumer,
{
    ReceivePipeline::new(consumer).with_observer(gate)
}

fn rabbitmq_endpoint(host_uri: &BusUri) -> BusUri {
    // ---
    BusUri {
        scheme: AMQP_SCHEME.to_string(),
        port: Some(host_uri.port.unwrap_or(AMQP_PORT)),
        ..host_uri.without_query_and_fragment()
    }
}

fn rabbitmq_credentials(config: &BusConfiguration) -> Credentials {
    Credentials {
        name: config
            .secret_name()
            .unwrap_or(RABBITMQ_DEFAULT_USER)
            .to_string(),
        secret: config
            .secret()
            .unwrap_or(RABBITMQ_DEFAULT_PASSWORD)
            .to_string(),
    }
}

fn service_bus_endpoint(host_uri: &BusUri) -> BusUri {
    // ---
    let mut endpoint = host_uri.without_query_and_fragment();
    endpoint.scheme = BusScheme::ServiceBus.token().to_string();

    let has_suffix = endpoint
        .host
        .to_ascii_lowercase()
        .ends_with(SERVICE_BUS_HOST_SUFFIX);
    if !has_suffix {
        endpoint.host.push_str(SERVICE_BUS_HOST_SUFFIX);
    }
    endpoint
}

fn service_bus_credentials(config: &BusConfiguration) -> Result<Credentials> {
    // ---
    let name = config
        .secret_name()
        .ok_or_else(|| RelayError::MissingConfig("Service Bus SAS key name (secret name)".into()))?;
    let secret = config
        .secret()
        .ok_or_else(|| RelayError::MissingConfig("Service Bus SAS key (secret)".into()))?;

    Ok(Credentials {
        name: name.to_string(),
        secret: secret.to_string(),
    })
}

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
