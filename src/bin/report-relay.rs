//! Report relay service.
//!
//! Consumes `ExecuteReport` requests from the configured bus, renders them
//! through report server URL access and writes artifacts to a directory.
//!
//! Signals:
//! - SIGINT / SIGTERM: drain and stop
//! - SIGUSR1: pause receiving
//! - SIGUSR2: resume receiving
//!
//! Run with: `RUST_LOG=info report-relay --bus-host-uri rabbitmq://localhost ...`

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use report_relay::{
    //
    BusConfiguration,
    ExecuteReportConsumer,
    FileBlobStore,
    ReportRelay,
    UrlAccessRenderer,
    DEFAULT_QUEUE_NAME,
};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "report-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bus host uri: rabbitmq://host[:port][/vhost] or sb://namespace
    #[arg(long, env = "RELAY_BUS_HOST_URI")]
    bus_host_uri: String,

    /// Queue to consume ExecuteReport requests from
    #[arg(long, env = "RELAY_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    queue_name: String,

    /// RabbitMQ user or Service Bus SAS key name
    #[arg(long, env = "RELAY_SECRET_NAME")]
    secret_name: Option<String>,

    /// RabbitMQ password or Service Bus SAS key
    #[arg(long, env = "RELAY_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Report server URL-access endpoint, e.g. http://reports/ReportServer
    #[arg(long, env = "RELAY_REPORT_SERVER_URL")]
    report_server_url: String,

    /// Timeout of one render request
    #[arg(long, env = "RELAY_RENDER_TIMEOUT_SECS", default_value = "300")]
    render_timeout_secs: u64,

    /// Directory rendered artifacts are written to
    #[arg(long, env = "RELAY_BLOB_DIR")]
    blob_dir: PathBuf,

    /// Public URL of the blob directory; file:// URIs are returned without it
    #[arg(long, env = "RELAY_BLOB_BASE_URL")]
    blob_base_url: Option<String>,

    /// How long shutdown waits for in-flight reports
    #[arg(long, env = "RELAY_DRAIN_TIMEOUT_SECS", default_value = "60")]
    drain_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let mut builder = BusConfiguration::builder()
        .host_uri(&args.bus_host_uri)
        .queue_name(&args.queue_name);
    if let Some(name) = &args.secret_name {
        builder = builder.secret_name(name);
    }
    if let Some(secret) = &args.secret {
        builder = builder.secret(secret);
    }
    let config = builder.build()?;

    let renderer = UrlAccessRenderer::new(
        &args.report_server_url,
        Duration::from_secs(args.render_timeout_secs),
    )?;
    let store = FileBlobStore::new(args.blob_dir.clone(), args.blob_base_url.clone());
    let consumer = ExecuteReportConsumer::new(Arc::new(renderer), Arc::new(store));

    let relay = ReportRelay::start(&config, consumer).await?;
    tracing::info!("relay started: {config:?}");

    wait_for_stop(&relay).await?;

    relay
        .shutdown(Duration::from_secs(args.drain_timeout_secs))
        .await?;
    Ok(())
}

/// Serve pause/resume signals until a stop signal arrives.
#[cfg(unix)]
async fn wait_for_stop(relay: &ReportRelay) -> std::io::Result<()> {
    // ---
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sigusr1.recv() => relay.pause(),
            _ = sigusr2.recv() => relay.resume(),
        }
    }

    tracing::info!("stop requested");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop(_relay: &ReportRelay) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("stop requested");
    Ok(())
}
