// tests/relay_memory.rs

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};

use report_relay::services::{RenderRequest, RenderedArtifact};
use report_relay::{
    // ---
    Address,
    Envelope,
    ExecuteReport,
    ExecuteReportConsumer,
    FileBlobStore,
    MemoryBroker,
    RelayError,
    RenderingService,
    ReportCredential,
    ReportExecuted,
    ReportFormat,
    ReportParameter,
    ReportRelay,
    Result,
    TransportTuningProfile,
};

const QUEUE: &str = "execute-report";
const REPLIES: &str = "client-replies";
const WAIT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

/// Renderer that blocks until a permit is available.
struct StubRenderer {
    permits: Arc<Semaphore>,
    started: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl RenderingService for StubRenderer {
    async fn execute(&self, request: RenderRequest<'_>) -> Result<RenderedArtifact> {
        // ---
        self.started.fetch_add(1, Ordering::SeqCst);

        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RelayError::Rendering(e.to_string()))?;
        permit.forget();

        Ok(RenderedArtifact {
            bytes: Bytes::from(format!("report {}", request.path)),
            mime_type: "application/pdf".into(),
            extension: request.format.extension().into(),
            warnings: Vec::new(),
        })
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    relay: Arc<ReportRelay>,
    permits: Arc<Semaphore>,
    started: Arc<AtomicUsize>,
    _blobs: tempfile::TempDir,
}

impl Harness {
    async fn start(broker: Arc<MemoryBroker>, processors: usize, permits: usize) -> Self {
        // ---
        let blobs = tempfile::tempdir().expect("failed to create blob dir");
        let permits = Arc::new(Semaphore::new(permits));
        let started = Arc::new(AtomicUsize::new(0));

        let renderer = StubRenderer {
            permits: permits.clone(),
            started: started.clone(),
        };
        let store = FileBlobStore::new(blobs.path(), Some("https://blobs.example".into()));
        let consumer = ExecuteReportConsumer::new(Arc::new(renderer), Arc::new(store));

        let relay = ReportRelay::start_in_memory(
            broker.clone(),
            QUEUE,
            TransportTuningProfile::rabbitmq(processors),
            consumer,
        )
        .await
        .expect("failed to start relay");

        Self {
            broker,
            relay: Arc::new(relay),
            permits,
            started,
            _blobs: blobs,
        }
    }

    async fn wait_started(&self, n: usize) {
        // ---
        timeout(WAIT, async {
            while self.started.load(Ordering::SeqCst) < n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("renders did not start");
    }
}

fn request(correlation_id: &str) -> Envelope {
    // ---
    let message = ExecuteReport {
        report_path: "/Sales/Quarterly".into(),
        credential: ReportCredential {
            user_name: "svc".into(),
            password: "pw".into(),
            domain: None,
        },
        parameters: vec![ReportParameter::new("Year", "2026")],
        parameter_language: None,
        format: ReportFormat::Pdf,
    };
    let payload = serde_json::to_vec(&message).expect("serialize request");

    Envelope::request(
        Bytes::from(payload),
        Arc::from(correlation_id),
        Address::from(REPLIES),
    )
}

async fn send(broker: &MemoryBroker, env: Envelope) {
    broker.publish(&Address::from(QUEUE), env).await;
}

async fn next_reply(broker: &MemoryBroker) -> (Envelope, ReportExecuted) {
    // ---
    let env = timeout(WAIT, broker.receive(REPLIES))
        .await
        .expect("timed out waiting for reply");
    let reply = serde_json::from_slice(&env.payload).expect("reply is not ReportExecuted");
    (env, reply)
}

#[tokio::test]
async fn test_request_gets_correlated_reply() {
    // ---
    init_logging();

    // ---
    // Arrange
    // ---
    let h = Harness::start(MemoryBroker::new(), 2, 100).await;

    // ---
    // Act
    // ---
    send(&h.broker, request("corr-1")).await;

    // ---
    // Assert
    // ---
    let (env, reply) = next_reply(&h.broker).await;
    assert_eq!(env.correlation_id.as_deref(), Some("corr-1"));
    assert!(reply.succeeded());
    assert!(reply.uri.unwrap().starts_with("https://blobs.example/"));
    assert_eq!(reply.file_extension.as_deref(), Some("pdf"));
    assert_eq!(reply.length, "report /Sales/Quarterly".len() as u64);

    h.relay.shutdown(WAIT).await.expect("shutdown failed");
}

#[tokio::test]
async fn test_paused_relay_holds_requests_until_resumed() {
    // ---
    init_logging();

    let h = Harness::start(MemoryBroker::new(), 2, 100).await;

    h.relay.pause();
    assert!(h.relay.is_paused());

    send(&h.broker, request("held")).await;
    sleep(SETTLE).await;

    assert_eq!(h.started.load(Ordering::SeqCst), 0);
    assert!(h.broker.try_receive(REPLIES).await.is_none());
    assert_eq!(h.relay.in_flight(), 0);

    h.relay.resume();

    let (env, reply) = next_reply(&h.broker).await;
    assert_eq!(env.correlation_id.as_deref(), Some("held"));
    assert!(reply.succeeded());

    h.relay.shutdown(WAIT).await.expect("shutdown failed");
}

#[tokio::test]
async fn test_pause_does_not_affect_admitted_work() {
    // ---
    init_logging();

    let h = Harness::start(MemoryBroker::new(), 2, 0).await;

    send(&h.broker, request("admitted")).await;
    h.wait_started(1).await;

    h.relay.pause();
    h.permits.add_permits(1);

    let (env, _) = next_reply(&h.broker).await;
    assert_eq!(env.correlation_id.as_deref(), Some("admitted"));

    h.relay.shutdown(WAIT).await.expect("shutdown failed");
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_report() {
    // ---
    init_logging();

    let h = Harness::start(MemoryBroker::new(), 2, 0).await;

    send(&h.broker, request("slow")).await;
    h.wait_started(1).await;
    assert_eq!(h.relay.in_flight(), 1);

    let shutdown = {
        let relay = h.relay.clone();
        tokio::spawn(async move { relay.shutdown(WAIT).await })
    };

    sleep(SETTLE).await;
    assert!(!shutdown.is_finished(), "shutdown did not wait for in-flight work");

    h.permits.add_permits(1);

    timeout(WAIT, shutdown)
        .await
        .expect("shutdown timed out")
        .expect("shutdown task panicked")
        .expect("shutdown failed");

    assert_eq!(h.relay.in_flight(), 0);
    let (env, _) = next_reply(&h.broker).await;
    assert_eq!(env.correlation_id.as_deref(), Some("slow"));
}

#[tokio::test]
async fn test_shutdown_gives_up_on_stuck_report_after_drain_timeout() {
    // ---
    init_logging();

    // ---
    // Arrange: a render that never finishes
    // ---
    let h = Harness::start(MemoryBroker::new(), 2, 0).await;

    send(&h.broker, request("stuck")).await;
    h.wait_started(1).await;
    assert_eq!(h.relay.in_flight(), 1);

    // ---
    // Act
    // ---
    timeout(WAIT, h.relay.shutdown(Duration::from_millis(100)))
        .await
        .expect("shutdown hung on a stuck render")
        .expect("shutdown failed");

    // ---
    // Assert: the request is back on the queue, unanswered
    // ---
    assert_eq!(h.relay.in_flight(), 0);
    assert!(h.broker.try_receive(REPLIES).await.is_none());

    let returned = h.broker.try_receive(QUEUE).await.expect("request lost");
    assert_eq!(returned.correlation_id.as_deref(), Some("stuck"));
}

#[tokio::test]
async fn test_shutdown_while_paused_returns_request_to_queue() {
    // ---
    init_logging();

    let h = Harness::start(MemoryBroker::new(), 2, 100).await;

    h.relay.pause();
    send(&h.broker, request("parked")).await;
    sleep(SETTLE).await;

    // A worker holds the delivery behind the gate.
    assert_eq!(h.broker.depth(QUEUE).await, 0);

    timeout(WAIT, h.relay.shutdown(WAIT))
        .await
        .expect("shutdown timed out")
        .expect("shutdown failed");

    assert_eq!(h.broker.depth(QUEUE).await, 1);
    assert_eq!(h.started.load(Ordering::SeqCst), 0);
    assert!(h.broker.try_receive(REPLIES).await.is_none());

    let parked = h.broker.try_receive(QUEUE).await.expect("request lost");
    assert_eq!(parked.correlation_id.as_deref(), Some("parked"));
}

#[tokio::test]
async fn test_undecodable_request_is_discarded() {
    // ---
    init_logging();

    let h = Harness::start(MemoryBroker::new(), 1, 100).await;

    let garbage = Envelope::request(
        Bytes::from_static(b"not json"),
        Arc::from("garbage"),
        Address::from(REPLIES),
    );
    send(&h.broker, garbage).await;
    send(&h.broker, request("valid")).await;

    let (env, _) = next_reply(&h.broker).await;
    assert_eq!(env.correlation_id.as_deref(), Some("valid"));

    sleep(SETTLE).await;
    assert!(h.broker.try_receive(REPLIES).await.is_none());
    assert_eq!(h.broker.depth(QUEUE).await, 0);

    h.relay.shutdown(WAIT).await.expect("shutdown failed");
}

#[tokio::test]
async fn test_competing_relays_consume_each_request_once() {
    // ---
    init_logging();

    const REQUESTS: usize = 12;

    let broker = MemoryBroker::new();
    let a = Harness::start(broker.clone(), 1, 100).await;
    let b = Harness::start(broker.clone(), 1, 100).await;

    for i in 0..REQUESTS {
        send(&broker, request(&format!("req-{i}"))).await;
    }

    let mut seen = HashSet::new();
    for _ in 0..REQUESTS {
        let (env, reply) = next_reply(&broker).await;
        assert!(reply.succeeded());
        let id = env.correlation_id.expect("reply without correlation id");
        assert!(seen.insert(id.to_string()), "duplicate reply for {id}");
    }

    let renders = a.started.load(Ordering::SeqCst) + b.started.load(Ordering::SeqCst);
    assert_eq!(renders, REQUESTS);
    assert_eq!(broker.depth(QUEUE).await, 0);

    a.relay.shutdown(WAIT).await.expect("shutdown failed");
    b.relay.shutdown(WAIT).await.expect("shutdown failed");
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
