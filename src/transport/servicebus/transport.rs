use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::client::{LockedMessage, ServiceBusClient};
use crate::transport::pipeline::{ReceivePipeline, StopHandle, StopSignal};
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    Disposition,
    Envelope,
    ReceiveContext,
    Result,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
    SERVICE_BUS_LOCK_DURATION,
};

/// Long-poll timeout of one receive request.
const RECEIVE_POLL: Duration = Duration::from_secs(30);

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

type TaskList = Mutex<Vec<JoinHandle<()>>>;

/// Peek-lock queue operations the receive workers use.
#[async_trait::async_trait]
trait LockingQueue: Send + Sync {
    // ---
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<LockedMessage>>;
    async fn send(&self, queue: &str, env: &Envelope) -> Result<()>;
    async fn complete(&self, message: &LockedMessage) -> Result<()>;
    async fn abandon(&self, message: &LockedMessage) -> Result<()>;
    async fn renew_lock(&self, message: &LockedMessage) -> Result<()>;
}

#[async_trait::async_trait]
impl LockingQueue for ServiceBusClient {
    // ---
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<LockedMessage>> {
        ServiceBusClient::receive(self, queue, timeout).await
    }

    async fn send(&self, queue: &str, env: &Envelope) -> Result<()> {
        ServiceBusClient::send(self, queue, env).await
    }

    async fn complete(&self, message: &LockedMessage) -> Result<()> {
        ServiceBusClient::complete(self, message).await
    }

    async fn abandon(&self, message: &LockedMessage) -> Result<()> {
        ServiceBusClient::abandon(self, message).await
    }

    async fn renew_lock(&self, message: &LockedMessage) -> Result<()> {
        ServiceBusClient::renew_lock(self, message).await
    }
}

/// Azure Service Bus transport over the REST API.
///
/// Runs `concurrency_cap` receive workers, each holding at most one
/// peek-locked message. While a message is being processed (or is parked
/// behind a closed gate) its lock is renewed every half lock duration, up to
/// the maximum auto-renew duration.
struct ServiceBusTransport {
    // ---
    base: TransportBase,
    client: Arc<ServiceBusClient>,
    stop: StopHandle,
    abort: StopHandle,
    workers: TaskList,
}

impl ServiceBusTransport {
    async fn join_workers(&self) {
        // ---
        let mut workers = self.workers.lock().await;
        while let Some(handle) = workers.pop() {
            let _ = handle.await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for ServiceBusTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, address: &Address, env: Envelope) -> Result<()> {
        self.client.send(address.queue_name(), &env).await
    }

    /// Stop the workers. A receive already polling is allowed to finish and
    /// whatever it locked is abandoned.
    async fn stop(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.join_workers().await;

        log_info!("[{}] service bus transport stopped", self.transport_id());
        Ok(())
    }

    /// Stop the workers without waiting for deliveries being processed.
    /// Their messages are abandoned; open receive polls are dropped and
    /// anything they lock is released when the lock expires.
    async fn abort(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.abort.stop();
        self.join_workers().await;

        log_info!("[{}] service bus transport aborted", self.transport_id());
        Ok(())
    }
}

struct Worker {
    transport_id: String,
    queue: Arc<str>,
    client: Arc<dyn LockingQueue>,
    pipeline: Arc<ReceivePipeline>,
    lock_duration: Duration,
    max_auto_renew: Duration,
    stop: StopSignal,
    abort: StopSignal,
}

impl Worker {
    async fn run(mut self) {
        // ---
        while !self.stop.is_stopped() {
            // A poll in progress may already hold a lock, so only an abort
            // cuts it short.
            let received = tokio::select! {
                biased;
                _ = self.abort.stopped() => break,
                received = self.client.receive(&self.queue, RECEIVE_POLL) => received,
            };

            match received {
                Ok(Some(message)) if self.stop.is_stopped() => {
                    log_debug!("[{}] stopping, abandoning message just received", self.transport_id);
                    if let Err(e) = self.client.abandon(&message).await {
                        log_warn!("[{}] failed to abandon message: {e}", self.transport_id);
                    }
                }
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => {}
                Err(e) => {
                    log_warn!("[{}] receive from {} failed: {e}", self.transport_id, self.queue);
                    tokio::select! {
                        biased;
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        log_debug!("[{}] receive worker on {} stopped", self.transport_id, self.queue);
    }

    async fn handle(&mut self, message: LockedMessage) {
        // ---
        let message = Arc::new(message);
        let renewer = tokio::spawn(renew_lock(
            self.transport_id.clone(),
            Arc::clone(&self.client),
            Arc::clone(&message),
            self.lock_duration,
            self.max_auto_renew,
        ));

        let ctx = ReceiveContext::new(
            Arc::clone(&self.queue),
            message.envelope(),
            message.delivery_count(),
        );

        let settlement = tokio::select! {
            biased;
            settlement = self.pipeline.dispatch(ctx, &mut self.stop) => Some(settlement),
            _ = self.abort.stopped() => None,
        };

        let settled = match settlement.as_ref().map(|s| &s.disposition) {
            Some(Disposition::Complete { reply }) => self.complete(&message, reply.as_ref()).await,
            Some(Disposition::Requeue) => self.client.abandon(&message).await,
            Some(Disposition::Discard) => self.client.complete(&message).await,
            None => {
                log_warn!(
                    "[{}] delivery on {} cancelled, abandoning message",
                    self.transport_id,
                    self.queue
                );
                self.client.abandon(&message).await
            }
        };
        renewer.abort();

        if let Err(e) = settled {
            log_error!("[{}] failed to settle message: {e}", self.transport_id);
        }
    }

    async fn complete(
        &self,
        message: &LockedMessage,
        reply: Option<&(Address, Envelope)>,
    ) -> Result<()> {
        // ---
        if let Some((address, env)) = reply {
            if let Err(e) = self.client.send(address.queue_name(), env).await {
                // Redelivery is the only retry.
                log_warn!(
                    "[{}] reply to {address} not sent, abandoning request: {e}",
                    self.transport_id
                );
                return self.client.abandon(message).await;
            }
        }
        self.client.complete(message).await
    }
}

async fn renew_lock(
    transport_id: String,
    client: Arc<dyn LockingQueue>,
    message: Arc<LockedMessage>,
    lock_duration: Duration,
    max_auto_renew: Duration,
) {
    // ---
    let started = Instant::now();
    let interval = lock_duration / 2;

    loop {
        tokio::time::sleep(interval).await;
        if started.elapsed() + interval > max_auto_renew {
            log_warn!("[{transport_id}] lock auto-renew limit reached; lock will expire");
            return;
        }
        if let Err(e) = client.renew_lock(&message).await {
            log_warn!("[{transport_id}] lock renewal failed: {e}");
            return;
        }
        log_debug!("[{transport_id}] renewed message lock");
    }
}

/// Creates a Service Bus transport, provisions its queue and starts the
/// receive workers.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built or the queue cannot
/// be created.
pub async fn create_transport(
    config: &TransportConfig,
    pipeline: Arc<ReceivePipeline>,
) -> Result<TransportPtr> {
    // ---
    let tuning = &config.tuning;
    let client = Arc::new(ServiceBusClient::new(
        &config.endpoint,
        config.credentials.clone(),
        RECEIVE_POLL,
    )?);

    log_info!("Connecting to Service Bus namespace: {}", config.endpoint);
    client.ensure_queue(&config.queue, tuning).await?;

    let lock_duration = tuning.lock_duration.unwrap_or(SERVICE_BUS_LOCK_DURATION);
    let max_auto_renew = tuning.max_auto_renew_duration.unwrap_or(lock_duration);
    let queue: Arc<str> = Arc::from(config.queue.as_str());
    let (stop, stop_signal) = StopHandle::pair();
    let (abort, abort_signal) = StopHandle::pair();

    let workers = (0..tuning.concurrency_cap)
        .map(|_| {
            let worker = Worker {
                transport_id: config.node_id.clone(),
                queue: Arc::clone(&queue),
                client: Arc::clone(&client) as Arc<dyn LockingQueue>,
                pipeline: Arc::clone(&pipeline),
                lock_duration,
                max_auto_renew,
                stop: stop_signal.clone(),
                abort: abort_signal.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect();

    log_info!(
        "[{}] Consuming {} with {} receivers",
        config.node_id,
        config.queue,
        tuning.concurrency_cap
    );

    Ok(Arc::new(ServiceBusTransport {
        base: TransportBase::from(config),
        client,
        stop,
        abort,
        workers: Mutex::new(workers),
    }))
}
