//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Queues are point-to-point: each message goes to exactly one of the
//!   competing workers consuming the queue.
//! - A transport runs `concurrency_cap` workers; a worker takes a message only
//!   when it is idle, so nothing is prefetched beyond the cap.
//! - `Requeue` puts the message back at the head of its queue with its
//!   delivery count incremented; `Discard` drops it; `Complete` publishes the
//!   reply before the message is considered settled.
//! - Aborting cancels deliveries still being processed and requeues them the
//!   same way, as a broker does when a consumer's connection drops.
//! - Nothing survives the process, and nothing is dropped by timing or
//!   scheduling.
//!
//! ## Non-Goals
//!
//! This transport does not emulate broker failure modes, lock expiry or
//! persistence. It exists to provide a deterministic baseline against which
//! the pipeline and gate behavior can be validated.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use super::pipeline::{ReceivePipeline, StopHandle, StopSignal};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Address,
    Disposition,
    Envelope,
    ReceiveContext,
    Result,
    Transport,
    TransportBase,
    TransportPtr,
    TransportTuningProfile,
};

/// A message waiting in a memory queue.
#[derive(Debug, Clone)]
struct Queued {
    envelope: Envelope,
    delivery_count: u32,
}

#[derive(Default)]
struct MemoryQueue {
    items: Mutex<VecDeque<Queued>>,
    available: Notify,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryQueue {
    fn push_back(&self, item: Queued) {
        lock_ignore_poison(&self.items).push_back(item);
        self.available.notify_one();
    }

    fn push_front(&self, item: Queued) {
        lock_ignore_poison(&self.items).push_front(item);
        self.available.notify_one();
    }

    fn try_pop(&self) -> Option<Queued> {
        lock_ignore_poison(&self.items).pop_front()
    }

    async fn pop(&self) -> Queued {
        // ---
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        lock_ignore_poison(&self.items).len()
    }
}

/// Shared in-process broker.
///
/// All memory transports built on the same broker see the same queues, the
/// way service instances connected to one RabbitMQ or Service Bus namespace
/// do. Tests also use it directly to enqueue requests and read replies.
#[derive(Default)]
pub struct MemoryBroker {
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        // ---
        if let Some(queue) = self.queues.read().await.get(name) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().await;
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Enqueue `env` on the queue `address` routes to.
    pub async fn publish(&self, address: &Address, env: Envelope) {
        // ---
        let name = address.queue_name();
        log_debug!("memory: publish to {name}");
        self.queue(name).await.push_back(Queued {
            envelope: env,
            delivery_count: 1,
        });
    }

    /// Wait for the next message on `queue`.
    pub async fn receive(&self, queue: &str) -> Envelope {
        self.queue(queue).await.pop().await.envelope
    }

    /// Take the next message on `queue`, if any.
    pub async fn try_receive(&self, queue: &str) -> Option<Envelope> {
        self.queue(queue).await.try_pop().map(|q| q.envelope)
    }

    /// Messages waiting on `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.queue(queue).await.len()
    }
}

/// In-memory transport.
struct MemoryTransport {
    // ---
    base: TransportBase,
    broker: Arc<MemoryBroker>,
    stop: StopHandle,
    abort: StopHandle,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryTransport {
    async fn join_workers(&self) {
        // ---
        let mut workers = self.workers.lock().await;
        while let Some(handle) = workers.pop() {
            let _ = handle.await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, address: &Address, env: Envelope) -> Result<()> {
        self.broker.publish(address, env).await;
        Ok(())
    }

    /// Stop the workers. Each finishes the delivery it is processing; parked
    /// deliveries go back to the queue.
    async fn stop(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.join_workers().await;

        log_info!("[{}] memory transport stopped", self.transport_id());
        Ok(())
    }

    /// Stop the workers, cancelling the deliveries they are processing.
    /// Cancelled deliveries go back to the head of the queue.
    async fn abort(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.abort.stop();
        self.join_workers().await;

        log_info!("[{}] memory transport aborted", self.transport_id());
        Ok(())
    }
}

struct Worker {
    transport_id: String,
    queue_name: String,
    queue: Arc<MemoryQueue>,
    broker: Arc<MemoryBroker>,
    pipeline: Arc<ReceivePipeline>,
    stop: StopSignal,
    abort: StopSignal,
}

impl Worker {
    async fn run(mut self) {
        // ---
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                item = self.queue.pop() => item,
            };

            let ctx = ReceiveContext::new(
                self.queue_name.as_str(),
                item.envelope.clone(),
                item.delivery_count,
            );

            let settlement = tokio::select! {
                biased;
                settlement = self.pipeline.dispatch(ctx, &mut self.stop) => settlement,
                _ = self.abort.stopped() => {
                    log_warn!(
                        "[{}] delivery on {} cancelled, returning it to the queue",
                        self.transport_id,
                        self.queue_name
                    );
                    self.requeue(item);
                    break;
                }
            };

            match &settlement.disposition {
                Disposition::Complete { reply } => {
                    if let Some((address, env)) = reply {
                        self.broker.publish(address, env.clone()).await;
                    }
                }
                Disposition::Requeue => self.requeue(item),
                Disposition::Discard => {
                    log_debug!(
                        "[{}] discarded message from {}",
                        self.transport_id,
                        self.queue_name
                    );
                }
            }
        }

        log_debug!(
            "[{}] memory worker on {} stopped",
            self.transport_id,
            self.queue_name
        );
    }

    fn requeue(&self, item: Queued) {
        self.queue.push_front(Queued {
            envelope: item.envelope,
            delivery_count: item.delivery_count + 1,
        });
    }
}

/// Create a memory transport consuming `queue` on `broker`.
///
/// Starts `tuning.concurrency_cap` competing workers immediately.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(
    transport_id: impl Into<String>,
    broker: Arc<MemoryBroker>,
    queue: impl Into<String>,
    tuning: TransportTuningProfile,
    pipeline: Arc<ReceivePipeline>,
) -> Result<TransportPtr> {
    // ---
    let base = TransportBase::new(transport_id, queue, tuning);
    let memory_queue = broker.queue(&base.queue).await;
    let (stop, stop_signal) = StopHandle::pair();
    let (abort, abort_signal) = StopHandle::pair();

    let workers = (0..base.tuning.concurrency_cap)
        .map(|_| {
            let worker = Worker {
                transport_id: base.transport_id.clone(),
                queue_name: base.queue.clone(),
                queue: Arc::clone(&memory_queue),
                broker: Arc::clone(&broker),
                pipeline: Arc::clone(&pipeline),
                stop: stop_signal.clone(),
                abort: abort_signal.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect();

    log_info!(
        "[{}] memory transport consuming {} with {} workers",
        base.transport_id,
        base.queue,
        base.tuning.concurrency_cap
    );

    Ok(Arc::new(MemoryTransport {
        base,
        broker,
        stop,
        abort,
        workers: tokio::sync::Mutex::new(workers),
    }))
}
