//! Receive pipeline.
//!
//! This module is the glue between a transport's delivery loop and the
//! consumer. For each delivery a transport calls
//! [`ReceivePipeline::dispatch`], which runs:
//!
//! ```text
//! pre_receive ──ok──> post_receive -> consume ──ok──> post_consume  => Complete
//!      │                                      └─err─> consume_fault => Discard
//!      ├─transient─> receive_fault (waits) -> retry pre_receive
//!      │                 └─ transport stopped first                 => Requeue
//!      └─other────> receive_fault                                   => Discard
//! ```
//!
//! The transport then acts on the returned [`Disposition`] while holding the
//! [`Settlement`], so draining only finishes once the acknowledgement and the
//! reply are out.
//!
//! ## Admission and draining
//!
//! Every delivery registers as in flight *before* the admission check and
//! deregisters if it is suspended. A controller that closes the gate and then
//! sees zero in flight therefore knows no delivery can still slip past the
//! gate.
//!
//! ## Error handling
//!
//! Transient admission errors never reach the consumer, the requester or the
//! logs above debug level. Consume faults and undecodable payloads are logged
//! and discarded; nothing is routed to an error queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};

use crate::consumer::{bind, EnvelopeHandler};
use crate::{
    //
    log_debug,
    log_warn,
    Disposition,
    Envelope,
    MessageConsumer,
    ReceiveContext,
    ReceiveObserver,
    RelayError,
    Result,
};

/// Sender side of a transport stop signal.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

/// Receiver side of a transport stop signal.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopHandle {
    /// Create a linked handle/signal pair, not yet stopped.
    pub fn pair() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), StopSignal(rx))
    }

    /// Signal stop to every clone of the paired [`StopSignal`].
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    /// A new signal linked to this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal(self.0.subscribe())
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once stop is signalled or the handle is dropped.
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        // ---
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Outcome of one dispatch.
///
/// Keep it alive until the disposition has been applied; an admitted delivery
/// counts as in flight until the settlement is dropped.
#[derive(Debug)]
pub struct Settlement {
    pub disposition: Disposition,
    _in_flight: Option<InFlightGuard>,
}

/// Transport-independent receive pipeline bound to one consumer.
pub struct ReceivePipeline {
    handler: Arc<dyn EnvelopeHandler>,
    observers: Vec<Arc<dyn ReceiveObserver>>,
    in_flight: Arc<InFlight>,
}

impl ReceivePipeline {
    /// Create a pipeline delivering to `consumer`, with no observers.
    pub fn new<C>(consumer: C) -> Self
    where
        C: MessageConsumer,
    {
        Self {
            handler: bind(consumer),
            observers: Vec::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Register an observer. Hooks run in registration order.
    pub fn with_observer(mut self, observer: Arc<dyn ReceiveObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Name of the consumed message type.
    pub fn message_type(&self) -> &'static str {
        self.handler.message_type()
    }

    /// Deliveries admitted and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until no delivery is in flight.
    pub async fn drained(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Run one delivery through the pipeline.
    ///
    /// A delivery suspended by an observer waits for that observer's
    /// `receive_fault` and is retried; if `stop` fires first it is settled
    /// as [`Disposition::Requeue`].
    pub async fn dispatch(&self, ctx: ReceiveContext, stop: &mut StopSignal) -> Settlement {
        // ---
        let guard = loop {
            let guard = self.in_flight.enter();

            match self.pre_receive(&ctx).await {
                Ok(()) => break guard,
                Err(err) if err.is_transient() => {
                    drop(guard);

                    tokio::select! {
                        _ = self.receive_fault(&ctx, &err) => {}
                        _ = stop.stopped() => {}
                    }

                    if stop.is_stopped() {
                        log_debug!("transport stopping, returning suspended delivery on {}", ctx.queue);
                        return Settlement {
                            disposition: Disposition::Requeue,
                            _in_flight: None,
                        };
                    }
                }
                Err(err) => {
                    drop(guard);
                    self.receive_fault(&ctx, &err).await;
                    log_warn!("receive on {} failed, discarding message: {err}", ctx.queue);
                    return Settlement {
                        disposition: Disposition::Discard,
                        _in_flight: None,
                    };
                }
            }
        };

        for observer in &self.observers {
            observer.post_receive(&ctx).await;
        }

        let started = Instant::now();
        let disposition = match self.handler.call(ctx.envelope.payload.clone()).await {
            Ok(payload) => {
                let elapsed = started.elapsed();
                for observer in &self.observers {
                    observer.post_consume(&ctx, elapsed).await;
                }
                Disposition::Complete {
                    reply: self.reply(&ctx, payload, elapsed),
                }
            }
            Err(err) => {
                for observer in &self.observers {
                    observer.consume_fault(&ctx, &err).await;
                }
                log_warn!(
                    "{} on {} faulted, discarding message: {err}",
                    self.message_type(),
                    ctx.queue
                );
                Disposition::Discard
            }
        };

        Settlement {
            disposition,
            _in_flight: Some(guard),
        }
    }

    async fn pre_receive(&self, ctx: &ReceiveContext) -> Result<()> {
        // ---
        for observer in &self.observers {
            observer.pre_receive(ctx).await?;
        }
        Ok(())
    }

    async fn receive_fault(&self, ctx: &ReceiveContext, err: &RelayError) {
        // ---
        for observer in &self.observers {
            observer.receive_fault(ctx, err).await;
        }
    }

    fn reply(
        &self,
        ctx: &ReceiveContext,
        payload: bytes::Bytes,
        elapsed: Duration,
    ) -> Option<(crate::Address, Envelope)> {
        // ---
        let Some(reply_to) = ctx.envelope.reply_to.clone() else {
            log_debug!(
                "{} on {} has no reply address, reply dropped",
                self.message_type(),
                ctx.queue
            );
            return None;
        };

        log_debug!(
            "{} on {} consumed in {:?}, replying to {reply_to}",
            self.message_type(),
            ctx.queue,
            elapsed
        );

        Some((
            reply_to,
            Envelope::reply(payload, ctx.envelope.correlation_id.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ReceiveGate;
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pong {
        n: u32,
    }

    #[derive(Default)]
    struct PingConsumer {
        consumed: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait::async_trait]
    impl MessageConsumer for PingConsumer {
        type Message = Ping;
        type Reply = Pong;

        fn message_type(&self) -> &'static str {
            "Ping"
        }

        async fn consume(&self, message: Ping) -> Result<Pong> {
            if message.n == 0 {
                return Err(RelayError::Rendering("zero".into()));
            }
            self.consumed.lock().unwrap().push(message.n);
            Ok(Pong { n: message.n })
        }
    }

    /// Records hook invocations.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait::async_trait]
    impl ReceiveObserver for Recorder {
        async fn pre_receive(&self, _ctx: &ReceiveContext) -> Result<()> {
            self.events.lock().unwrap().push("pre_receive");
            Ok(())
        }
        async fn post_receive(&self, _ctx: &ReceiveContext) {
            self.events.lock().unwrap().push("post_receive");
        }
        async fn post_consume(&self, _ctx: &ReceiveContext, _elapsed: Duration) {
            self.events.lock().unwrap().push("post_consume");
        }
        async fn consume_fault(&self, _ctx: &ReceiveContext, _err: &RelayError) {
            self.events.lock().unwrap().push("consume_fault");
        }
        async fn receive_fault(&self, _ctx: &ReceiveContext, _err: &RelayError) {
            self.events.lock().unwrap().push("receive_fault");
        }
    }

    fn delivery(payload: &'static [u8]) -> ReceiveContext {
        let env = Envelope::request(Bytes::from_static(payload), Arc::from("c-7"), "replies".into());
        ReceiveContext::new("pings", env, 1)
    }

    #[tokio::test]
    async fn test_consumed_message_replies_with_correlation() {
        // ---
        let recorder = Arc::new(Recorder::default());
        let pipeline = ReceivePipeline::new(PingConsumer::default()).with_observer(recorder.clone());
        let (_handle, mut stop) = StopHandle::pair();

        let settlement = pipeline.dispatch(delivery(br#"{"n":7}"#), &mut stop).await;

        let (addr, env) = match settlement.disposition {
            Disposition::Complete { reply: Some(reply) } => reply,
            other => panic!("expected a reply, got {other:?}"),
        };
        assert_eq!(addr.queue_name(), "replies");
        assert_eq!(env.correlation_id.as_deref(), Some("c-7"));
        let pong: Pong = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(pong, Pong { n: 7 });

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["pre_receive", "post_receive", "post_consume"]
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_discarded() {
        // ---
        let recorder = Arc::new(Recorder::default());
        let pipeline = ReceivePipeline::new(PingConsumer::default()).with_observer(recorder.clone());
        let (_handle, mut stop) = StopHandle::pair();

        let settlement = pipeline.dispatch(delivery(b"garbage"), &mut stop).await;

        assert_eq!(settlement.disposition, Disposition::Discard);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["pre_receive", "post_receive", "consume_fault"]
        );
    }

    #[tokio::test]
    async fn test_consume_fault_is_discarded() {
        // ---
        let pipeline = ReceivePipeline::new(PingConsumer::default());
        let (_handle, mut stop) = StopHandle::pair();

        let settlement = pipeline.dispatch(delivery(br#"{"n":0}"#), &mut stop).await;
        assert_eq!(settlement.disposition, Disposition::Discard);
    }

    #[tokio::test]
    async fn test_closed_gate_suspends_until_reopened() {
        // ---
        let gate = Arc::new(ReceiveGate::new());
        let consumer = PingConsumer::default();
        let consumed = consumer.consumed.clone();
        let pipeline = Arc::new(ReceivePipeline::new(consumer).with_observer(gate.clone()));
        let (_handle, stop) = StopHandle::pair();

        // The first delivery passes the open gate.
        let first = pipeline.dispatch(delivery(br#"{"n":1}"#), &mut stop.clone()).await;
        assert!(matches!(first.disposition, Disposition::Complete { .. }));
        drop(first);

        // The second hits the closed gate and parks.
        gate.pause();
        let second = {
            let pipeline = pipeline.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let settlement = pipeline.dispatch(delivery(br#"{"n":2}"#), &mut stop).await;
                settlement.disposition
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        assert_eq!(*consumed.lock().unwrap(), vec![1]);
        assert_eq!(pipeline.in_flight(), 0);

        // Reopening retries it.
        gate.resume();
        let disposition = timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        assert!(matches!(disposition, Disposition::Complete { reply: Some(_) }));
        assert_eq!(*consumed.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stop_requeues_suspended_delivery() {
        // ---
        let gate = Arc::new(ReceiveGate::new());
        let consumer = PingConsumer::default();
        let consumed = consumer.consumed.clone();
        let pipeline = Arc::new(ReceivePipeline::new(consumer).with_observer(gate.clone()));
        let (handle, stop) = StopHandle::pair();

        gate.pause();
        let parked = {
            let pipeline = pipeline.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                pipeline.dispatch(delivery(br#"{"n":3}"#), &mut stop).await.disposition
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop();
        let disposition = timeout(Duration::from_secs(1), parked).await.unwrap().unwrap();
        assert_eq!(disposition, Disposition::Requeue);
        assert!(consumed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drained_waits_for_settlement() {
        // ---
        let pipeline = ReceivePipeline::new(PingConsumer::default());
        let (_handle, mut stop) = StopHandle::pair();

        let settlement = pipeline.dispatch(delivery(br#"{"n":4}"#), &mut stop).await;
        assert_eq!(pipeline.in_flight(), 1);
        assert!(timeout(Duration::from_millis(20), pipeline.drained()).await.is_err());

        drop(settlement);
        assert_eq!(pipeline.in_flight(), 0);
        timeout(Duration::from_millis(20), pipeline.drained()).await.unwrap();
    }
}
