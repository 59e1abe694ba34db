//! RabbitMQ transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! an AMQP 0-9-1 broker connection. It follows an **actor-based concurrency
//! model** for everything that talks to the channel on the transport's behalf.
//!
//! ## Concurrency model
//!
//! - A background **actor task** owns the AMQP connection and channel and
//!   serializes publishing and shutdown.
//! - A **consumer task** reads the `basic.consume` stream and spawns one
//!   delivery task per message, bounded by a semaphore sized to the
//!   concurrency cap.
//! - Delivery tasks run the receive pipeline, publish the reply through the
//!   actor and settle the delivery with its own acker.
//!
//! ## Flow control
//!
//! `basic.qos` prefetch equals the concurrency cap, so the broker never hands
//! one instance more than it can work on; the rest of the backlog stays
//! available to competing instances.
//!
//! ## Queue semantics
//!
//! The consumed queue is declared durable and never auto-deleted. Settlement
//! follows the pipeline's disposition:
//!
//! - `Complete`: publish the reply (default exchange, routing key = reply
//!   queue) then `basic.ack`
//! - `Requeue`: `basic.nack` with requeue
//! - `Discard`: `basic.reject` without requeue
//!
//! ## Shutdown
//!
//! Stopping ends the consumer loop, waits for running delivery tasks (a
//! suspended delivery is nacked back to the queue), cancels the consumer and
//! closes the channel and connection. Unacknowledged prefetched messages are
//! returned by the broker when the channel closes.
//!
//! Aborting does the same but cancels delivery tasks still processing and
//! nacks their messages back to the queue instead of waiting for them.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        QueueDeclareOptions,
    },
    acker::Acker,
    message::Delivery,
    types::{AMQPValue, FieldTable, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};

use std::sync::Arc;

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

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
    RelayError,
    Result,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

const DEFAULT_AMQP_PORT: u16 = 5672;
const PERSISTENT: u8 = 2;

type TaskList = Mutex<Vec<JoinHandle<()>>>;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        address: Address,
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Closed,
}

/// Cloneable handle for publishing through the actor.
#[derive(Clone)]
struct Publisher {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl Publisher {
    async fn publish(&self, address: &Address, env: Envelope) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Publish {
                address: address.clone(),
                env,
                resp: tx,
            })
            .await
            .map_err(|e| {
                let msg = format!("actor command channel closed:{e}");
                RelayError::Transport(msg)
            })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            RelayError::Transport(msg)
        })?
    }
}

/// RabbitMQ transport implementation using lapin.
pub struct LapinTransport {
    // ---
    base: TransportBase,
    publisher: Publisher,
    stop: StopHandle,
    abort: StopHandle,
    consumer_task: TaskList,
    actor_task: TaskList,
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    consumer_tag: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.transport_id);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::Closed => {
                    log_info!("[{}] AMQP actor shutting down", self.transport_id);
                    break;
                }
            }
        }

        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            log_debug!("[{}] basic.cancel failed: {e}", self.transport_id);
        }

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        match self.cmd_rx.recv().await {
            Some(cmd) => ActorStep::Cmd(cmd),
            None => ActorStep::Closed,
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Publish { address, env, resp } => {
                let result = self.do_publish(&address, env).await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    async fn do_publish(&mut self, address: &Address, env: Envelope) -> Result<()> {
        // ---
        let queue = address.queue_name();

        self.channel
            .basic_publish(
                "",    // default exchange
                queue, // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                properties_for(&env),
            )
            .await
            .map_err(|e| RelayError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] Published to queue: {queue}", self.transport_id);
        Ok(())
    }
}

/// AMQP message properties carrying the envelope metadata.
fn properties_for(env: &Envelope) -> BasicProperties {
    // ---
    let short = |s: &str| ShortString::from(s.to_string());

    let mut props = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(id) = &env.message_id {
        props = props.with_message_id(short(id));
    }
    if let Some(id) = &env.correlation_id {
        props = props.with_correlation_id(short(id));
    }
    if let Some(reply_to) = &env.reply_to {
        props = props.with_reply_to(short(&reply_to.0));
    }
    if let Some(content_type) = &env.content_type {
        props = props.with_content_type(short(content_type));
    }
    props
}

/// Envelope view of an AMQP delivery.
fn envelope_from(properties: &BasicProperties, data: Vec<u8>) -> Envelope {
    // ---
    let text = |s: &Option<ShortString>| s.as_ref().map(|s| Arc::<str>::from(s.as_str()));

    Envelope {
        message_id: text(properties.message_id()),
        correlation_id: text(properties.correlation_id()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|s| Address::from(s.as_str())),
        content_type: text(properties.content_type()),
        payload: Bytes::from(data),
    }
}

async fn handle_delivery(
    transport_id: String,
    queue: Arc<str>,
    delivery: Delivery,
    pipeline: Arc<ReceivePipeline>,
    publisher: Publisher,
    mut stop: StopSignal,
    mut abort: StopSignal,
) {
    // ---
    let Delivery {
        properties,
        data,
        redelivered,
        acker,
        ..
    } = delivery;

    // AMQP only reports whether a message was delivered before.
    let delivery_count = if redelivered { 2 } else { 1 };
    let ctx = ReceiveContext::new(
        Arc::clone(&queue),
        envelope_from(&properties, data),
        delivery_count,
    );

    let settlement = tokio::select! {
        biased;
        settlement = pipeline.dispatch(ctx, &mut stop) => settlement,
        _ = abort.stopped() => {
            log_warn!("[{transport_id}] Delivery on {queue} cancelled, requeueing");
            if let Err(e) = requeue(&acker).await {
                log_error!("[{transport_id}] Failed to requeue cancelled delivery: {e}");
            }
            return;
        }
    };

    let settled = match &settlement.disposition {
        Disposition::Complete { reply } => {
            complete(&transport_id, &acker, &publisher, reply.as_ref()).await
        }
        Disposition::Requeue => requeue(&acker).await,
        Disposition::Discard => acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| RelayError::Transport(format!("amqp: reject failed: {e}"))),
    };

    if let Err(e) = settled {
        log_error!("[{transport_id}] Failed to settle delivery: {e}");
    }
}

async fn complete(
    transport_id: &str,
    acker: &Acker,
    publisher: &Publisher,
    reply: Option<&(Address, Envelope)>,
) -> Result<()> {
    // ---
    if let Some((address, env)) = reply {
        if let Err(e) = publisher.publish(address, env.clone()).await {
            // Redelivery is the only retry.
            log_warn!("[{transport_id}] Reply to {address} not sent, requeueing request: {e}");
            return requeue(acker).await;
        }
    }

    acker
        .ack(BasicAckOptions::default())
        .await
        .map_err(|e| RelayError::Transport(format!("amqp: ack failed: {e}")))
}

async fn requeue(acker: &Acker) -> Result<()> {
    // ---
    acker
        .nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await
        .map_err(|e| RelayError::Transport(format!("amqp: nack failed: {e}")))
}

struct ConsumerLoop {
    transport_id: String,
    queue: Arc<str>,
    consumer: Consumer,
    pipeline: Arc<ReceivePipeline>,
    publisher: Publisher,
    permits: Arc<Semaphore>,
    stop: StopSignal,
    abort: StopSignal,
}

impl ConsumerLoop {
    async fn run(mut self) {
        // ---
        let mut deliveries = JoinSet::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                next = self.consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    log_error!("[{}] Consumer error on {}: {e}", self.transport_id, self.queue);
                    break;
                }
                None => break,
            };

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };

            log_debug!("[{}] Received message on queue: {}", self.transport_id, self.queue);

            let task = handle_delivery(
                self.transport_id.clone(),
                Arc::clone(&self.queue),
                delivery,
                Arc::clone(&self.pipeline),
                self.publisher.clone(),
                self.stop.clone(),
                self.abort.clone(),
            );
            deliveries.spawn(async move {
                task.await;
                drop(permit);
            });

            // Reap finished deliveries so the set stays small.
            while deliveries.try_join_next().is_some() {}
        }

        while deliveries.join_next().await.is_some() {}

        log_info!(
            "[{}] Consumer task ended for queue: {}",
            self.transport_id,
            self.queue
        );
    }
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, address: &Address, env: Envelope) -> Result<()> {
        self.publisher.publish(address, env).await
    }

    async fn stop(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.close().await
    }

    async fn abort(&self) -> Result<()> {
        // ---
        self.stop.stop();
        self.abort.stop();
        self.close().await
    }
}

impl LapinTransport {
    /// Wait for the consumer loop, then close the channel and connection.
    async fn close(&self) -> Result<()> {
        // ---
        if let Some(handle) = self.consumer_task.lock().await.pop() {
            let _ = handle.await;
        }

        let (tx, rx) = oneshot::channel();
        let _ = self.publisher.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        if let Some(handle) = self.actor_task.lock().await.pop() {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Connection parameters for `config`'s normalized `amqp://` endpoint.
fn amqp_uri(config: &TransportConfig) -> AMQPUri {
    // ---
    let endpoint = &config.endpoint;
    let vhost = match endpoint.path.trim_start_matches('/') {
        "" => "/".to_string(),
        vhost => vhost.to_string(),
    };

    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.credentials.name.clone(),
                password: config.credentials.secret.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port.unwrap_or(DEFAULT_AMQP_PORT),
        },
        vhost,
        query: AMQPQueryString::default(),
    }
}

fn queue_arguments(config: &TransportConfig) -> FieldTable {
    // ---
    let mut args = FieldTable::default();
    if let Some(ttl) = config.tuning.message_ttl {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        args.insert(
            ShortString::from("x-message-ttl".to_string()),
            AMQPValue::LongLongInt(millis),
        );
    }
    args
}

/// Creates a lapin-based RabbitMQ transport and starts consuming.
///
/// # Errors
///
/// Returns an error if:
/// - Connection to the broker fails
/// - The queue cannot be declared or consumed
///
/// # Connection Behavior
///
/// The connection to the broker happens immediately during transport creation.
pub async fn create_transport(
    config: &TransportConfig,
    pipeline: Arc<ReceivePipeline>,
) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(config).await?;
    let tuning = &config.tuning;

    channel
        .basic_qos(tuning.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| RelayError::Transport(format!("amqp: basic.qos failed: {e}")))?;

    let queue_opts = QueueDeclareOptions {
        passive: false,
        durable: tuning.durable,
        exclusive: false,
        auto_delete: tuning.auto_delete,
        nowait: false,
    };
    channel
        .queue_declare(&config.queue, queue_opts, queue_arguments(config))
        .await
        .map_err(|e| RelayError::Transport(format!("amqp: queue declare failed: {e}")))?;

    log_info!("[{}] Declared queue: {}", config.node_id, config.queue);

    let consumer_tag = format!("{}-consumer", config.node_id);
    let consumer = channel
        .basic_consume(
            &config.queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| RelayError::Transport(format!("amqp: consume failed: {e}")))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(tuning.concurrency_cap.max(16));
    let publisher = Publisher { cmd_tx };
    let (stop, stop_signal) = StopHandle::pair();
    let (abort, abort_signal) = StopHandle::pair();

    let actor = Actor {
        transport_id: config.node_id.clone(),
        consumer_tag,
        connection,
        channel,
        cmd_rx,
    };
    let actor_task = tokio::spawn(actor.run());

    let consumer_loop = ConsumerLoop {
        transport_id: config.node_id.clone(),
        queue: Arc::from(config.queue.as_str()),
        consumer,
        pipeline,
        publisher: publisher.clone(),
        permits: Arc::new(Semaphore::new(tuning.concurrency_cap)),
        stop: stop_signal,
        abort: abort_signal,
    };
    let consumer_task = tokio::spawn(consumer_loop.run());

    log_info!(
        "[{}] Consuming {} (prefetch {})",
        config.node_id,
        config.queue,
        tuning.prefetch_count
    );

    Ok(Arc::new(LapinTransport {
        base: TransportBase::from(config),
        publisher,
        stop,
        abort,
        consumer_task: Mutex::new(vec![consumer_task]),
        actor_task: Mutex::new(vec![actor_task]),
    }))
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &TransportConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = amqp_uri(config);

    log_info!(
        "Connecting to AMQP broker: amqp://{}:{}/{}",
        uri.authority.host,
        uri.authority.port,
        uri.vhost
    );

    let connection = Connection::connect_uri(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RelayError::Transport(msg)
        })?;

    log_info!("Connected to AMQP broker");

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RelayError::Transport(msg)
    })?;

    Ok((connection, channel))
}
