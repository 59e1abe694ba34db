//! Binding a typed consumer to the byte-level receive pipeline.
//!
//! Transports deliver opaque payloads. [`MessageConsumer`] lets the consumer
//! work with its own message and reply types; [`bind`] erases those types
//! behind [`EnvelopeHandler`] so the pipeline stays non-generic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// A consumer for a single message type.
#[async_trait::async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    // ---
    /// Message this consumer accepts.
    type Message: DeserializeOwned + Send + 'static;

    /// Reply sent back to the requester.
    type Reply: Serialize + Send + 'static;

    /// Name of the message type, used in logs.
    fn message_type(&self) -> &'static str;

    /// Process one message.
    ///
    /// An `Err` is a consume fault: the delivery is discarded and no reply is
    /// sent. Consumers that owe the requester an answer report failures inside
    /// `Reply` instead.
    async fn consume(&self, message: Self::Message) -> Result<Self::Reply>;
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased consumer.
pub(crate) trait EnvelopeHandler: Send + Sync {
    fn message_type(&self) -> &'static str;

    /// Decode `payload`, consume it and encode the reply.
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

struct Bound<C> {
    consumer: Arc<C>,
}

impl<C> EnvelopeHandler for Bound<C>
where
    C: MessageConsumer,
{
    fn message_type(&self) -> &'static str {
        self.consumer.message_type()
    }

    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        // Deserialize request
        let message: C::Message = match serde_json::from_slice(&payload) {
            Ok(m) => m,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let consumer = Arc::clone(&self.consumer);

        Box::pin(async move {
            let reply = consumer.consume(message).await?;
            let bytes = serde_json::to_vec(&reply)?;
            Ok(Bytes::from(bytes))
        })
    }
}

/// Erase a typed consumer.
pub(crate) fn bind<C>(consumer: C) -> Arc<dyn EnvelopeHandler>
where
    C: MessageConsumer,
{
    Arc::new(Bound {
        consumer: Arc::new(consumer),
    })
}
