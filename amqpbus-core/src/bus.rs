use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;

/// Exchange declaration flags. Exchanges are always topic-typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Manual acknowledgement of one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self) -> Result<()>;
}

/// One message handed to a consumer. Settling it is the receiver's job.
pub struct Delivery {
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        redelivered: bool,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            redelivered,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self) -> Result<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Deliveries of one consumer. An `Err` item means the session broke;
/// the end of the stream means the consumer was cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens broker sessions. Implementations capture their own connection settings.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// Where the broker lives, for logs. Must not include credentials.
    fn endpoint(&self) -> String;
}

/// One live broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()>;

    /// Declare a queue and return its effective name. An empty `name` lets
    /// the broker pick one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publish on a transient channel that is closed again afterwards.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Close the session. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}
