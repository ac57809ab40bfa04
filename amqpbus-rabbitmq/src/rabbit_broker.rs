use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use amqpbus_core::{
    Acknowledger, Broker, BrokerConnection, Delivery, DeliveryStream, ExchangeOptions,
    MessagingError, QueueOptions,
};

use crate::options::ConnectionSettings;

const REPLY_SUCCESS: u16 = 200;

/// [`Broker`] backed by RabbitMQ through lapin.
#[derive(Clone, Debug)]
pub struct RabbitBroker {
    settings: ConnectionSettings,
}

impl RabbitBroker {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.settings.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let conn = Connection::connect(&self.settings.uri(), properties)
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        info!("RabbitMQ connected. endpoint={}", self.settings.endpoint());
        Ok(Arc::new(RabbitConnection {
            conn,
            channel,
            settings: self.settings.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }
}

/// One AMQP connection and the channel used for topology and consuming.
struct RabbitConnection {
    conn: Connection,
    channel: Channel,
    settings: ConnectionSettings,
}

#[async_trait]
impl BrokerConnection for RabbitConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), MessagingError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(e.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, MessagingError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(e.to_string()))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(e.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
        self.channel
            .basic_qos(self.settings.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        debug!("basic_consume queue={} tag={}", queue, consumer_tag);

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(d) => Ok(Delivery::new(
                d.routing_key.as_str().to_string(),
                d.redelivered,
                d.data,
                Arc::new(RabbitAcker(d.acker)),
            )),
            Err(e) => Err(MessagingError::Subscribe(e.to_string())),
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let ch = self
            .conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        let published = publish_on(&ch, self.settings.confirms, exchange, routing_key, body).await;

        // a channel the broker already closed on error needs no close
        if ch.status().connected() {
            if let Err(e) = ch.close(REPLY_SUCCESS, "OK").await {
                debug!("closing publish channel failed: {e}");
            }
        }
        published
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.conn.status().connected() {
            return Ok(());
        }
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

async fn publish_on(
    ch: &Channel,
    confirms: bool,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
) -> Result<(), MessagingError> {
    if confirms {
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;
    }

    let confirm = ch
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: false,
                immediate: false,
            },
            body,
            BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2),
        )
        .await
        .map_err(|e| MessagingError::Publish(e.to_string()))?
        .await
        .map_err(|e| MessagingError::Publish(e.to_string()))?;

    if confirm.is_nack() {
        return Err(MessagingError::Publish(
            "publisher confirm NACK".to_string(),
        ));
    }
    Ok(())
}

struct RabbitAcker(Acker);

#[async_trait]
impl Acknowledger for RabbitAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn reject(&self) -> Result<(), MessagingError> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }
}
