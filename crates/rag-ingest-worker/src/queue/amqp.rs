//! AMQP 0-9-1 consumer (RabbitMQ)

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;

use super::{Acknowledger, Delivery, MessageSource};
use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Header quorum queues use to report previous delivery attempts
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Consumer bound to one durable queue with manual acknowledgement
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    queue: String,
}

impl AmqpConsumer {
    /// Connect, declare the queue and start consuming
    ///
    /// `prefetch` bounds the unacknowledged deliveries across all workers
    /// sharing this consumer.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::queue(format!("failed to connect to broker: {}", e)))?;
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(config),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &config.queue,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            "Consuming from queue '{}' with prefetch {}",
            config.queue,
            config.prefetch
        );

        Ok(Self {
            connection,
            channel,
            consumer: Mutex::new(consumer),
            queue: config.queue.clone(),
        })
    }
}

/// Queue arguments; empty unless dead-lettering is configured
///
/// Redeclaring an existing queue with different arguments fails, so the
/// arguments must match how the queue was first created.
fn queue_arguments(config: &QueueConfig) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &config.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
        if let Some(routing_key) = &config.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }
    }
    args
}

fn delivery_count(headers: Option<&FieldTable>) -> Option<u32> {
    let headers = headers?;
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
        .map(|(_, value)| value)?;

    let count = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(count).ok()
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(Error::from)
    }
}

#[async_trait]
impl MessageSource for AmqpConsumer {
    async fn recv(&self) -> Option<Result<Delivery>> {
        let mut consumer = self.consumer.lock().await;
        let delivery = match consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(Error::from(e))),
        };

        let count = delivery_count(delivery.properties.headers().as_ref());
        Some(Ok(Delivery::new(
            delivery.delivery_tag,
            delivery.data,
            delivery.redelivered,
            count,
            Box::new(LapinAcker(delivery.acker)),
        )))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "worker shutdown").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "worker shutdown").await?;
        }
        tracing::info!("Closed broker connection for queue '{}'", self.queue);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn name(&self) -> &str {
        "amqp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_arguments_without_dead_lettering() {
        let args = queue_arguments(&QueueConfig::default());
        assert!(args.inner().is_empty());
    }

    #[test]
    fn test_queue_arguments_with_dead_lettering() {
        let config = QueueConfig {
            dead_letter_exchange: Some("events.dlx".into()),
            dead_letter_routing_key: Some("files.failed".into()),
            ..QueueConfig::default()
        };
        let args = queue_arguments(&config);
        assert_eq!(args.inner().len(), 2);
    }

    #[test]
    fn test_delivery_count_header() {
        assert_eq!(delivery_count(None), None);

        let mut headers = FieldTable::default();
        headers.insert("other".into(), AMQPValue::LongInt(9));
        assert_eq!(delivery_count(Some(&headers)), None);

        headers.insert(DELIVERY_COUNT_HEADER.into(), AMQPValue::LongLongInt(3));
        assert_eq!(delivery_count(Some(&headers)), Some(3));

        headers.insert(DELIVERY_COUNT_HEADER.into(), AMQPValue::LongInt(-1));
        assert_eq!(delivery_count(Some(&headers)), None);
    }
}
