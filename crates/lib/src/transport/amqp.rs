//! AMQP 0-9-1 transport (RabbitMQ) via lapin.
//!
//! One connection, one channel in confirm mode. Inbound deliveries carry their attempt in an
//! `x-attempt` header and the time they were first pulled in `x-first-seen`; a requeue
//! republishes the payload to the same queue with the bumped headers after the backoff delay
//! and then acks the original, so both survive across redeliveries. Release is a plain
//! `nack` with requeue.

use super::{Acknowledger, Delivery, InboundSource, OutboundSink, TransportError};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::time::Duration;

const ATTEMPT_HEADER: &str = "x-attempt";
const FIRST_SEEN_HEADER: &str = "x-first-seen";
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        log::info!("amqp: connected");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declare a durable queue.
    pub async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        log::debug!("amqp: declared {}", queue);
        Ok(())
    }

    /// Subscribe to `queue` with at most `prefetch` unacked deliveries.
    pub async fn source(&self, queue: &str, prefetch: u16) -> Result<AmqpSource, TransportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let tag = format!("courier-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        log::info!("amqp: consuming {} (prefetch {})", queue, prefetch);
        Ok(AmqpSource {
            consumer,
            channel: self.channel.clone(),
            queue: queue.to_string(),
        })
    }

    pub fn sink(&self, queue: &str) -> AmqpSink {
        AmqpSink {
            channel: self.channel.clone(),
            queue: queue.to_string(),
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

async fn publish(
    channel: &Channel,
    queue: &str,
    payload: &[u8],
    redelivery: Option<(u32, i64)>,
) -> Result<(), TransportError> {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_delivery_mode(PERSISTENT);
    if let Some((attempt, first_seen_millis)) = redelivery {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(ATTEMPT_HEADER), AMQPValue::LongUInt(attempt));
        headers.insert(
            ShortString::from(FIRST_SEEN_HEADER),
            AMQPValue::LongLongInt(first_seen_millis),
        );
        props = props.with_headers(headers);
    }
    let failed = |reason: String| TransportError::Publish {
        queue: queue.to_string(),
        reason,
    };
    let confirm = channel
        .basic_publish("", queue, BasicPublishOptions::default(), payload, props)
        .await
        .map_err(|e| failed(e.to_string()))?
        .await
        .map_err(|e| failed(e.to_string()))?;
    match confirm {
        Confirmation::Nack(_) => Err(failed("broker nacked publish".to_string())),
        _ => Ok(()),
    }
}

fn header<'a>(props: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    props
        .headers()
        .as_ref()?
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == name)
        .map(|(_, v)| v)
}

fn attempt_of(props: &BasicProperties) -> u32 {
    header(props, ATTEMPT_HEADER)
        .and_then(|v| match v {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            _ => None,
        })
        .unwrap_or(1)
}

fn first_seen_of(props: &BasicProperties) -> Option<i64> {
    header(props, FIRST_SEEN_HEADER).and_then(|v| match v {
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        AMQPValue::Timestamp(secs) => i64::try_from(*secs).ok().map(|s| s.saturating_mul(1000)),
        _ => None,
    })
}

pub struct AmqpSource {
    consumer: Consumer,
    channel: Channel,
    queue: String,
}

#[async_trait]
impl InboundSource for AmqpSource {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        let Some(next) = self.consumer.next().await else {
            return Ok(None);
        };
        let delivery = next?;
        let attempt = attempt_of(&delivery.properties);
        let first_seen = first_seen_of(&delivery.properties);
        let acker = AmqpAcker {
            acker: delivery.acker,
            channel: self.channel.clone(),
            queue: self.queue.clone(),
        };
        Ok(Some(Delivery::new(
            delivery.data,
            attempt,
            first_seen,
            Box::new(acker),
        )))
    }
}

struct AmqpAcker {
    acker: Acker,
    channel: Channel,
    queue: String,
}

fn settle_err(e: lapin::Error) -> TransportError {
    TransportError::Settle(e.to_string())
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(settle_err)
    }

    async fn requeue(
        self: Box<Self>,
        payload: Vec<u8>,
        next_attempt: u32,
        first_seen_millis: i64,
        delay: Duration,
    ) -> Result<(), TransportError> {
        let AmqpAcker {
            acker,
            channel,
            queue,
        } = *self;
        // The original stays unacked (and counted against prefetch) until the copy is published.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match publish(
                &channel,
                &queue,
                &payload,
                Some((next_attempt, first_seen_millis)),
            ).await {
                Ok(()) => {
                    if let Err(e) = acker.ack(BasicAckOptions::default()).await {
                        log::warn!("amqp: ack after requeue failed: {}", e);
                    }
                }
                Err(e) => {
                    log::warn!("amqp: requeue publish failed, returning original: {}", e);
                    let opts = BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    };
                    if let Err(e) = acker.nack(opts).await {
                        log::warn!("amqp: nack failed: {}", e);
                    }
                }
            }
        });
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(settle_err)
    }
}

#[derive(Clone)]
pub struct AmqpSink {
    channel: Channel,
    queue: String,
}

#[async_trait]
impl OutboundSink for AmqpSink {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        publish(&self.channel, &self.queue, payload, None).await
    }
}
