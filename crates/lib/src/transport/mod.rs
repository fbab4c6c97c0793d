//! Broker seam: a redeliverable at-least-once inbound source and an outbound sink.
//!
//! Any transport that can ack, make a message available again (now or after a delay), and
//! publish fits. Implementations: an in-process broker (tests, pipe mode), AMQP via lapin
//! (`amqp` feature), and a log sink for dead letters when no queue is configured.

#[cfg(feature = "amqp")]
mod amqp;
mod log_sink;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpSink, AmqpSource};
pub use log_sink::LogSink;
pub use memory::{MemoryBroker, MemorySink, MemorySource};

use crate::envelope::now_millis;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("settling delivery failed: {0}")]
    Settle(String),
    #[error("queue {0} is closed")]
    Closed(String),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        TransportError::Connection(e.to_string())
    }
}

/// Settles one delivery with the broker. Exactly one method is called per delivery; an
/// acknowledger dropped unsettled leaves the message to be redelivered.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the live queue.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
    /// Remove the message and make `payload` available again as delivery `next_attempt`
    /// once `delay` has passed, keeping `first_seen_millis` for the redelivery.
    async fn requeue(
        self: Box<Self>,
        payload: Vec<u8>,
        next_attempt: u32,
        first_seen_millis: i64,
        delay: Duration,
    ) -> Result<(), TransportError>;
    /// Hand the message back unchanged (same attempt) for immediate redelivery.
    async fn release(self: Box<Self>) -> Result<(), TransportError>;
}

/// A message pulled from the inbound queue, not yet settled.
pub struct Delivery {
    pub payload: Vec<u8>,
    /// 1-based delivery attempt, carried across requeues.
    pub attempt: u32,
    /// When the transport first handed this message out (epoch millis), carried across
    /// requeues like the attempt.
    pub first_seen_millis: i64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// `first_seen_millis` is None on a first delivery; it is stamped now.
    pub fn new(
        payload: Vec<u8>,
        attempt: u32,
        first_seen_millis: Option<i64>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            attempt: attempt.max(1),
            first_seen_millis: first_seen_millis.unwrap_or_else(now_millis),
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn requeue(self, next_attempt: u32, delay: Duration) -> Result<(), TransportError> {
        self.acker
            .requeue(self.payload, next_attempt, self.first_seen_millis, delay)
            .await
    }

    pub async fn release(self) -> Result<(), TransportError> {
        self.acker.release().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("attempt", &self.attempt)
            .field("first_seen_millis", &self.first_seen_millis)
            .finish()
    }
}

#[async_trait]
pub trait InboundSource: Send {
    /// Next delivery, or None once the source is closed and drained.
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError>;
}

#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Queue name or sink label, for logs.
    fn name(&self) -> &str;
    /// Hand `payload` to the broker; Ok means the broker accepted it.
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;
}
