//! Publisher: hands encoded envelopes to an outbound sink, retrying broker failures with
//! backoff up to a small ceiling. At-least-once: a retried send may duplicate.

use crate::config::PublishConfig;
use crate::envelope::{encode_dead_letter, encode_outbound, DeadLetter, OutboundEnvelope};
use crate::retry::Backoff;
use crate::transport::{OutboundSink, TransportError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[error("publish to {queue} failed after {attempts} attempt(s): {last}")]
pub struct PublishError {
    pub queue: String,
    pub attempts: u32,
    #[source]
    pub last: TransportError,
}

#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn OutboundSink>,
    attempts: u32,
    backoff: Backoff,
}

impl Publisher {
    /// `attempts` counts the first send.
    pub fn new(sink: Arc<dyn OutboundSink>, attempts: u32, backoff: Backoff) -> Self {
        Self {
            sink,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(sink: Arc<dyn OutboundSink>, config: &PublishConfig) -> Self {
        Self::new(sink, config.attempts, Backoff::from(config))
    }

    pub fn destination(&self) -> &str {
        self.sink.name()
    }

    pub async fn publish(&self, envelope: &OutboundEnvelope) -> Result<(), PublishError> {
        self.send(&encode_outbound(envelope)).await
    }

    pub async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        self.send(&encode_dead_letter(letter)).await
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), PublishError> {
        let mut attempt = 1;
        loop {
            match self.sink.send(payload).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => {
                    return Err(PublishError {
                        queue: self.sink.name().to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    log::warn!(
                        "publisher: send to {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.sink.name(),
                        attempt,
                        self.attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
