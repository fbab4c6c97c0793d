//! Queue consumer: pulls deliveries, drives each message through the pipeline, and settles it.
//!
//! Per message: decode, take a place in the conversation's line, wait for admission, resolve
//! the session, invoke the agent, publish the reply, then ack. Decoding and the place in line
//! happen in the pull loop so a conversation's replies follow pull order; everything after
//! runs in one task per message. Pull rate is bounded by a prefetch semaphore, so a slow
//! runtime slows intake instead of buffering.
//!
//! Retry, dead-letter and drop decisions are made here and nowhere else.

use crate::agent::AgentInvoker;
use crate::envelope::{decode_inbound, now_millis, DeadLetter, EnvelopeError, InboundEnvelope, OutboundEnvelope};
use crate::error::ProcessError;
use crate::limiter::{AdmitError, ConcurrencyLimiter, Reservation};
use crate::publisher::Publisher;
use crate::retry::{Decision, RetryPolicy};
use crate::session::{MessageStatus, SessionStore};
use crate::transport::{Delivery, InboundSource, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pull-loop pause after a message is refused as overloaded.
const OVERLOAD_PAUSE: Duration = Duration::from_millis(250);
const DEFAULT_PREFETCH_BUFFER: usize = 2;
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// How a message's life in this process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reply published, original acked.
    Acked,
    /// Already handled earlier; acked without invoking.
    Duplicate,
    /// Malformed; acked and dropped.
    Dropped,
    /// Requeued as delivery `attempt`.
    Retried { attempt: u32 },
    DeadLettered,
    /// Dead-letter publish failed; requeued without bumping the attempt.
    Deferred,
    /// Handed back unchanged (shutdown).
    Released,
    /// Admission queue full; handed back unchanged.
    Overloaded,
}

/// Lifetime counters, readable while the consumer runs.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    released: AtomicU64,
    overloaded: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub received: u64,
    pub acked: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub released: u64,
    pub overloaded: u64,
}

impl ConsumerStats {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Acked => &self.acked,
            Outcome::Duplicate => &self.duplicates,
            Outcome::Dropped => &self.dropped,
            Outcome::Retried { .. } => &self.retried,
            Outcome::DeadLettered => &self.dead_lettered,
            Outcome::Deferred => &self.deferred,
            Outcome::Released => &self.released,
            Outcome::Overloaded => &self.overloaded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConsumerSnapshot {
            received: get(&self.received),
            acked: get(&self.acked),
            duplicates: get(&self.duplicates),
            dropped: get(&self.dropped),
            retried: get(&self.retried),
            dead_lettered: get(&self.dead_lettered),
            deferred: get(&self.deferred),
            released: get(&self.released),
            overloaded: get(&self.overloaded),
        }
    }
}

/// Result of the pull-loop stage that must run in pull order.
enum Staged {
    Malformed(EnvelopeError),
    Overloaded(InboundEnvelope, AdmitError),
    Admitting(InboundEnvelope, Reservation),
}

enum Handled {
    Published,
    Duplicate,
}

struct Pipeline {
    store: Arc<SessionStore>,
    limiter: ConcurrencyLimiter,
    invoker: AgentInvoker,
    publisher: Publisher,
    dead_letters: Publisher,
    retry: RetryPolicy,
    stats: Arc<ConsumerStats>,
}

fn settled(result: Result<(), TransportError>, action: &str, message_id: &str) {
    if let Err(e) = result {
        log::warn!("consumer: {} for {} failed: {}", action, message_id, e);
    }
}

impl Pipeline {
    fn stage(&self, payload: &[u8]) -> Staged {
        let envelope = match decode_inbound(payload) {
            Ok(e) => e,
            Err(e) => return Staged::Malformed(e),
        };
        match self.limiter.reserve(&envelope.conversation_key) {
            Ok(r) => Staged::Admitting(envelope, r),
            Err(e) => Staged::Overloaded(envelope, e),
        }
    }

    async fn process(&self, delivery: Delivery, staged: Staged, cancel: CancellationToken) -> Outcome {
        match staged {
            Staged::Malformed(e) => {
                log::warn!(
                    "consumer: dropping malformed message ({} bytes): {}",
                    delivery.payload.len(),
                    e
                );
                settled(delivery.ack().await, "ack", "malformed message");
                Outcome::Dropped
            }
            Staged::Overloaded(envelope, e) => {
                log::warn!("consumer: {} refused: {}", envelope.message_id, e);
                settled(delivery.release().await, "release", &envelope.message_id);
                Outcome::Overloaded
            }
            Staged::Admitting(envelope, reservation) => {
                self.run_admitted(delivery, envelope, reservation, cancel).await
            }
        }
    }

    async fn run_admitted(
        &self,
        delivery: Delivery,
        envelope: InboundEnvelope,
        reservation: Reservation,
        cancel: CancellationToken,
    ) -> Outcome {
        let id = envelope.message_id.as_str();
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            t = reservation.admitted() => t.ok(),
        };
        let Some(token) = token else {
            log::info!("consumer: {} released before admission", id);
            settled(delivery.release().await, "release", id);
            return Outcome::Released;
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.handle(&envelope, delivery.attempt) => Some(r),
        };
        drop(token);

        match result {
            None => {
                log::warn!("consumer: {} cancelled in flight, releasing for redelivery", id);
                settled(delivery.release().await, "release", id);
                Outcome::Released
            }
            Some(Ok(Handled::Published)) => {
                settled(delivery.ack().await, "ack", id);
                Outcome::Acked
            }
            Some(Ok(Handled::Duplicate)) => {
                log::info!("consumer: {} already published, acking duplicate", id);
                settled(delivery.ack().await, "ack", id);
                Outcome::Duplicate
            }
            Some(Err(e)) => self.fail(delivery, &envelope, e).await,
        }
    }

    /// Admitted work: everything between admission and ack.
    async fn handle(&self, envelope: &InboundEnvelope, attempt: u32) -> Result<Handled, ProcessError> {
        let started = Instant::now();
        let key = envelope.conversation_key.as_str();
        let id = envelope.message_id.as_str();
        let session = self.store.resolve(key).await?;
        let session_id = Some(session.runtime_session_handle.to_string());

        let reply = match self.store.message_status(key, id).await {
            MessageStatus::Published => return Ok(Handled::Duplicate),
            MessageStatus::Invoked(reply) => {
                log::info!("consumer: {} reply already computed, publishing it again", id);
                reply
            }
            MessageStatus::New => {
                log::debug!("consumer: {} admitted for {} (attempt {})", id, key, attempt);
                let reply = self.invoker.invoke(&session, envelope).await?;
                self.store.touch(key, id, &reply).await;
                reply
            }
        };

        let out = OutboundEnvelope::reply_to(envelope, reply, session_id, started.elapsed());
        self.publisher.publish(&out).await?;
        self.store.mark_published(key, id).await;
        log::info!(
            "consumer: {} answered to {} in {} ms (attempt {})",
            id,
            self.publisher.destination(),
            out.processing_millis,
            attempt
        );
        Ok(Handled::Published)
    }

    async fn fail(&self, delivery: Delivery, envelope: &InboundEnvelope, error: ProcessError) -> Outcome {
        let id = envelope.message_id.as_str();
        let attempt = delivery.attempt;
        // A payload without a timestamp decodes to "now" on every redelivery; the transport's
        // first-seen time keeps the age bound honest.
        let received_at = envelope.received_at_millis.min(delivery.first_seen_millis);
        match self.retry.decide(&error, attempt, received_at, now_millis()) {
            Decision::Retry { next_attempt, delay } => {
                log::warn!(
                    "consumer: {} failed on attempt {} [{}], retrying in {:?}: {}",
                    id,
                    attempt,
                    error.kind(),
                    delay,
                    error
                );
                settled(delivery.requeue(next_attempt, delay).await, "requeue", id);
                Outcome::Retried {
                    attempt: next_attempt,
                }
            }
            Decision::DeadLetter => self.dead_letter(delivery, envelope, &error).await,
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        envelope: &InboundEnvelope,
        error: &ProcessError,
    ) -> Outcome {
        let id = envelope.message_id.as_str();
        let letter = DeadLetter::new(
            Some(envelope),
            &delivery.payload,
            format!("{}: {}", error.kind(), error),
            delivery.attempt,
        );
        match self.dead_letters.publish_dead_letter(&letter).await {
            Ok(()) => {
                log::error!(
                    "consumer: {} dead-lettered to {} after {} attempt(s): {}",
                    id,
                    self.dead_letters.destination(),
                    delivery.attempt,
                    error
                );
                settled(delivery.ack().await, "ack", id);
                Outcome::DeadLettered
            }
            Err(e) => {
                log::error!("consumer: dead-letter publish for {} failed, requeueing: {}", id, e);
                let attempt = delivery.attempt;
                settled(
                    delivery.requeue(attempt, self.retry.backoff.max).await,
                    "requeue",
                    id,
                );
                Outcome::Deferred
            }
        }
    }
}

/// Drives an inbound source through the pipeline until shutdown or end of input.
pub struct Consumer {
    pipeline: Arc<Pipeline>,
    prefetch: usize,
    grace: Duration,
}

impl Consumer {
    pub fn new(
        store: Arc<SessionStore>,
        limiter: ConcurrencyLimiter,
        invoker: AgentInvoker,
        publisher: Publisher,
        dead_letters: Publisher,
        retry: RetryPolicy,
    ) -> Self {
        let prefetch = limiter.capacity() + DEFAULT_PREFETCH_BUFFER;
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                limiter,
                invoker,
                publisher,
                dead_letters,
                retry,
                stats: Arc::new(ConsumerStats::default()),
            }),
            prefetch,
            grace: DEFAULT_GRACE,
        }
    }

    /// Max deliveries held at once (admitted plus waiting).
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// How long in-flight messages may finish after shutdown before they are cancelled.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.pipeline.stats.clone()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.pipeline.limiter
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.pipeline.store
    }

    /// Consume until `shutdown` fires or the source ends. On the way out, stop pulling, let
    /// in-flight messages finish within the grace period, then cancel the rest and hand their
    /// deliveries back for redelivery.
    pub async fn run<S: InboundSource>(
        &self,
        mut source: S,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let prefetch = Arc::new(Semaphore::new(self.prefetch));
        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        log::info!(
            "consumer: started (cap {}, prefetch {})",
            self.pipeline.limiter.capacity(),
            self.prefetch
        );

        let result = loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                p = prefetch.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break Ok(()),
                },
            };
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                d = source.recv() => match d {
                    Ok(Some(d)) => d,
                    Ok(None) => {
                        log::info!("consumer: inbound source closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            };
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            self.pipeline.stats.received.fetch_add(1, Ordering::Relaxed);
            let staged = self.pipeline.stage(&delivery.payload);
            let overloaded = matches!(staged, Staged::Overloaded(..));
            let pipeline = self.pipeline.clone();
            let task_cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = pipeline.process(delivery, staged, task_cancel).await;
                pipeline.stats.record(outcome);
                outcome
            });

            if overloaded {
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(OVERLOAD_PAUSE) => {}
                }
            }
        };

        if !tasks.is_empty() {
            log::info!(
                "consumer: stopped pulling, waiting up to {:?} for {} message(s)",
                self.grace,
                tasks.len()
            );
        }
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "consumer: grace period over, cancelling {} message(s)",
                tasks.len()
            );
            cancel.cancel();
            self.pipeline.limiter.close();
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        }
        log::info!("consumer: stopped");
        result
    }
}

fn log_join(joined: Result<Outcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => log::debug!("consumer: message finished: {:?}", outcome),
        Err(e) => log::error!("consumer: message task failed: {}", e),
    }
}
