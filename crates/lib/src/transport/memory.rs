//! In-process broker with named queues, ack/requeue/release and delayed redelivery.
//!
//! Behaves like a single-node broker for one consumer per queue: messages handed out stay
//! unacked until settled, a released message goes back to its original position, and a
//! requeued one goes to the tail once its delay has passed. A queue reports closed to
//! readers only after it is closed, empty, and has nothing unacked or scheduled.

use super::{Acknowledger, Delivery, InboundSource, OutboundSink, TransportError};
use crate::envelope::now_millis;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Queued {
    sequence: u64,
    attempt: u32,
    /// Stamped on first hand-out.
    first_seen_millis: Option<i64>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_sequence: u64,
    ready: VecDeque<Queued>,
    unacked: usize,
    scheduled: usize,
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, payload: Vec<u8>, attempt: u32, first_seen_millis: Option<i64>) {
        self.next_sequence += 1;
        self.ready.push_back(Queued {
            sequence: self.next_sequence,
            attempt,
            first_seen_millis,
            payload,
        });
    }

    /// Put a released message back ahead of everything that arrived after it.
    fn reinsert(&mut self, msg: Queued) {
        let at = self
            .ready
            .iter()
            .position(|q| q.sequence > msg.sequence)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, msg);
    }

    fn drained(&self) -> bool {
        self.ready.is_empty() && self.unacked == 0 && self.scheduled == 0
    }
}

#[derive(Default)]
struct MemoryQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl MemoryQueue {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let r = f(&mut self.lock_state());
        self.changed.notify_waiters();
        r
    }

    /// Wait for a ready message. None once closed and drained.
    async fn pop(&self) -> Option<Queued> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.lock_state();
                if let Some(msg) = s.ready.pop_front() {
                    s.unacked += 1;
                    return Some(msg);
                }
                if s.closed && s.drained() {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Cloneable handle to a set of named in-memory queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<MemoryQueue>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        let mut g = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        g.entry(name.to_string()).or_default().clone()
    }

    /// Publish a fresh message (attempt 1).
    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let payload = payload.into();
        self.queue(queue).update(|s| {
            if s.closed {
                return Err(TransportError::Closed(queue.to_string()));
            }
            s.enqueue(payload, 1, None);
            Ok(())
        })
    }

    /// No more publishes; readers see the end once in-flight messages settle.
    pub fn close(&self, queue: &str) {
        self.queue(queue).update(|s| s.closed = true);
    }

    pub fn source(&self, queue: &str) -> MemorySource {
        MemorySource {
            queue: self.queue(queue),
        }
    }

    pub fn sink(&self, queue: &str) -> MemorySink {
        MemorySink {
            name: queue.to_string(),
            broker: self.clone(),
        }
    }

    /// Pop and ack the next message, waiting for one. None once closed and drained.
    pub async fn next(&self, queue: &str) -> Option<Vec<u8>> {
        let q = self.queue(queue);
        let msg = q.pop().await?;
        q.update(|s| s.unacked -= 1);
        Some(msg.payload)
    }

    /// Take every ready message without waiting.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue)
            .update(|s| s.ready.drain(..).map(|m| m.payload).collect())
    }

    /// Ready (not handed out) messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.queue(queue).lock_state().ready.len()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.queue(queue).lock_state().unacked
    }

    /// Wait until nothing is ready, unacked, or scheduled on `queue`.
    pub async fn settled(&self, queue: &str) {
        let q = self.queue(queue);
        loop {
            let notified = q.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if q.lock_state().drained() {
                return;
            }
            notified.await;
        }
    }
}

pub struct MemorySource {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl InboundSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        let Some(mut msg) = self.queue.pop().await else {
            return Ok(None);
        };
        let first_seen = *msg.first_seen_millis.get_or_insert_with(now_millis);
        let acker = MemoryAcker {
            queue: self.queue.clone(),
            msg: Some(msg.clone()),
        };
        Ok(Some(Delivery::new(
            msg.payload,
            msg.attempt,
            Some(first_seen),
            Box::new(acker),
        )))
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    /// Taken once settled.
    msg: Option<Queued>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.msg.take();
        this.queue.update(|s| s.unacked -= 1);
        Ok(())
    }

    async fn requeue(
        self: Box<Self>,
        payload: Vec<u8>,
        next_attempt: u32,
        first_seen_millis: i64,
        delay: Duration,
    ) -> Result<(), TransportError> {
        let mut this = self;
        this.msg.take();
        this.queue.update(|s| {
            s.unacked -= 1;
            s.scheduled += 1;
        });
        let queue = this.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.update(|s| {
                s.scheduled -= 1;
                s.enqueue(payload, next_attempt, Some(first_seen_millis));
            });
        });
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), TransportError> {
        // Drop puts it back.
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            self.queue.update(|s| {
                s.unacked -= 1;
                s.reinsert(msg);
            });
        }
    }
}

#[derive(Clone)]
pub struct MemorySink {
    name: String,
    broker: MemoryBroker,
}

#[async_trait]
impl OutboundSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.broker.push(&self.name, payload.to_vec())
    }
}
