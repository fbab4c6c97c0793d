//! Admission control: a global cap on in-flight invocations plus per-conversation exclusivity.
//!
//! Each conversation key has a lane that hands out tickets in call order. `reserve` takes a
//! ticket synchronously, so a caller that reserves in pull order gets replies in pull order
//! even though the waiting happens in separate tasks. A ticket's turn comes when every earlier
//! ticket for the key has been released or abandoned; only then does it queue for a global
//! slot. Tokens and reservations release on drop, so every exit path (error, panic,
//! cancellation) frees both the slot and the lane.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AdmitError {
    #[error("overloaded: {queued} message(s) already waiting for admission (limit {limit})")]
    Overloaded { queued: usize, limit: usize },
    #[error("limiter closed")]
    Closed,
}

struct Lane {
    next_ticket: u64,
    serving: watch::Sender<u64>,
    /// Tickets dropped before their turn; skipped when the lane advances.
    abandoned: BTreeSet<u64>,
}

struct Shared {
    slots: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, Lane>>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    capacity: usize,
    max_queued: usize,
}

impl Shared {
    fn lanes(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the lane to the next live ticket, or drop the lane when nobody is waiting.
    fn advance(&self, key: &str) {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(key) else {
            return;
        };
        let mut next = *lane.serving.borrow() + 1;
        while lane.abandoned.remove(&next) {
            next += 1;
        }
        if next >= lane.next_ticket {
            lanes.remove(key);
        } else {
            lane.serving.send_replace(next);
        }
    }

    fn abandon(&self, key: &str, ticket: u64) {
        let is_turn = {
            let mut lanes = self.lanes();
            match lanes.get_mut(key) {
                Some(lane) if *lane.serving.borrow() == ticket => true,
                Some(lane) => {
                    lane.abandoned.insert(ticket);
                    false
                }
                None => false,
            }
        };
        if is_turn {
            self.advance(key);
        }
    }
}

/// Cloneable handle to the shared limiter.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
}

impl ConcurrencyLimiter {
    /// `capacity` invocations may run at once; at most `max_queued` may wait for admission.
    pub fn new(capacity: usize, max_queued: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(capacity)),
                lanes: Mutex::new(HashMap::new()),
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                capacity,
                max_queued,
            }),
        }
    }

    /// Take a place in line for `key` without waiting. Fails when the admission queue is full.
    pub fn reserve(&self, key: &str) -> Result<Reservation, AdmitError> {
        let queued = self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if queued >= self.shared.max_queued {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(AdmitError::Overloaded {
                queued,
                limit: self.shared.max_queued,
            });
        }
        let mut lanes = self.shared.lanes();
        let lane = lanes.entry(key.to_string()).or_insert_with(|| Lane {
            next_ticket: 0,
            serving: watch::channel(0).0,
            abandoned: BTreeSet::new(),
        });
        let ticket = lane.next_ticket;
        lane.next_ticket += 1;
        let turn = lane.serving.subscribe();
        Ok(Reservation {
            shared: self.shared.clone(),
            key: key.to_string(),
            ticket,
            turn,
            done: false,
        })
    }

    /// Reserve and wait for admission.
    pub async fn admit(&self, key: &str) -> Result<AdmissionToken, AdmitError> {
        self.reserve(key)?.admitted().await
    }

    /// Wake every waiter with `Closed`; used when shutting down.
    pub fn close(&self) {
        self.shared.slots.close();
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// True while any work for `key` is admitted or waiting.
    pub fn is_busy(&self, key: &str) -> bool {
        self.shared.lanes().contains_key(key)
    }
}

/// A place in a conversation's line. Dropping it before admission gives up the place.
pub struct Reservation {
    shared: Arc<Shared>,
    key: String,
    ticket: u64,
    turn: watch::Receiver<u64>,
    done: bool,
}

impl Reservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for this conversation's turn, then for a global slot.
    pub async fn admitted(mut self) -> Result<AdmissionToken, AdmitError> {
        loop {
            if *self.turn.borrow_and_update() == self.ticket {
                break;
            }
            if self.turn.changed().await.is_err() {
                break;
            }
        }
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmitError::Closed)?;
        self.done = true;
        self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionToken {
            shared: self.shared.clone(),
            key: std::mem::take(&mut self.key),
            _permit: permit,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        self.shared.abandon(&self.key, self.ticket);
    }
}

/// Scoped admission: holds a global slot and the conversation's lane until dropped.
pub struct AdmissionToken {
    shared: Arc<Shared>,
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.advance(&self.key);
    }
}
