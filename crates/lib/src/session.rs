//! Conversation sessions keyed by conversation key.
//!
//! Sessions are volatile: created on the first message for a key, updated after every
//! successful invocation, and only dropped by the optional idle sweep. The map lock is held
//! just long enough to find or insert an entry; each entry has its own lock, and the runtime
//! handle is created once per entry behind a `OnceCell` so concurrent resolves for the same
//! key never create two runtime sessions.

use crate::envelope::now_millis;
use crate::runtime::{AgentRuntime, RuntimeError, RuntimeSessionHandle};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub conversation_key: String,
    pub created_at_millis: i64,
    pub last_active_millis: i64,
    pub message_count: u64,
    pub runtime_session_handle: RuntimeSessionHandle,
}

/// What the store knows about a message id in a session (idempotency tracking).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Not seen (or tracking disabled).
    New,
    /// Invoked successfully; the reply has not been confirmed published.
    Invoked(String),
    Published,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub conversation_key: String,
    pub session_id: Option<String>,
    pub created_at_millis: i64,
    pub last_active_millis: i64,
    pub message_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_sessions: usize,
    pub sessions: Vec<SessionSummary>,
}

struct EntryState {
    last_active_millis: i64,
    message_count: u64,
    seen: HashMap<String, MessageStatus>,
    seen_order: VecDeque<String>,
}

struct SessionEntry {
    conversation_key: String,
    created_at_millis: i64,
    handle: OnceCell<RuntimeSessionHandle>,
    state: Mutex<EntryState>,
}

impl SessionEntry {
    fn new(conversation_key: &str, now: i64) -> Self {
        Self {
            conversation_key: conversation_key.to_string(),
            created_at_millis: now,
            handle: OnceCell::new(),
            state: Mutex::new(EntryState {
                last_active_millis: now,
                message_count: 0,
                seen: HashMap::new(),
                seen_order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, handle: RuntimeSessionHandle) -> Session {
        let s = self.lock();
        Session {
            conversation_key: self.conversation_key.clone(),
            created_at_millis: self.created_at_millis,
            last_active_millis: s.last_active_millis,
            message_count: s.message_count,
            runtime_session_handle: handle,
        }
    }
}

/// Options controlling idempotency tracking.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub idempotency: bool,
    pub seen_window: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idempotency: true,
            seen_window: 256,
        }
    }
}

/// In-memory session store. Created at process start, dropped at shutdown.
pub struct SessionStore {
    inner: RwLock<HashMap<String, Arc<SessionEntry>>>,
    runtime: Arc<dyn AgentRuntime>,
    app_name: String,
    options: SessionOptions,
}

impl SessionStore {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        app_name: impl Into<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            runtime,
            app_name: app_name.into(),
            options,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    async fn entry(&self, key: &str) -> Arc<SessionEntry> {
        if let Some(e) = self.inner.read().await.get(key) {
            return e.clone();
        }
        let mut g = self.inner.write().await;
        g.entry(key.to_string())
            .or_insert_with(|| {
                log::info!("sessions: created session for {}", key);
                Arc::new(SessionEntry::new(key, now_millis()))
            })
            .clone()
    }

    async fn existing(&self, key: &str) -> Option<Arc<SessionEntry>> {
        self.inner.read().await.get(key).cloned()
    }

    /// Return the session for `key`, creating it (and its runtime session) if absent.
    /// If runtime session creation fails the entry stays without a handle and the next
    /// resolve tries again.
    pub async fn resolve(&self, key: &str) -> Result<Session, RuntimeError> {
        let entry = self.entry(key).await;
        let handle = entry
            .handle
            .get_or_try_init(|| self.runtime.create_session(&self.app_name, key))
            .await?
            .clone();
        Ok(entry.snapshot(handle))
    }

    pub async fn get(&self, key: &str) -> Option<Session> {
        let entry = self.existing(key).await?;
        let handle = entry.handle.get()?.clone();
        Some(entry.snapshot(handle))
    }

    /// Record a successful invocation: bump `lastActiveMillis` and `messageCount`.
    /// With idempotency on, a message id already recorded is not counted twice and the
    /// reply is remembered until `mark_published`. Returns the message count.
    pub async fn touch(&self, key: &str, message_id: &str, reply: &str) -> u64 {
        let Some(entry) = self.existing(key).await else {
            log::warn!("sessions: touch for unknown session {}", key);
            return 0;
        };
        let mut s = entry.lock();
        s.last_active_millis = now_millis();
        if !self.options.idempotency {
            s.message_count += 1;
            return s.message_count;
        }
        if s.seen.contains_key(message_id) {
            return s.message_count;
        }
        s.message_count += 1;
        s.seen
            .insert(message_id.to_string(), MessageStatus::Invoked(reply.to_string()));
        s.seen_order.push_back(message_id.to_string());
        while s.seen_order.len() > self.options.seen_window.max(1) {
            if let Some(old) = s.seen_order.pop_front() {
                s.seen.remove(&old);
            }
        }
        s.message_count
    }

    /// The reply for `message_id` reached the outbound queue; forget its text.
    pub async fn mark_published(&self, key: &str, message_id: &str) {
        if !self.options.idempotency {
            return;
        }
        if let Some(entry) = self.existing(key).await {
            let mut s = entry.lock();
            if let Some(status) = s.seen.get_mut(message_id) {
                *status = MessageStatus::Published;
            }
        }
    }

    pub async fn message_status(&self, key: &str, message_id: &str) -> MessageStatus {
        if !self.options.idempotency {
            return MessageStatus::New;
        }
        let Some(entry) = self.existing(key).await else {
            return MessageStatus::New;
        };
        let status = entry.lock().seen.get(message_id).cloned();
        status.unwrap_or(MessageStatus::New)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn stats(&self) -> SessionStats {
        let g = self.inner.read().await;
        let mut sessions: Vec<SessionSummary> = g
            .values()
            .map(|e| {
                let s = e.lock();
                SessionSummary {
                    conversation_key: e.conversation_key.clone(),
                    session_id: e.handle.get().map(|h| h.to_string()),
                    created_at_millis: e.created_at_millis,
                    last_active_millis: s.last_active_millis,
                    message_count: s.message_count,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.conversation_key.cmp(&b.conversation_key));
        SessionStats {
            active_sessions: sessions.len(),
            sessions,
        }
    }

    /// Drop sessions idle for longer than `ttl` unless `is_busy` says work is in flight for them.
    /// Returns the dropped sessions so their runtime state can be released.
    pub async fn sweep_idle(
        &self,
        ttl: Duration,
        now_millis: i64,
        is_busy: impl Fn(&str) -> bool,
    ) -> Vec<Session> {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis.saturating_sub(ttl_millis);
        let mut g = self.inner.write().await;
        let stale: Vec<String> = g
            .iter()
            .filter(|(key, e)| e.lock().last_active_millis < cutoff && !is_busy(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(e) = g.remove(&key) {
                if let Some(handle) = e.handle.get() {
                    evicted.push(e.snapshot(handle.clone()));
                }
            }
        }
        if !evicted.is_empty() {
            log::info!("sessions: swept {} idle session(s)", evicted.len());
        }
        evicted
    }
}
