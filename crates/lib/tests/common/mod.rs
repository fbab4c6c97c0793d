//! Shared fixtures: a scripted agent runtime, recording/flaky sinks, and a consumer wired to
//! an in-memory broker.

#![allow(dead_code)]

use async_trait::async_trait;
use courier::config::Config;
use courier::consumer::Consumer;
use courier::envelope::{DeadLetter, OutboundEnvelope};
use courier::runtime::{AgentRuntime, RuntimeError, RuntimeSessionHandle};
use courier::service;
use courier::transport::{MemoryBroker, MemorySink, OutboundSink, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const INBOUND: &str = "ag_queue";
pub const OUTBOUND: &str = "wb_queue";
pub const DEAD: &str = "dlx_queue";

/// Ordered record of runtime turns and publishes, shared between fixtures.
pub type Events = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
pub struct Turn {
    pub handle: String,
    pub prompt: String,
}

/// Runtime that answers every prompt after `delay`, failing on demand, and records what it saw.
pub struct ScriptedRuntime {
    delay: Duration,
    events: Events,
    creates: Mutex<HashMap<String, usize>>,
    closed: Mutex<Vec<String>>,
    turns: Mutex<Vec<Turn>>,
    /// Errors to return, in order, for prompts ending with the given message text.
    failures: Mutex<HashMap<String, VecDeque<RuntimeError>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    active_handles: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(delay: Duration) -> Self {
        Self::with_events(delay, Events::default())
    }

    pub fn with_events(delay: Duration, events: Events) -> Self {
        Self {
            delay,
            events,
            creates: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            turns: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            active_handles: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
        }
    }

    /// Fail the next turns for message `text` with `errors`, one per turn.
    pub fn fail(&self, text: &str, errors: impl IntoIterator<Item = RuntimeError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(text.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn creates(&self, key: &str) -> usize {
        self.creates.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Times a turn started while another turn for the same session was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, prompt: &str) -> Option<RuntimeError> {
        let text = message_text(prompt);
        self.failures
            .lock()
            .unwrap()
            .get_mut(text)
            .and_then(|q| q.pop_front())
    }
}

/// Text after the "Current Message from <name>: " prefix on the prompt's last line.
pub fn message_text(prompt: &str) -> &str {
    let last = prompt.lines().last().unwrap_or_default();
    last.split_once(": ").map(|(_, t)| t).unwrap_or(last)
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_session(
        &self,
        app_name: &str,
        conversation_key: &str,
    ) -> Result<RuntimeSessionHandle, RuntimeError> {
        *self
            .creates
            .lock()
            .unwrap()
            .entry(conversation_key.to_string())
            .or_default() += 1;
        Ok(RuntimeSessionHandle::new(format!("{}:{}", app_name, conversation_key)))
    }

    async fn run_turn(
        &self,
        handle: &RuntimeSessionHandle,
        prompt: &str,
    ) -> Result<String, RuntimeError> {
        let text = message_text(prompt).to_string();
        self.turns.lock().unwrap().push(Turn {
            handle: handle.to_string(),
            prompt: prompt.to_string(),
        });
        if !self.active_handles.lock().unwrap().insert(handle.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start {}", text));

        tokio::time::sleep(self.delay).await;
        let result = match self.scripted_failure(prompt) {
            Some(e) => Err(e),
            None => Ok(format!("echo {}", text)),
        };

        self.events.lock().unwrap().push(format!("end {}", text));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.active_handles.lock().unwrap().remove(handle.as_str());
        result
    }

    async fn close_session(&self, handle: &RuntimeSessionHandle) {
        self.closed.lock().unwrap().push(handle.to_string());
    }
}

/// Sink that fails its first `failures` sends, then forwards to `inner`.
pub struct FlakySink {
    inner: Arc<dyn OutboundSink>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: Arc<dyn OutboundSink>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundSink for FlakySink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Publish {
                queue: self.name().to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.inner.send(payload).await
    }
}

/// Sink that notes each published reply in `events` before forwarding.
pub struct RecordingSink {
    inner: MemorySink,
    events: Events,
}

impl RecordingSink {
    pub fn new(inner: MemorySink, events: Events) -> Self {
        Self { inner, events }
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.inner.send(payload).await?;
        if let Ok(out) = serde_json::from_slice::<OutboundEnvelope>(payload) {
            self.events
                .lock()
                .unwrap()
                .push(format!("published {}", out.response_to_message_id));
        }
        Ok(())
    }
}

/// Defaults with short backoffs so paused-time tests stay quick.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.broker.inbound_queue = INBOUND.to_string();
    config.broker.outbound_queue = OUTBOUND.to_string();
    config.broker.dead_letter_queue = Some(DEAD.to_string());
    config.retry.initial_backoff_ms = 100;
    config.retry.max_backoff_ms = 1_000;
    config.publish.initial_backoff_ms = 10;
    config.publish.max_backoff_ms = 50;
    config.status.enabled = false;
    config
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub runtime: Arc<ScriptedRuntime>,
    pub consumer: Consumer,
}

impl Harness {
    pub fn new(config: &Config, runtime: ScriptedRuntime) -> Self {
        let broker = MemoryBroker::new();
        let outbound: Arc<dyn OutboundSink> = Arc::new(broker.sink(OUTBOUND));
        Self::with_outbound(config, runtime, broker, outbound)
    }

    pub fn with_outbound(
        config: &Config,
        runtime: ScriptedRuntime,
        broker: MemoryBroker,
        outbound: Arc<dyn OutboundSink>,
    ) -> Self {
        let runtime = Arc::new(runtime);
        let consumer = service::build_consumer(
            config,
            runtime.clone(),
            outbound,
            Arc::new(broker.sink(DEAD)),
        );
        Self {
            broker,
            runtime,
            consumer,
        }
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.broker.push(INBOUND, payload).unwrap();
    }

    /// Close the inbound queue and consume until every message is settled.
    pub async fn run_to_end(&self) {
        self.broker.close(INBOUND);
        self.consumer
            .run(self.broker.source(INBOUND), CancellationToken::new())
            .await
            .unwrap();
    }

    pub fn replies(&self) -> Vec<OutboundEnvelope> {
        self.broker
            .drain(OUTBOUND)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.broker
            .drain(DEAD)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

/// Flat inbound envelope.
pub fn inbound(message_id: &str, key: &str, text: &str) -> Vec<u8> {
    serde_json::json!({
        "messageId": message_id,
        "conversationKey": key,
        "displayName": "Ana",
        "text": text,
    })
    .to_string()
    .into_bytes()
}
