//! Message envelopes crossing the queue boundary: decode inbound, encode outbound and dead letters.
//!
//! Two inbound shapes are accepted. The flat shape carries `conversationKey` directly; the
//! webhook shape nests it under `contact.remoteJid` (falling back to `contact.phoneNumber`).
//! Either way `messageId` and the conversation key are required and non-empty.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Epoch timestamps below this are taken to be seconds rather than millis.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> EnvelopeError {
    EnvelopeError::Malformed(msg.into())
}

/// One prior turn supplied by the producer (`context.conversationHistory`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Producer-side context attached to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub user_notes: Option<String>,
    pub history: Vec<HistoryEntry>,
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub message_id: String,
    pub conversation_key: String,
    pub display_name: Option<String>,
    pub text: String,
    pub received_at_millis: i64,
    pub context: ConversationContext,
}

/// Reply published to the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    /// `resp-<inbound messageId>`.
    pub message_id: String,
    pub response_to_message_id: String,
    pub conversation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub text: String,
    pub produced_at_millis: i64,
    pub processing_millis: u64,
    pub status: String,
    /// Runtime session handle the reply was generated in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl OutboundEnvelope {
    /// Build the reply for `inbound`.
    pub fn reply_to(
        inbound: &InboundEnvelope,
        text: impl Into<String>,
        session_id: Option<String>,
        processing: Duration,
    ) -> Self {
        Self {
            message_id: format!("resp-{}", inbound.message_id),
            response_to_message_id: inbound.message_id.clone(),
            conversation_key: inbound.conversation_key.clone(),
            display_name: inbound.display_name.clone(),
            text: text.into(),
            produced_at_millis: now_millis(),
            processing_millis: processing.as_millis() as u64,
            status: "success".to_string(),
            session_id,
        }
    }
}

/// Record written to the dead-letter destination once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// None when the payload could not be decoded far enough to find an id.
    pub original_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
    pub last_error: String,
    pub attempt_count: u32,
    pub dead_lettered_at_millis: i64,
    /// Original payload (lossy UTF-8).
    pub payload: String,
}

impl DeadLetter {
    pub fn new(
        envelope: Option<&InboundEnvelope>,
        payload: &[u8],
        last_error: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            original_message_id: envelope.map(|e| e.message_id.clone()),
            conversation_key: envelope.map(|e| e.conversation_key.clone()),
            last_error: last_error.into(),
            attempt_count,
            dead_lettered_at_millis: now_millis(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextWire {
    #[serde(default)]
    user_notes: Option<String>,
    #[serde(default)]
    conversation_history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatWire {
    message_id: Option<String>,
    conversation_key: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    received_at_millis: Option<i64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    context: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactWire {
    #[serde(default)]
    remote_jid: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageWire {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedWire {
    message_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    contact: ContactWire,
    #[serde(default)]
    message: Option<MessageWire>,
    #[serde(default)]
    context: Option<ContextWire>,
}

/// Blank counts as missing; the value itself is kept as sent.
fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn to_millis(ts: i64) -> i64 {
    if ts < SECONDS_CUTOFF {
        ts.saturating_mul(1000)
    } else {
        ts
    }
}

fn context_from(wire: Option<ContextWire>) -> ConversationContext {
    match wire {
        Some(c) => ConversationContext {
            user_notes: non_empty(c.user_notes),
            history: c.conversation_history,
        },
        None => ConversationContext::default(),
    }
}

/// Decode and validate an inbound payload. Any missing required field, wrong-typed field,
/// or unparseable payload is rejected as a whole.
pub fn decode_inbound(raw: &[u8]) -> Result<InboundEnvelope, EnvelopeError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| malformed(format!("not json: {}", e)))?;
    if !value.is_object() {
        return Err(malformed("payload is not an object"));
    }
    if value.get("contact").is_some() {
        decode_nested(value)
    } else {
        decode_flat(value)
    }
}

fn decode_flat(value: serde_json::Value) -> Result<InboundEnvelope, EnvelopeError> {
    let wire: FlatWire = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    let message_id = non_empty(wire.message_id).ok_or_else(|| malformed("missing messageId"))?;
    let conversation_key =
        non_empty(wire.conversation_key).ok_or_else(|| malformed("missing conversationKey"))?;
    let received_at_millis = wire
        .received_at_millis
        .or(wire.timestamp.map(to_millis))
        .unwrap_or_else(now_millis);
    Ok(InboundEnvelope {
        message_id,
        conversation_key,
        display_name: non_empty(wire.display_name),
        text: wire.text.unwrap_or_default(),
        received_at_millis,
        context: context_from(wire.context),
    })
}

fn decode_nested(value: serde_json::Value) -> Result<InboundEnvelope, EnvelopeError> {
    let wire: NestedWire = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    let message_id = non_empty(wire.message_id).ok_or_else(|| malformed("missing messageId"))?;
    let conversation_key = non_empty(wire.contact.remote_jid)
        .or_else(|| non_empty(wire.contact.phone_number))
        .ok_or_else(|| malformed("missing contact.remoteJid"))?;
    let (text, message_ts) = match wire.message {
        Some(m) => (m.text.unwrap_or_default(), m.timestamp),
        None => (String::new(), None),
    };
    let received_at_millis = message_ts
        .or(wire.timestamp)
        .map(to_millis)
        .unwrap_or_else(now_millis);
    Ok(InboundEnvelope {
        message_id,
        conversation_key,
        display_name: non_empty(wire.contact.name),
        text,
        received_at_millis,
        context: context_from(wire.context),
    })
}

/// Serialize an outbound envelope.
pub fn encode_outbound(envelope: &OutboundEnvelope) -> Vec<u8> {
    serde_json::to_vec(envelope).unwrap_or_else(|_| b"{}".to_vec())
}

pub fn encode_dead_letter(letter: &DeadLetter) -> Vec<u8> {
    serde_json::to_vec(letter).unwrap_or_else(|_| b"{}".to_vec())
}
