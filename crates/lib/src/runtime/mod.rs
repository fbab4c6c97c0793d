//! Agent runtime seam: the external collaborator that owns conversation state and generates replies.
//!
//! The orchestrator only ever creates/attaches a session and runs turns against it; the handle
//! it gets back is forwarded untouched.

mod ollama;

pub use ollama::{ChatMessage, OllamaClient, OllamaError, OllamaRuntime};

use async_trait::async_trait;
use std::fmt;

/// Opaque reference to a session inside the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeSessionHandle(String);

impl RuntimeSessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeSessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failures surfaced by a runtime call, classified at the point of origin.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Provider or network failure; worth retrying.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    /// The runtime refused the request (policy, quota, bad request).
    #[error("runtime rejected request: {0}")]
    Rejected(String),
    #[error("runtime timed out: {0}")]
    Timeout(String),
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create the runtime session for a conversation, or attach to it if it exists.
    /// Idempotent per (`app_name`, `conversation_key`).
    async fn create_session(
        &self,
        app_name: &str,
        conversation_key: &str,
    ) -> Result<RuntimeSessionHandle, RuntimeError>;

    /// Run one turn: prompt in, generated text out.
    async fn run_turn(
        &self,
        handle: &RuntimeSessionHandle,
        prompt: &str,
    ) -> Result<String, RuntimeError>;

    /// Release runtime-side state for a session dropped by the idle sweep.
    async fn close_session(&self, _handle: &RuntimeSessionHandle) {}
}
