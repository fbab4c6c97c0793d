//! Ollama-backed agent runtime (http://127.0.0.1:11434 by default).
//!
//! Ollama's chat API is stateless, so the runtime keeps each session's message history
//! in memory keyed by handle and replays it on every turn.

use super::{AgentRuntime, RuntimeError, RuntimeSessionHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3.2:latest";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("ollama request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ollama api error: {status} {body}")]
    Api { status: u16, body: String },
}

impl From<OllamaError> for RuntimeError {
    fn from(e: OllamaError) -> Self {
        match e {
            OllamaError::Request(ref inner) if inner.is_timeout() => {
                RuntimeError::Timeout(e.to_string())
            }
            OllamaError::Request(_) => RuntimeError::Unavailable(e.to_string()),
            OllamaError::Api { status, .. } if status == 408 || status >= 500 => {
                RuntimeError::Unavailable(e.to_string())
            }
            OllamaError::Api { .. } => RuntimeError::Rejected(e.to_string()),
        }
    }
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// POST /api/chat, non-streaming.
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatResponse, OllamaError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: model.to_string(),
            messages,
            stream: false,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(OllamaError::Api { status, body });
        }
        let data: ChatResponse = res.json().await?;
        Ok(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatResponse {
    /// Text content of the assistant message, if any.
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Agent runtime that runs turns against an Ollama model.
pub struct OllamaRuntime {
    client: OllamaClient,
    model: String,
    /// System prompt (AGENTS.md) prepended to every turn.
    instructions: Option<String>,
    /// Max user+assistant pairs replayed per turn.
    history_limit: usize,
    histories: RwLock<HashMap<RuntimeSessionHandle, Vec<ChatMessage>>>,
}

impl OllamaRuntime {
    pub fn new(
        client: OllamaClient,
        model: Option<String>,
        instructions: Option<String>,
        history_limit: usize,
    ) -> Self {
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                log::warn!("ollama runtime: no model configured, using {}", DEFAULT_MODEL);
                DEFAULT_MODEL.to_string()
            });
        Self {
            client,
            model,
            instructions: instructions.filter(|s| !s.trim().is_empty()),
            history_limit,
            histories: RwLock::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn session_count(&self) -> usize {
        self.histories.read().await.len()
    }
}

#[async_trait]
impl AgentRuntime for OllamaRuntime {
    async fn create_session(
        &self,
        app_name: &str,
        conversation_key: &str,
    ) -> Result<RuntimeSessionHandle, RuntimeError> {
        let handle = RuntimeSessionHandle::new(format!("{}:{}", app_name, conversation_key));
        self.histories
            .write()
            .await
            .entry(handle.clone())
            .or_default();
        log::debug!("ollama runtime: attached session {}", handle);
        Ok(handle)
    }

    async fn run_turn(
        &self,
        handle: &RuntimeSessionHandle,
        prompt: &str,
    ) -> Result<String, RuntimeError> {
        let history = self
            .histories
            .read()
            .await
            .get(handle)
            .cloned()
            .unwrap_or_default();
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(ref sys) = self.instructions {
            messages.push(ChatMessage::system(sys.as_str()));
        }
        messages.extend(history);
        messages.push(ChatMessage::user(prompt));

        let res = self.client.chat(&self.model, messages).await?;
        let reply = res.content().to_string();

        let mut g = self.histories.write().await;
        let entry = g.entry(handle.clone()).or_default();
        entry.push(ChatMessage::user(prompt));
        entry.push(ChatMessage::assistant(reply.as_str()));
        let max = self.history_limit.saturating_mul(2);
        if entry.len() > max {
            let excess = entry.len() - max;
            entry.drain(..excess);
        }
        Ok(reply)
    }

    async fn close_session(&self, handle: &RuntimeSessionHandle) {
        self.histories.write().await.remove(handle);
    }
}
