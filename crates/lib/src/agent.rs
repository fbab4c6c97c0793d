//! Agent invoker: build the turn prompt for an inbound envelope and run it against the
//! session's runtime handle, bounded by a timeout.

use crate::envelope::InboundEnvelope;
use crate::runtime::{AgentRuntime, RuntimeError};
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;

/// Substituted when the runtime answers with nothing.
pub const EMPTY_REPLY_FALLBACK: &str = "I processed your request successfully.";

/// Producer-supplied history entries embedded in the prompt.
const PROMPT_HISTORY: usize = 5;

/// Build the prompt for one turn. `message_count` is the session's count before this message.
pub fn build_prompt(envelope: &InboundEnvelope, message_count: u64) -> String {
    let name = envelope
        .display_name
        .as_deref()
        .unwrap_or(envelope.conversation_key.as_str());
    let mut parts = Vec::new();
    if let Some(notes) = &envelope.context.user_notes {
        parts.push(format!("User Context: {}", notes));
    }
    let history = &envelope.context.history;
    if !history.is_empty() {
        parts.push("\nRecent Conversation:".to_string());
        let start = history.len().saturating_sub(PROMPT_HISTORY);
        for entry in &history[start..] {
            parts.push(format!("- {}", entry.content));
        }
    }
    parts.push(format!(
        "\nMessage {} in this conversation.",
        message_count + 1
    ));
    parts.push(format!("Current Message from {}: {}", name, envelope.text));
    parts.join("\n")
}

/// Hands prompts to the agent runtime. Cheap to clone.
#[derive(Clone)]
pub struct AgentInvoker {
    runtime: Arc<dyn AgentRuntime>,
    timeout: Duration,
}

impl AgentInvoker {
    pub fn new(runtime: Arc<dyn AgentRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Run one turn for `envelope` in `session`. A turn that outlives the timeout is abandoned
    /// and reported as `RuntimeError::Timeout`.
    pub async fn invoke(
        &self,
        session: &Session,
        envelope: &InboundEnvelope,
    ) -> Result<String, RuntimeError> {
        let prompt = build_prompt(envelope, session.message_count);
        log::debug!(
            "agent: turn for {} in {} ({} chars)",
            envelope.message_id,
            session.runtime_session_handle,
            prompt.len()
        );
        let turn = self
            .runtime
            .run_turn(&session.runtime_session_handle, &prompt);
        let reply = match tokio::time::timeout(self.timeout, turn).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(RuntimeError::Timeout(format!(
                    "no reply within {}s",
                    self.timeout.as_secs_f32()
                )))
            }
        };
        if reply.trim().is_empty() {
            log::warn!("agent: empty reply for {}, using fallback", envelope.message_id);
            return Ok(EMPTY_REPLY_FALLBACK.to_string());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ConversationContext, HistoryEntry};
    use crate::runtime::RuntimeSessionHandle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedRuntime {
        reply: Result<String, RuntimeError>,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedRuntime {
        fn new(reply: Result<String, RuntimeError>) -> Self {
            Self {
                reply,
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for FixedRuntime {
        async fn create_session(
            &self,
            _app: &str,
            key: &str,
        ) -> Result<RuntimeSessionHandle, RuntimeError> {
            Ok(RuntimeSessionHandle::new(key))
        }

        async fn run_turn(
            &self,
            _handle: &RuntimeSessionHandle,
            prompt: &str,
        ) -> Result<String, RuntimeError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn envelope(text: &str) -> InboundEnvelope {
        InboundEnvelope {
            message_id: "m1".to_string(),
            conversation_key: "u1".to_string(),
            display_name: None,
            text: text.to_string(),
            received_at_millis: 0,
            context: ConversationContext::default(),
        }
    }

    fn session() -> Session {
        Session {
            conversation_key: "u1".to_string(),
            created_at_millis: 0,
            last_active_millis: 0,
            message_count: 2,
            runtime_session_handle: RuntimeSessionHandle::new("app:u1"),
        }
    }

    #[test]
    fn prompt_embeds_text_name_and_count() {
        let mut env = envelope("hi");
        env.display_name = Some("Ana".to_string());
        let prompt = build_prompt(&env, 2);
        assert!(prompt.contains("Message 3 in this conversation."));
        assert!(prompt.ends_with("Current Message from Ana: hi"));
        assert!(!prompt.contains("User Context"));
    }

    #[test]
    fn prompt_falls_back_to_key_and_keeps_last_five_history_entries() {
        let mut env = envelope("now");
        env.context.user_notes = Some("prefers mornings".to_string());
        env.context.history = (0..7)
            .map(|i| HistoryEntry {
                role: "user".to_string(),
                content: format!("h{}", i),
            })
            .collect();
        let prompt = build_prompt(&env, 0);
        assert!(prompt.starts_with("User Context: prefers mornings"));
        assert!(!prompt.contains("- h1"));
        assert!(prompt.contains("- h2"));
        assert!(prompt.contains("- h6"));
        assert!(prompt.contains("Current Message from u1: now"));
    }

    #[tokio::test]
    async fn empty_reply_uses_fallback() {
        let rt = Arc::new(FixedRuntime::new(Ok("  ".to_string())));
        let invoker = AgentInvoker::new(rt.clone(), Duration::from_secs(5));
        let reply = invoker.invoke(&session(), &envelope("hi")).await.unwrap();
        assert_eq!(reply, EMPTY_REPLY_FALLBACK);
        assert_eq!(rt.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runtime_errors_pass_through() {
        let rt = Arc::new(FixedRuntime::new(Err(RuntimeError::Rejected("policy".into()))));
        let invoker = AgentInvoker::new(rt, Duration::from_secs(5));
        let err = invoker.invoke(&session(), &envelope("hi")).await.unwrap_err();
        assert_eq!(err, RuntimeError::Rejected("policy".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_turn_times_out() {
        let mut rt = FixedRuntime::new(Ok("late".to_string()));
        rt.delay = Duration::from_secs(60);
        let invoker = AgentInvoker::new(Arc::new(rt), Duration::from_secs(2));
        let err = invoker.invoke(&session(), &envelope("hi")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
    }
}
