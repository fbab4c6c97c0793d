use super::{OutboundSink, TransportError};
use async_trait::async_trait;

/// Sink that writes each payload to the error log. Used for dead letters when no
/// dead-letter queue is configured.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl OutboundSink for LogSink {
    fn name(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        log::error!("{}: {}", self.label, String::from_utf8_lossy(payload));
        Ok(())
    }
}
