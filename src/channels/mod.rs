//! Message transports the orchestrator replies through.

pub mod console;

pub use console::ConsoleTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user message as it arrives from a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    pub participant_id: String,
    pub channel: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        channel: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            channel: channel.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub session_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;

    /// Send a message and return an id for later editing.
    /// Default: sends normally, returns None (no editing support).
    async fn send_and_get_id(&self, msg: &OutboundMessage) -> anyhow::Result<Option<String>> {
        self.send(msg).await?;
        Ok(None)
    }

    /// Replace the content of a previously sent message.
    async fn edit_message(
        &self,
        _session_id: &str,
        _message_id: &str,
        _content: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether partial replies can be delivered by editing in place.
    fn supports_editing(&self) -> bool {
        false
    }
}
