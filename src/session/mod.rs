pub mod store;
mod turn;

pub use store::{InMemorySessionStore, SessionStore};
pub use turn::{Role, Turn};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One conversation thread. Only the orchestrator handling the session
/// mutates it; durability belongs to the [`SessionStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "participantId")]
    pub participant_id: String,
    #[serde(rename = "channelKey")]
    pub channel_key: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default, rename = "modelOverride")]
    pub model_override: Option<String>,
    #[serde(default, rename = "compactionCount")]
    pub compaction_count: u32,
    #[serde(default, rename = "lastCheckpointSummary")]
    pub last_checkpoint_summary: Option<String>,
    #[serde(default = "chrono::Utc::now", rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "chrono::Utc::now", rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        participant_id: impl Into<String>,
        channel_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            participant_id: participant_id.into(),
            channel_key: channel_key.into(),
            turns: Vec::new(),
            model_override: None,
            compaction_count: 0,
            last_checkpoint_summary: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// Sum of the per-turn estimates.
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.approx_tokens).sum()
    }

    /// Model to use for this session, falling back to `default`.
    pub fn model<'a>(&'a self, default: &'a str) -> &'a str {
        self.model_override.as_deref().unwrap_or(default)
    }
}
