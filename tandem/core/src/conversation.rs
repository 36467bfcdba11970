//! Conversation metadata and chat mode
//!
//! The Session Controller holds at most one current [`Conversation`]. Its
//! message sequence lives in the [`MessageStore`](crate::store::MessageStore);
//! this module only carries the metadata that the server can refresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ConversationSummary;
use crate::messages::ConversationId;

/// Title the server assigns before the first exchange
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Model the server binds when none is requested
pub const DEFAULT_MODEL: &str = "qwen3:latest";

/// Current conversation metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-issued identifier
    pub id: ConversationId,
    /// Display title (server derives it from the first message)
    pub title: String,
    /// Primary model bound to this conversation
    pub model: String,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// When the conversation last changed on the server
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Build from a server summary
    pub fn from_summary(summary: &ConversationSummary) -> Self {
        Self {
            id: summary.id.clone(),
            title: summary.title.clone(),
            model: summary.model_name.clone(),
            created_at: summary.created_at,
            updated_at: summary.updated_at.unwrap_or(summary.created_at),
        }
    }

    /// Apply refreshed metadata. Returns true if anything changed.
    ///
    /// Summaries for a different conversation are ignored.
    pub fn apply_summary(&mut self, summary: &ConversationSummary) -> bool {
        if summary.id != self.id {
            return false;
        }
        let updated_at = summary.updated_at.unwrap_or(self.updated_at);
        let changed = self.title != summary.title
            || self.model != summary.model_name
            || self.updated_at != updated_at;
        self.title.clone_from(&summary.title);
        self.model.clone_from(&summary.model_name);
        self.updated_at = updated_at;
        changed
    }
}

/// Whether each turn is answered by one model or two in parallel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMode {
    /// One model per turn
    #[default]
    Single,
    /// Two models per turn; the user picks a winner
    Dual {
        /// Model answering as side B
        second_model: String,
    },
}

impl ChatMode {
    /// Number of logical streams a turn produces
    #[must_use]
    pub fn lanes(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Dual { .. } => 2,
        }
    }

    /// Wire name for the request body
    #[must_use]
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Dual { .. } => "dual",
        }
    }

    /// Second model name in dual mode
    #[must_use]
    pub fn second_model(&self) -> Option<&str> {
        match self {
            Self::Single => None,
            Self::Dual { second_model } => Some(second_model),
        }
    }

    /// Whether this is dual mode
    #[must_use]
    pub fn is_dual(&self) -> bool {
        matches!(self, Self::Dual { .. })
    }
}
