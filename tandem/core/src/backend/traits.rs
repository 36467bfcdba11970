//! Backend Traits
//!
//! The two collaborators the client talks to:
//!
//! - [`ChatTransport`]: opens one long-lived chunked response per turn. The
//!   decoder owns the body; the transport only delivers bytes.
//! - [`ConversationApi`]: plain request/response CRUD (list, create, fetch,
//!   delete, change model, persist a parallel selection).
//!
//! Both are object-safe so the Session Controller can hold them as
//! `Arc<dyn ...>` and hand clones to fire-and-forget tasks.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::ChatMode;
use crate::messages::{ConversationId, MessageRole, ServerId};

/// Failures of the streaming transport
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Error text from the response body
        body: String,
    },

    /// The body ended before a terminal record
    #[error("connection closed before the response completed")]
    PrematureClose,

    /// The request exceeded its time budget
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Failures of the CRUD collaborator
#[derive(Debug, Error)]
pub enum ApiError {
    /// Could not reach the server
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The requested conversation does not exist
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    /// The server refused the request
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Error text from the response body
        message: String,
    },

    /// The response body did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Raw response body fragments
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Parameters for opening one turn's response stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    /// Conversation the turn belongs to
    pub conversation_id: ConversationId,
    /// The user's text
    pub text: String,
    /// Single or dual mode
    pub mode: ChatMode,
}

impl StreamRequest {
    /// Create a new stream request
    pub fn new(conversation_id: ConversationId, text: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            mode,
        }
    }

    /// JSON body sent to the server
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "message": self.text,
            "mode": self.mode.as_wire(),
        });
        if let Some(second) = self.mode.second_model() {
            body["second_model"] = serde_json::json!(second);
        }
        body
    }
}

/// Conversation list entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation identifier
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Bound model
    pub model_name: String,
    /// Creation time
    #[serde(with = "iso_time")]
    pub created_at: DateTime<Utc>,
    /// Last update time (absent in create responses)
    #[serde(default, with = "iso_time::option")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Number of stored messages
    #[serde(default)]
    pub message_count: usize,
}

/// A stored message as the server reports it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Server identifier
    pub id: ServerId,
    /// Sender
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Storage time
    #[serde(with = "iso_time")]
    pub timestamp: DateTime<Utc>,
}

/// A conversation with its full message history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    /// Metadata
    #[serde(flatten)]
    pub summary: ConversationSummary,
    /// Messages in chronological order
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

/// Information about a model the server can run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Model size in bytes (if known)
    #[serde(default)]
    pub size: Option<u64>,
}

/// The outcome of choosing one side of a parallel pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    /// Text of the chosen response
    pub content: String,
    /// Model that produced the chosen response
    pub model_name: Option<String>,
    /// Server id of the chosen side, when acknowledged
    pub chosen_message_id: Option<ServerId>,
    /// Server id of the discarded side, when acknowledged
    pub discarded_message_id: Option<ServerId>,
}

/// Streaming transport for one turn's response
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Get the transport name (e.g., "HTTP")
    fn name(&self) -> &str;

    /// Open the response stream for a turn.
    ///
    /// Resolves once the server has accepted the request; the returned body
    /// delivers fragments until the server closes it.
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;
}

/// Request/response conversation management
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// List conversations, most recently updated first
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError>;

    /// Create a conversation
    async fn create_conversation(
        &self,
        title: &str,
        model: &str,
    ) -> Result<ConversationSummary, ApiError>;

    /// Fetch a conversation with its history
    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError>;

    /// Delete a conversation
    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError>;

    /// Rebind a conversation to another model
    async fn change_model(&self, id: &ConversationId, model: &str) -> Result<(), ApiError>;

    /// List models the server can run
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError>;

    /// Record which side of a parallel pair the user kept
    async fn persist_selection(
        &self,
        id: &ConversationId,
        selection: &SelectionRecord,
    ) -> Result<(), ApiError>;

    /// Fetch only the metadata of a conversation
    async fn conversation_summary(
        &self,
        id: &ConversationId,
    ) -> Result<ConversationSummary, ApiError> {
        Ok(self.get_conversation(id).await?.summary)
    }
}

/// ISO-8601 timestamps, with or without an offset (naive values are UTC)
pub(crate) mod iso_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => super::parse(&s)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_request_body_single() {
        let request = StreamRequest::new(ConversationId("c1".into()), "hello", ChatMode::Single);
        let body = request.body();
        assert_eq!(body["message"], "hello");
        assert_eq!(body["mode"], "single");
        assert!(body.get("second_model").is_none());
    }

    #[test]
    fn test_stream_request_body_dual() {
        let mode = ChatMode::Dual {
            second_model: "llama3.2".to_string(),
        };
        let body = StreamRequest::new(ConversationId("c1".into()), "hello", mode).body();
        assert_eq!(body["mode"], "dual");
        assert_eq!(body["second_model"], "llama3.2");
    }

    #[test]
    fn test_summary_parses_naive_timestamps() {
        let json = r#"{
            "id": "c1",
            "title": "New Conversation",
            "model_name": "qwen3:latest",
            "created_at": "2024-05-01T10:20:30.123456",
            "updated_at": "2024-05-01T10:21:00",
            "message_count": 2
        }"#;
        let summary: ConversationSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.id, ConversationId("c1".into()));
        assert_eq!(summary.message_count, 2);
        assert!(summary.updated_at.is_some());
    }

    #[test]
    fn test_detail_flattens_summary() {
        let json = r#"{
            "id": "c1",
            "title": "hello",
            "model_name": "qwen3:latest",
            "created_at": "2024-05-01T10:20:30+00:00",
            "messages": [
                {"id": "m1", "role": "user", "content": "hello", "timestamp": "2024-05-01T10:20:31"},
                {"id": "m2", "role": "assistant", "content": "Hi", "timestamp": "2024-05-01T10:20:32"}
            ]
        }"#;
        let detail: ConversationDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.summary.title, "hello");
        assert_eq!(detail.summary.updated_at, None);
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Status {
            status: 404,
            body: "Conversation not found".to_string(),
        };
        assert_eq!(err.to_string(), "server returned 404: Conversation not found");
    }
}
