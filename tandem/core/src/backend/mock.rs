//! Scripted In-Memory Backend
//!
//! Implements both collaborator traits without a network. Streamed turns are
//! answered from a queue of scripted responses at the byte level, so tests
//! exercise the real decoder: split records, garbage records, premature close
//! and open failures all behave as they would over HTTP.
//!
//! # Usage
//!
//! ```ignore
//! use tandem_core::backend::mock::{sse, MockBackend, MockResponse};
//!
//! let backend = MockBackend::new();
//! backend.push_response(MockResponse::fragments([
//!     sse(&json!({"content": "Hi"})),
//!     sse(&json!({"done": true, "message_id": "srv-1"})),
//! ]));
//!
//! // After the test, verify what was sent
//! assert_eq!(backend.requests()[0].text, "hello");
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::traits::{
    ApiError, ByteStream, ChatTransport, ConversationApi, ConversationDetail,
    ConversationSummary, HistoryMessage, ModelInfo, SelectionRecord, StreamRequest,
    TransportError,
};
use crate::conversation::DEFAULT_TITLE;
use crate::messages::{ConversationId, MessageRole, ServerId};

/// Encode one payload as an SSE record
pub fn sse(payload: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// One scripted answer to `open_stream`
#[derive(Debug)]
pub enum MockResponse {
    /// Deliver these fragments, then close the body
    Fragments(Vec<Bytes>),
    /// Deliver these fragments, then fail the read
    ReadFailure {
        /// Fragments delivered before the failure
        fragments: Vec<Bytes>,
        /// The read error
        error: TransportError,
    },
    /// Refuse to open the stream
    OpenFailure(TransportError),
    /// Fragments are pushed by the test through a [`StreamFeed`]
    Live(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
}

impl MockResponse {
    /// Fragments followed by a clean close
    pub fn fragments(fragments: impl IntoIterator<Item = Bytes>) -> Self {
        Self::Fragments(fragments.into_iter().collect())
    }

    /// A complete single-mode answer: one content record per chunk, then `done`
    pub fn reply<'a>(chunks: impl IntoIterator<Item = &'a str>, message_id: &str) -> Self {
        let mut fragments: Vec<Bytes> = chunks
            .into_iter()
            .map(|c| sse(&serde_json::json!({ "content": c })))
            .collect();
        fragments.push(sse(
            &serde_json::json!({ "done": true, "message_id": message_id }),
        ));
        Self::Fragments(fragments)
    }

    /// A live body plus the handle that feeds it
    pub fn live() -> (Self, StreamFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Live(rx), StreamFeed { tx })
    }
}

/// Test-side handle of a [`MockResponse::Live`] body
///
/// Dropping the feed closes the body.
#[derive(Debug, Clone)]
pub struct StreamFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl StreamFeed {
    /// Send one SSE record
    pub fn record(&self, payload: serde_json::Value) {
        self.raw(sse(&payload));
    }

    /// Send raw bytes (may split a record anywhere)
    pub fn raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(bytes.into()));
    }

    /// Fail the read
    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }
}

/// A CRUD call as the mock saw it
#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    /// `list_conversations`
    List,
    /// `create_conversation`
    Create {
        /// Requested title
        title: String,
        /// Requested model
        model: String,
    },
    /// `get_conversation`
    Get(ConversationId),
    /// `delete_conversation`
    Delete(ConversationId),
    /// `change_model`
    ChangeModel {
        /// Target conversation
        id: ConversationId,
        /// New model
        model: String,
    },
    /// `list_models`
    ListModels,
    /// `persist_selection`
    PersistSelection {
        /// Target conversation
        id: ConversationId,
        /// What was sent
        record: SelectionRecord,
    },
}

#[derive(Default)]
struct MockState {
    responses: VecDeque<MockResponse>,
    requests: Vec<StreamRequest>,
    calls: Vec<ApiCall>,
    conversations: Vec<ConversationDetail>,
    models: Vec<ModelInfo>,
    failure: Option<(u16, String)>,
    next_id: u64,
}

impl MockState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn check(&self) -> Result<(), ApiError> {
        match self.failure {
            Some((status, ref message)) => Err(ApiError::Rejected {
                status,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn find(&mut self, id: &ConversationId) -> Result<&mut ConversationDetail, ApiError> {
        self.conversations
            .iter_mut()
            .find(|c| &c.summary.id == id)
            .ok_or_else(|| ApiError::NotFound(id.clone()))
    }
}

/// In-memory backend with scripted streams
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Create an empty mock with one model available
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state.lock().models.push(ModelInfo {
            name: crate::conversation::DEFAULT_MODEL.to_string(),
            size: None,
        });
        backend
    }

    /// Queue the answer for the next `open_stream`
    pub fn push_response(&self, response: MockResponse) {
        self.state.lock().responses.push_back(response);
    }

    /// Add a stored conversation and return its id
    pub fn add_conversation(
        &self,
        title: &str,
        model: &str,
        history: &[(MessageRole, &str)],
    ) -> ConversationId {
        let mut state = self.state.lock();
        let id = ConversationId(state.mint("conv"));
        let now = Utc::now();
        let messages = history
            .iter()
            .map(|(role, content)| HistoryMessage {
                id: ServerId::new(state.mint("msg")),
                role: *role,
                content: (*content).to_string(),
                timestamp: now,
            })
            .collect::<Vec<_>>();
        state.conversations.push(ConversationDetail {
            summary: ConversationSummary {
                id: id.clone(),
                title: title.to_string(),
                model_name: model.to_string(),
                created_at: now,
                updated_at: Some(now),
                message_count: messages.len(),
            },
            messages,
        });
        id
    }

    /// Make a model available
    pub fn add_model(&self, name: &str) {
        self.state.lock().models.push(ModelInfo {
            name: name.to_string(),
            size: None,
        });
    }

    /// Reject every CRUD call with this status until cleared
    pub fn fail_api(&self, status: u16, message: &str) {
        self.state.lock().failure = Some((status, message.to_string()));
    }

    /// Accept CRUD calls again
    pub fn clear_failure(&self) {
        self.state.lock().failure = None;
    }

    /// Stream requests received so far
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state.lock().requests.clone()
    }

    /// CRUD calls received so far
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Stored conversation, if any
    pub fn conversation(&self, id: &ConversationId) -> Option<ConversationDetail> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| &c.summary.id == id)
            .cloned()
    }
}

#[async_trait]
impl ChatTransport for MockBackend {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let response = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());

            // The server stores the user message and names untitled
            // conversations after their first message
            let id = ServerId::new(state.mint("msg"));
            if let Ok(conv) = state.find(&request.conversation_id) {
                if conv.summary.title == DEFAULT_TITLE && conv.messages.is_empty() {
                    conv.summary.title = title_from(&request.text);
                }
                conv.messages.push(HistoryMessage {
                    id,
                    role: MessageRole::User,
                    content: request.text.clone(),
                    timestamp: Utc::now(),
                });
                conv.summary.message_count = conv.messages.len();
                conv.summary.updated_at = Some(Utc::now());
            }

            state.responses.pop_front()
        };

        let body: ByteStream = match response {
            Some(MockResponse::Fragments(fragments)) => {
                Box::pin(futures::stream::iter(fragments.into_iter().map(Ok)))
            }
            Some(MockResponse::ReadFailure { fragments, error }) => Box::pin(futures::stream::iter(
                fragments
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(error))),
            )),
            Some(MockResponse::OpenFailure(error)) => return Err(error),
            Some(MockResponse::Live(rx)) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => {
                return Err(TransportError::Status {
                    status: 503,
                    body: "no scripted response".to_string(),
                })
            }
        };
        Ok(body)
    }
}

fn title_from(text: &str) -> String {
    if text.chars().count() > 50 {
        format!("{}...", text.chars().take(50).collect::<String>())
    } else {
        text.to_string()
    }
}

#[async_trait]
impl ConversationApi for MockBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::List);
        state.check()?;
        Ok(state
            .conversations
            .iter()
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn create_conversation(
        &self,
        title: &str,
        model: &str,
    ) -> Result<ConversationSummary, ApiError> {
        {
            let mut state = self.state.lock();
            state.calls.push(ApiCall::Create {
                title: title.to_string(),
                model: model.to_string(),
            });
            state.check()?;
        }
        let id = self.add_conversation(title, model, &[]);
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .find(|c| c.summary.id == id)
            .map(|c| c.summary.clone())
            .ok_or(ApiError::NotFound(id))
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::Get(id.clone()));
        state.check()?;
        state.find(id).map(|c| c.clone())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::Delete(id.clone()));
        state.check()?;
        state.find(id)?;
        state.conversations.retain(|c| &c.summary.id != id);
        Ok(())
    }

    async fn change_model(&self, id: &ConversationId, model: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ChangeModel {
            id: id.clone(),
            model: model.to_string(),
        });
        state.check()?;
        state.find(id)?.summary.model_name = model.to_string();
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ListModels);
        state.check()?;
        Ok(state.models.clone())
    }

    async fn persist_selection(
        &self,
        id: &ConversationId,
        selection: &SelectionRecord,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::PersistSelection {
            id: id.clone(),
            record: selection.clone(),
        });
        state.check()?;
        state.find(id)?;
        Ok(())
    }
}
