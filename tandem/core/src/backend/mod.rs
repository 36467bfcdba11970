//! Server Integration
//!
//! The two collaborators the session talks to, behind traits:
//!
//! - [`ChatTransport`]: opens one streamed response per turn
//! - [`ConversationApi`]: request/response conversation CRUD
//!
//! # Available Backends
//!
//! - **HTTP**: the chat server's REST API (default)
//! - **Mock**: scripted in-memory backend for tests and offline use
//!
//! # Usage
//!
//! ```ignore
//! use tandem_core::backend::{ChatTransport, HttpBackend, StreamRequest};
//!
//! let backend = HttpBackend::new(&config.server)?;
//! let request = StreamRequest::new(conversation_id, "Hello!", ChatMode::Single);
//! let body = backend.open_stream(&request).await?;
//! ```

mod http;
pub mod mock;
mod traits;

pub use http::HttpBackend;
pub use mock::MockBackend;
pub use traits::{
    ApiError, ByteStream, ChatTransport, ConversationApi, ConversationDetail,
    ConversationSummary, HistoryMessage, ModelInfo, SelectionRecord, StreamRequest,
    TransportError,
};
