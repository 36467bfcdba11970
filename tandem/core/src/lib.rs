//! Tandem Core - Headless Streaming Chat Client
//!
//! This crate turns a language model server's chunked responses into a
//! consistent, ordered message list. It is independent of any UI: a terminal
//! REPL, a GUI or a test harness drives it the same way.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Presentation layer                           │
//! │            (CLI, GUI, tests)  reads messages(), notices          │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                 submit / switch_mode / select
//! ┌───────────────────────────────┼─────────────────────────────────┐
//! │                          TANDEM CORE                             │
//! │  ┌────────────────────────────┴──────────────────────────────┐  │
//! │  │                         Session                            │  │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐ │  │
//! │  │  │ MessageStore │◀─│  Reconciler  │◀─│  Stream Decoder  │ │  │
//! │  │  │              │  │ single/dual  │  │  (SSE → events)  │ │  │
//! │  │  └──────────────┘  └──────────────┘  └────────▲─────────┘ │  │
//! │  └───────────────────────────────────────────────┼───────────┘  │
//! └──────────────────────────────────────────────────┼──────────────┘
//!                                       ChatTransport / ConversationApi
//!                                                    │
//!                                          Chat server (HTTP)
//! ```
//!
//! # Key Types
//!
//! - [`Session`]: Owns the current conversation, its messages and the streaming gate
//! - [`MessageStore`]: Ordered message sequence with change notifications
//! - [`MessageId`]: `Temporary` until the server acknowledges, then `Final`
//! - [`StreamEvent`]: One decoded protocol event
//! - [`DualStreamReconciler`]: Two concurrent responses per turn and the selection merge
//!
//! # Quick Start
//!
//! ```ignore
//! use tandem_core::{load_config, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config().await?;
//!     let mut session = Session::connect(&config)?;
//!     session.new_conversation(None, None).await?;
//!
//!     session.submit("hello")?;
//!     while session.next_update().await {
//!         // Render session.messages()
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Server collaborators (HTTP, mock)
//! - [`config`]: Client configuration (file, environment, CLI)
//! - [`conversation`]: Conversation metadata and chat mode
//! - [`messages`]: Messages and identifiers
//! - [`reconciler`]: Single- and dual-stream reconcilers
//! - [`session`]: The Session Controller
//! - [`store`]: The Message Store
//! - [`streaming`]: The Stream Decoder

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod messages;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    ApiError, ChatTransport, ConversationApi, ConversationSummary, HttpBackend, MockBackend,
    ModelInfo, SelectionRecord, StreamRequest, TransportError,
};
pub use conversation::{ChatMode, Conversation, DEFAULT_MODEL, DEFAULT_TITLE};
pub use messages::{
    ConversationId, LocalId, Message, MessageId, MessageRole, ServerId, Side, TurnId,
};
pub use reconciler::{
    DualStreamReconciler, Reconciler, ReconcilerState, SelectError, Selection,
    SingleStreamReconciler, Transition,
};
pub use session::{Session, SessionError, SessionNotice};
pub use store::{MessageStore, StoreChange, StoreError};
pub use streaming::{decode, Decoder, StreamEvent};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ChatConfig, ClientConfig,
    ConfigError, ConfigOverrides, ConfigSource, ServerConfig,
};
