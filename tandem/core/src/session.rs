//! Conversation Session Controller
//!
//! The [`Session`] owns everything mutable about a conversation: the current
//! [`Conversation`], its [`MessageStore`], the chat mode and the streaming gate.
//! Nothing else holds a reference to the store; reconcilers borrow it for the
//! length of one call.
//!
//! # Event flow
//!
//! ```text
//!   submit(text) ──▶ user message + placeholder(s) ──▶ spawn pump task
//!                                                          │
//!                      open_stream() ─▶ decode() ─▶ (TurnId, StreamEvent)
//!                                                          │
//!   poll_streaming() / next_update() ◀──── mpsc ───────────┘
//!          │
//!          ├─ turn still active?  no ──▶ drop (stale)
//!          └─ yes ──▶ reconciler.apply(&mut store, event)
//! ```
//!
//! Every write re-checks that its turn is still the active one. Navigating to
//! another conversation aborts the pump and anything it already queued is
//! discarded on arrival.
//!
//! Fire-and-forget work (metadata refresh, selection persistence) runs in
//! spawned tasks and reports back through the same channel as
//! [`SessionNotice`]s. Its failure never touches the message sequence.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{
    ApiError, ChatTransport, ConversationApi, ConversationSummary, HistoryMessage, HttpBackend,
    ModelInfo, StreamRequest, TransportError,
};
use crate::config::{ChatConfig, ClientConfig};
use crate::conversation::{ChatMode, Conversation, DEFAULT_TITLE};
use crate::messages::{ConversationId, Message, Side, TurnId};
use crate::reconciler::{
    self, DualStreamReconciler, Reconciler, ReconcilerState, SelectError, Selection,
    SingleStreamReconciler,
};
use crate::store::{MessageStore, StoreChange};
use crate::streaming::{decode, failure_text, StreamEvent};

/// Operations the session refused
#[derive(Debug, Error)]
pub enum SessionError {
    /// A response is still streaming
    #[error("a response is still streaming")]
    StreamingInProgress,

    /// Nothing to send
    #[error("message is empty")]
    EmptyMessage,

    /// No conversation is open
    #[error("no conversation is open")]
    NoConversation,

    /// Dual mode needs a model for side B
    #[error("dual mode requires a second model")]
    MissingSecondModel,

    /// No turn has an unresolved parallel pair
    #[error("no parallel responses to choose from")]
    NothingToSelect,

    /// Selection failed
    #[error(transparent)]
    Select(#[from] SelectError),

    /// The server rejected a request
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Out-of-band results for the presentation layer
#[derive(Clone, Debug, PartialEq)]
pub enum SessionNotice {
    /// A turn reached its terminal state
    TurnFinished {
        /// The turn
        turn: TurnId,
        /// Whether at least one response completed successfully
        completed: bool,
    },
    /// Conversation metadata was refreshed after a turn
    MetadataRefreshed {
        /// Current title
        title: String,
    },
    /// The metadata refresh failed; messages are unaffected
    RefreshFailed {
        /// Error text
        error: String,
    },
    /// The server stored a parallel selection
    SelectionPersisted {
        /// Turn whose pair was merged
        turn: TurnId,
    },
    /// The server did not store a selection; the local merge stands
    SelectionPersistFailed {
        /// Turn whose pair was merged
        turn: TurnId,
        /// Error text
        error: String,
    },
}

/// Messages from spawned tasks back to the session
#[derive(Debug)]
enum Update {
    Opened(TurnId),
    Event(TurnId, StreamEvent),
    OpenFailed(TurnId, String),
    Refreshed {
        conversation: ConversationId,
        result: Result<ConversationSummary, String>,
    },
    Persisted {
        turn: TurnId,
        result: Result<(), String>,
    },
}

/// The turn currently being streamed
struct ActiveTurn {
    reconciler: Reconciler,
    pump: JoinHandle<()>,
}

/// One conversation's worth of state and the operations on it
pub struct Session {
    transport: Arc<dyn ChatTransport>,
    api: Arc<dyn ConversationApi>,

    conversation: Option<Conversation>,
    store: MessageStore,
    mode: ChatMode,
    /// Remembered across switches back to single mode
    second_model: Option<String>,
    default_model: String,

    /// True iff a message of the active turn is streaming
    streaming: bool,
    active: Option<ActiveTurn>,

    updates_tx: mpsc::UnboundedSender<Update>,
    updates_rx: mpsc::UnboundedReceiver<Update>,
    /// Spawned fire-and-forget tasks not yet reported back
    background: usize,
    notices: VecDeque<SessionNotice>,
}

impl Session {
    /// Create a session over the given collaborators
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        api: Arc<dyn ConversationApi>,
        chat: &ChatConfig,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            api,
            conversation: None,
            store: MessageStore::new(),
            mode: chat.initial_mode(),
            second_model: chat.second_model.clone(),
            default_model: chat.default_model.clone(),
            streaming: false,
            active: None,
            updates_tx,
            updates_rx,
            background: 0,
            notices: VecDeque::new(),
        }
    }

    /// Create a session talking to the configured server over HTTP
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        let backend = Arc::new(HttpBackend::new(&config.server)?);
        tracing::info!(base_url = backend.base_url(), "Using HTTP backend");
        Ok(Self::new(backend.clone(), backend, &config.chat))
    }

    // ------------------------------------------------------------------
    // Read-only view
    // ------------------------------------------------------------------

    /// Messages in display order
    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    /// The message store (read-only)
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Attach a change observer to the store
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreChange> {
        self.store.subscribe()
    }

    /// Whether a response is streaming (the submission gate)
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Current conversation, if one is open
    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// Current chat mode
    pub fn mode(&self) -> &ChatMode {
        &self.mode
    }

    /// The turn being streamed, if any
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|a| a.reconciler.turn())
    }

    /// Lifecycle state of the active turn
    pub fn state(&self) -> ReconcilerState {
        self.active
            .as_ref()
            .map_or(ReconcilerState::Idle, |a| a.reconciler.state())
    }

    /// Most recent turn with an unresolved parallel pair
    pub fn last_parallel_turn(&self) -> Option<TurnId> {
        self.store.last_parallel_turn()
    }

    /// Take the notices collected so far
    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        self.notices.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Turn operations
    // ------------------------------------------------------------------

    /// Submit a new turn.
    ///
    /// Appends the user message and the placeholder(s), then opens the stream
    /// in a spawned task. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Rejected without any change to the message sequence if a response is
    /// still streaming, the text is blank, or no conversation is open.
    pub fn submit(&mut self, text: &str) -> Result<TurnId, SessionError> {
        if self.streaming {
            tracing::warn!("Submit rejected: response still streaming");
            return Err(SessionError::StreamingInProgress);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let conversation = self
            .conversation
            .as_ref()
            .ok_or(SessionError::NoConversation)?;

        let turn = TurnId::new();
        let request = StreamRequest::new(conversation.id.clone(), text, self.mode.clone());

        self.store.append(Message::user(text, turn));
        let reconciler = match self.mode {
            ChatMode::Single => Reconciler::Single(SingleStreamReconciler::begin(
                &mut self.store,
                turn,
                &conversation.model,
            )),
            ChatMode::Dual { ref second_model } => Reconciler::Dual(DualStreamReconciler::begin(
                &mut self.store,
                turn,
                &conversation.model,
                second_model,
            )),
        };

        tracing::info!(
            turn = %turn,
            conversation = %request.conversation_id,
            mode = request.mode.as_wire(),
            "Turn submitted"
        );

        let pump = self.spawn_pump(turn, request);
        self.active = Some(ActiveTurn { reconciler, pump });
        self.sync_streaming();
        Ok(turn)
    }

    /// Open the stream and forward decoded events, tagged with their turn
    fn spawn_pump(&self, turn: TurnId, request: StreamRequest) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let tx = self.updates_tx.clone();
        let lanes = request.mode.lanes();

        tokio::spawn(async move {
            let body = match transport.open_stream(&request).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(turn = %turn, transport = transport.name(), error = %e, "Failed to open stream");
                    let _ = tx.send(Update::OpenFailed(turn, failure_text(&e)));
                    return;
                }
            };
            if tx.send(Update::Opened(turn)).is_err() {
                return;
            }

            let mut events = Box::pin(decode(body, lanes));
            while let Some(event) = events.next().await {
                if tx.send(Update::Event(turn, event)).is_err() {
                    tracing::debug!(turn = %turn, "Session gone, stopping stream");
                    break;
                }
            }
        })
    }

    /// Switch between single and dual mode.
    ///
    /// Without an explicit second model, dual mode reuses the last one.
    ///
    /// # Errors
    ///
    /// Rejected while a response is streaming, or when dual mode is requested
    /// and no second model is known.
    pub fn switch_mode(
        &mut self,
        dual: bool,
        second_model: Option<&str>,
    ) -> Result<&ChatMode, SessionError> {
        if self.streaming {
            tracing::warn!("Mode switch rejected: response still streaming");
            return Err(SessionError::StreamingInProgress);
        }

        self.mode = if dual {
            if let Some(model) = second_model {
                self.second_model = Some(model.to_string());
            }
            let second_model = self
                .second_model
                .clone()
                .ok_or(SessionError::MissingSecondModel)?;
            ChatMode::Dual { second_model }
        } else {
            ChatMode::Single
        };

        tracing::info!(mode = self.mode.as_wire(), second_model = ?self.mode.second_model(), "Chat mode switched");
        Ok(&self.mode)
    }

    /// Keep one side of a turn's parallel pair.
    ///
    /// The local merge happens immediately; persisting it runs in the
    /// background and reports a [`SessionNotice`].
    ///
    /// # Errors
    ///
    /// Rejected while a response is streaming, and whenever the merge itself
    /// is refused (see [`reconciler::select`]).
    pub fn select(&mut self, turn: TurnId, side: Side) -> Result<Selection, SessionError> {
        if self.streaming {
            tracing::warn!(turn = %turn, "Selection rejected: response still streaming");
            return Err(SessionError::StreamingInProgress);
        }
        let selection = reconciler::select(&mut self.store, turn, side)?;

        if let Some(ref conversation) = self.conversation {
            let api = Arc::clone(&self.api);
            let tx = self.updates_tx.clone();
            let id = conversation.id.clone();
            let record = selection.record.clone();
            self.background += 1;
            tokio::spawn(async move {
                let result = api
                    .persist_selection(&id, &record)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx.send(Update::Persisted { turn, result });
            });
        }
        Ok(selection)
    }

    /// Select a side of the most recent parallel pair
    ///
    /// # Errors
    ///
    /// As [`Session::select`], plus [`SessionError::NothingToSelect`] if no
    /// pair is left.
    pub fn select_last(&mut self, side: Side) -> Result<Selection, SessionError> {
        let turn = self
            .store
            .last_parallel_turn()
            .ok_or(SessionError::NothingToSelect)?;
        self.select(turn, side)
    }

    // ------------------------------------------------------------------
    // Conversation operations
    // ------------------------------------------------------------------

    /// Change the model bound to the current conversation
    ///
    /// # Errors
    ///
    /// Rejected while streaming or with no conversation open; server
    /// failures leave the bound model unchanged.
    pub async fn change_model(&mut self, model: &str) -> Result<(), SessionError> {
        if self.streaming {
            return Err(SessionError::StreamingInProgress);
        }
        let id = self
            .conversation
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or(SessionError::NoConversation)?;

        self.api.change_model(&id, model).await?;

        if let Some(conversation) = self.conversation.as_mut().filter(|c| c.id == id) {
            conversation.model = model.to_string();
            tracing::info!(conversation = %id, model, "Model changed");
        }
        Ok(())
    }

    /// Navigate to a stored conversation and load its history.
    ///
    /// Any turn still streaming becomes stale.
    ///
    /// # Errors
    ///
    /// Returns the server's error; the current conversation stays open.
    pub async fn open_conversation(&mut self, id: &ConversationId) -> Result<(), SessionError> {
        let detail = self.api.get_conversation(id).await?;
        self.enter(&detail.summary, detail.messages);
        Ok(())
    }

    /// Create a conversation and open it
    ///
    /// # Errors
    ///
    /// Returns the server's error; the current conversation stays open.
    pub async fn new_conversation(
        &mut self,
        title: Option<&str>,
        model: Option<&str>,
    ) -> Result<&Conversation, SessionError> {
        let title = title.unwrap_or(DEFAULT_TITLE);
        let model = model.unwrap_or(&self.default_model).to_string();
        let summary = self.api.create_conversation(title, &model).await?;
        self.enter(&summary, Vec::new());
        self.conversation.as_ref().ok_or(SessionError::NoConversation)
    }

    /// Delete the current conversation on the server and close it
    ///
    /// # Errors
    ///
    /// Fails with no conversation open, or with the server's error (in which
    /// case nothing changes locally).
    pub async fn delete_current(&mut self) -> Result<ConversationId, SessionError> {
        let id = self
            .conversation
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or(SessionError::NoConversation)?;

        self.api.delete_conversation(&id).await?;

        self.abandon_turn();
        self.conversation = None;
        self.store.clear();
        tracing::info!(conversation = %id, "Conversation deleted");
        Ok(id)
    }

    /// Stored conversations
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        Ok(self.api.list_conversations().await?)
    }

    /// Models the server can run
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, SessionError> {
        Ok(self.api.list_models().await?)
    }

    fn enter(&mut self, summary: &ConversationSummary, history: Vec<HistoryMessage>) {
        self.abandon_turn();

        let messages = history
            .into_iter()
            .map(|m| Message::from_history(m.id, m.role, m.content, m.timestamp))
            .collect();
        self.store.load(messages);
        self.conversation = Some(Conversation::from_summary(summary));

        tracing::info!(
            conversation = %summary.id,
            title = %summary.title,
            messages = self.store.len(),
            "Conversation opened"
        );
    }

    /// Make the active turn stale
    fn abandon_turn(&mut self) {
        if let Some(active) = self.active.take() {
            active.pump.abort();
            tracing::debug!(turn = %active.reconciler.turn(), "Active turn abandoned");
        }
        self.streaming = false;
    }

    // ------------------------------------------------------------------
    // Driving the event loop
    // ------------------------------------------------------------------

    /// Apply every update that is ready, without waiting.
    ///
    /// Returns true if the message sequence or metadata changed. Call once
    /// per UI tick.
    pub fn poll_streaming(&mut self) -> bool {
        let mut changed = false;
        while let Ok(update) = self.updates_rx.try_recv() {
            changed |= self.apply_update(update);
        }
        changed
    }

    /// Wait for the next update and apply it.
    ///
    /// Returns false immediately when nothing is in flight.
    pub async fn next_update(&mut self) -> bool {
        if !self.has_pending_work() {
            return false;
        }
        match self.updates_rx.recv().await {
            Some(update) => {
                self.apply_update(update);
                true
            }
            None => false,
        }
    }

    /// Drive the active turn and background tasks to completion
    pub async fn run_until_idle(&mut self) {
        while self.next_update().await {}
    }

    /// Whether a turn or background task is still in flight
    pub fn has_pending_work(&self) -> bool {
        self.active.is_some() || self.background > 0
    }

    fn apply_update(&mut self, update: Update) -> bool {
        match update {
            Update::Opened(turn) => {
                if let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|a| a.reconciler.turn() == turn)
                {
                    active.reconciler.opened();
                }
                false
            }

            Update::Event(turn, event) => {
                let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|a| a.reconciler.turn() == turn)
                else {
                    tracing::debug!(turn = %turn, ?event, "Discarding stale stream event");
                    return false;
                };
                let transition = active.reconciler.apply(&mut self.store, event);
                self.after_transition();
                transition.is_applied()
            }

            Update::OpenFailed(turn, message) => {
                let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|a| a.reconciler.turn() == turn)
                else {
                    tracing::debug!(turn = %turn, "Discarding stale open failure");
                    return false;
                };
                active.reconciler.fail(&mut self.store, &message);
                self.after_transition();
                true
            }

            Update::Refreshed {
                conversation,
                result,
            } => {
                self.background = self.background.saturating_sub(1);
                let current = self
                    .conversation
                    .as_mut()
                    .filter(|c| c.id == conversation);
                match (result, current) {
                    (Ok(summary), Some(current)) => {
                        let changed = current.apply_summary(&summary);
                        self.notices.push_back(SessionNotice::MetadataRefreshed {
                            title: current.title.clone(),
                        });
                        changed
                    }
                    (Err(error), Some(_)) => {
                        tracing::warn!(conversation = %conversation, error = %error, "Metadata refresh failed");
                        self.notices
                            .push_back(SessionNotice::RefreshFailed { error });
                        false
                    }
                    (_, None) => {
                        tracing::debug!(conversation = %conversation, "Discarding stale metadata refresh");
                        false
                    }
                }
            }

            Update::Persisted { turn, result } => {
                self.background = self.background.saturating_sub(1);
                match result {
                    Ok(()) => {
                        tracing::debug!(turn = %turn, "Selection persisted");
                        self.notices
                            .push_back(SessionNotice::SelectionPersisted { turn });
                    }
                    Err(error) => {
                        tracing::warn!(turn = %turn, error = %error, "Selection not persisted");
                        self.notices
                            .push_back(SessionNotice::SelectionPersistFailed { turn, error });
                    }
                }
                false
            }
        }
    }

    /// Re-derive the streaming gate and retire a finished turn
    fn after_transition(&mut self) {
        self.sync_streaming();

        let finished = self
            .active
            .as_ref()
            .is_some_and(|a| a.reconciler.state().is_terminal());
        if !finished {
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        active.pump.abort();

        let turn = active.reconciler.turn();
        let completed = active.reconciler.any_completed();
        tracing::info!(turn = %turn, completed, "Turn finished");
        self.notices
            .push_back(SessionNotice::TurnFinished { turn, completed });

        if completed {
            self.spawn_refresh();
        }
        self.sync_streaming();
    }

    fn sync_streaming(&mut self) {
        self.streaming = self
            .active
            .as_ref()
            .is_some_and(|a| self.store.turn_is_streaming(a.reconciler.turn()));
    }

    /// Fetch the conversation summary in the background
    fn spawn_refresh(&mut self) {
        let Some(ref conversation) = self.conversation else {
            return;
        };
        let api = Arc::clone(&self.api);
        let tx = self.updates_tx.clone();
        let id = conversation.id.clone();
        self.background += 1;

        tokio::spawn(async move {
            let result = api
                .conversation_summary(&id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Update::Refreshed {
                conversation: id,
                result,
            });
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(ref active) = self.active {
            active.pump.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport.name())
            .field("conversation", &self.conversation)
            .field("mode", &self.mode)
            .field("streaming", &self.streaming)
            .field("messages", &self.store.len())
            .finish_non_exhaustive()
    }
}
