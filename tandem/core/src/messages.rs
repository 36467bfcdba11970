//! Messages and Identifiers
//!
//! The records that make up a conversation transcript, and the identifiers
//! that tie them to the server's message log.
//!
//! # Identifier lifecycle
//!
//! A message created locally (the user's own text, or an assistant placeholder
//! waiting for tokens) carries a [`MessageId::Temporary`] identifier. Once the
//! server acknowledges it, the identifier is rebound to [`MessageId::Final`].
//! The transition is one-way: nothing in this crate can turn a final id back
//! into a temporary one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Locally-minted identifier for a message the server has not acknowledged
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl LocalId {
    /// Generate a new unique local ID
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local_{}", self.0)
    }
}

/// Identifier issued by the server's message log
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    /// Wrap a server-issued identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier: either local-only or acknowledged by the server
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Not yet acknowledged by the server
    Temporary(LocalId),
    /// Server-issued; never reverts to temporary
    Final(ServerId),
}

impl MessageId {
    /// Mint a fresh temporary identifier
    pub fn temporary() -> Self {
        Self::Temporary(LocalId::new())
    }

    /// Whether the server has acknowledged this identifier
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    /// The server id, if acknowledged
    #[must_use]
    pub fn server_id(&self) -> Option<&ServerId> {
        match self {
            Self::Final(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(id) => id.fmt(f),
            Self::Final(id) => id.fmt(f),
        }
    }
}

/// Identifier of one submission and its responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub uuid::Uuid);

impl TurnId {
    /// Generate a new turn ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn_{}", self.0.simple())
    }
}

/// Conversation identifier (issued by the server)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model output
    Assistant,
}

/// Which of the two parallel responses of a dual-mode turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// First model (`model_index` 0)
    A,
    /// Second model (`model_index` 1)
    B,
}

impl Side {
    /// Map a wire `model_index` to a side
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }

    /// Wire `model_index` of this side
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    /// The other side
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "0" => Ok(Self::A),
            "b" | "1" => Ok(Self::B),
            other => Err(format!("unknown side '{other}' (expected a or b)")),
        }
    }
}

/// A message in the transcript
///
/// Role is fixed at construction. Content only grows while the message is
/// streaming; once streaming ends it is frozen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    role: MessageRole,
    content: String,
    created_at: DateTime<Utc>,
    streaming: bool,
    error: bool,
    model: Option<String>,
    parallel: bool,
    /// Owning turn, absent for history loaded from the server
    turn: Option<TurnId>,
    /// Parallel side, present only for dual-mode placeholders
    side: Option<Side>,
}

impl Message {
    /// A fully-formed user message for a new turn
    pub fn user(content: impl Into<String>, turn: TurnId) -> Self {
        Self {
            id: MessageId::temporary(),
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            error: false,
            model: None,
            parallel: false,
            turn: Some(turn),
            side: None,
        }
    }

    /// An empty assistant placeholder that will receive streamed content
    pub fn placeholder(turn: TurnId, model: impl Into<String>) -> Self {
        Self {
            id: MessageId::temporary(),
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            streaming: true,
            error: false,
            model: Some(model.into()),
            parallel: false,
            turn: Some(turn),
            side: None,
        }
    }

    /// One side of a dual-mode pair
    pub fn parallel_placeholder(turn: TurnId, side: Side, model: impl Into<String>) -> Self {
        Self {
            parallel: true,
            side: Some(side),
            ..Self::placeholder(turn, model)
        }
    }

    /// A message already recorded in the server's log
    pub fn from_history(
        id: ServerId,
        role: MessageRole,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::Final(id),
            role,
            content: content.into(),
            created_at,
            streaming: false,
            error: false,
            model: None,
            parallel: false,
            turn: None,
            side: None,
        }
    }

    /// The merged result of choosing one side of a parallel pair
    pub(crate) fn selected_from(chosen: &Message) -> Self {
        Self {
            id: MessageId::temporary(),
            role: MessageRole::Assistant,
            content: chosen.content.clone(),
            created_at: Utc::now(),
            streaming: false,
            error: chosen.error,
            model: chosen.model.clone(),
            parallel: false,
            turn: chosen.turn,
            side: None,
        }
    }

    /// Message identifier
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Who sent this message
    pub fn role(&self) -> MessageRole {
        self.role
    }

    /// Current content (error text for failed messages)
    pub fn content(&self) -> &str {
        &self.content
    }

    /// When the message was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether content is still arriving
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether the response failed
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Model that produced this message
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Whether this is one half of an unresolved parallel pair
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Owning turn
    pub fn turn(&self) -> Option<TurnId> {
        self.turn
    }

    /// Parallel side
    pub fn side(&self) -> Option<Side> {
        self.side
    }

    /// Append streamed text. Returns false once the message is frozen.
    pub(crate) fn append(&mut self, text: &str) -> bool {
        if !self.streaming {
            return false;
        }
        self.content.push_str(text);
        true
    }

    /// Mark streaming as complete. Returns false if it already was.
    pub(crate) fn complete(&mut self) -> bool {
        std::mem::replace(&mut self.streaming, false)
    }

    /// Terminate with an error; the error text replaces any partial content.
    /// Returns false if the message was already in exactly that state.
    pub(crate) fn fail(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if !self.streaming && self.error && self.content == text {
            return false;
        }
        self.streaming = false;
        self.error = true;
        self.content = text;
        true
    }

    /// Swap in the server-issued identifier
    pub(crate) fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }
}
