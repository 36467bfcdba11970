//! Message Store
//!
//! Ordered, mutable sequence of [`Message`]s keyed by identifier. Insertion
//! order is display order.
//!
//! Every successful mutation emits exactly one [`StoreChange`] to the observer,
//! if one is attached. A presentation layer drains the observer once per tick
//! to batch redraws.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::{Message, MessageId, MessageRole, ServerId, Side, TurnId};

/// Logic errors reported by structural store operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No message carries this identifier
    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// The two messages of a group are not next to each other
    #[error("messages {0} and {1} are not adjacent")]
    NotAdjacent(MessageId, MessageId),

    /// A group member is not an assistant message
    #[error("message {0} is not an assistant message")]
    NotAssistant(MessageId),

    /// The identifier was already rebound to a server id
    #[error("message {0} already has a server identifier")]
    AlreadyFinal(MessageId),

    /// The replacement cannot stand in for the group
    #[error("invalid replacement: {0}")]
    InvalidGroup(String),
}

/// One observer notification per mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreChange {
    /// A message was added at the end
    Appended(MessageId),
    /// A message's content or flags changed
    Updated(MessageId),
    /// A message's identifier changed
    Rebound {
        /// Identifier before the change
        old: MessageId,
        /// Identifier after the change
        new: MessageId,
    },
    /// Two adjacent messages were replaced by one
    GroupReplaced {
        /// Identifiers that were removed
        removed: [MessageId; 2],
        /// Identifier of the replacement
        replacement: MessageId,
    },
    /// Every message was removed
    Cleared,
}

/// Ordered message sequence with change notifications
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    observer: Option<mpsc::UnboundedSender<StoreChange>>,
    revision: u64,
}

impl MessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer, replacing any previous one
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(tx);
        rx
    }

    /// Number of mutations applied so far
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn notify(&mut self, change: StoreChange) {
        self.revision += 1;
        if let Some(ref tx) = self.observer {
            if tx.send(change).is_err() {
                tracing::debug!("Store observer dropped");
                self.observer = None;
            }
        }
    }

    /// Append a message at the end
    pub fn append(&mut self, message: Message) {
        let id = message.id().clone();
        self.messages.push(message);
        self.notify(StoreChange::Appended(id));
    }

    /// Mutate a message in place.
    ///
    /// `f` reports whether it changed anything; observers hear only about
    /// real changes. Returns `None` if `id` is absent, which happens for late
    /// writes after a rebind or a merge.
    pub fn mutate(
        &mut self,
        id: &MessageId,
        f: impl FnOnce(&mut Message) -> bool,
    ) -> Option<bool> {
        let idx = self.position(id)?;
        let changed = f(&mut self.messages[idx]);
        if changed {
            let id = self.messages[idx].id().clone();
            self.notify(StoreChange::Updated(id));
        }
        Some(changed)
    }

    /// Rebind a temporary identifier to the server-issued one.
    ///
    /// Position and content are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyFinal`] if `old` is already a server id,
    /// and [`StoreError::NotFound`] if no message carries `old`.
    pub fn rebind(&mut self, old: &MessageId, new: ServerId) -> Result<(), StoreError> {
        if old.is_final() {
            return Err(StoreError::AlreadyFinal(old.clone()));
        }
        let idx = self
            .position(old)
            .ok_or_else(|| StoreError::NotFound(old.clone()))?;
        let new = MessageId::Final(new);
        self.messages[idx].set_id(new.clone());
        self.notify(StoreChange::Rebound {
            old: old.clone(),
            new,
        });
        Ok(())
    }

    /// Replace two adjacent assistant messages with one.
    ///
    /// The replacement takes the position of the first of the pair. Nothing
    /// changes unless every check passes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if either id is missing, the two are not
    /// adjacent, either is not an assistant message, or the replacement is
    /// not an assistant message.
    pub fn replace_group(
        &mut self,
        ids: [&MessageId; 2],
        replacement: Message,
    ) -> Result<(), StoreError> {
        let [first, second] = ids;
        let a = self
            .position(first)
            .ok_or_else(|| StoreError::NotFound(first.clone()))?;
        let b = self
            .position(second)
            .ok_or_else(|| StoreError::NotFound(second.clone()))?;

        if a.abs_diff(b) != 1 {
            return Err(StoreError::NotAdjacent(first.clone(), second.clone()));
        }
        for idx in [a, b] {
            if self.messages[idx].role() != MessageRole::Assistant {
                return Err(StoreError::NotAssistant(self.messages[idx].id().clone()));
            }
        }
        if replacement.role() != MessageRole::Assistant {
            return Err(StoreError::InvalidGroup(
                "replacement must be an assistant message".to_string(),
            ));
        }

        let at = a.min(b);
        let replacement_id = replacement.id().clone();
        let removed: Vec<Message> = self
            .messages
            .splice(at..=at + 1, std::iter::once(replacement))
            .collect();

        self.notify(StoreChange::GroupReplaced {
            removed: [removed[0].id().clone(), removed[1].id().clone()],
            replacement: replacement_id,
        });
        Ok(())
    }

    /// Remove every message
    pub fn clear(&mut self) {
        self.messages.clear();
        self.notify(StoreChange::Cleared);
    }

    /// Replace the whole sequence (conversation switch)
    pub fn load(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.notify(StoreChange::Cleared);
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    /// Get message by ID
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    /// All messages in display order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages belonging to one turn
    pub fn turn_messages(&self, turn: TurnId) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |m| m.turn() == Some(turn))
    }

    /// Whether any message of the turn is still streaming
    #[must_use]
    pub fn turn_is_streaming(&self, turn: TurnId) -> bool {
        self.turn_messages(turn).any(Message::is_streaming)
    }

    /// The unresolved parallel pair of a turn, looked up by relation
    #[must_use]
    pub fn parallel_pair(&self, turn: TurnId) -> Option<(&Message, &Message)> {
        let find = |side: Side| {
            self.turn_messages(turn)
                .find(|m| m.is_parallel() && m.side() == Some(side))
        };
        Some((find(Side::A)?, find(Side::B)?))
    }

    /// Most recent turn that still has an unresolved parallel pair
    #[must_use]
    pub fn last_parallel_turn(&self) -> Option<TurnId> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_parallel())
            .and_then(Message::turn)
    }
}
