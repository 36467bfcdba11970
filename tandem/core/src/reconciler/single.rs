//! Single-Stream Reconciler
//!
//! One placeholder per turn. Content chunks are appended in arrival order;
//! the first terminal event freezes the placeholder and anything after it is
//! ignored.

use super::{ReconcilerState, Transition};
use crate::messages::{Message, MessageId, TurnId};
use crate::store::MessageStore;
use crate::streaming::StreamEvent;

/// Drives one model's response for one turn
#[derive(Debug)]
pub struct SingleStreamReconciler {
    turn: TurnId,
    placeholder: MessageId,
    state: ReconcilerState,
}

impl SingleStreamReconciler {
    /// Append the placeholder for `turn` and enter `Submitting`
    pub fn begin(store: &mut MessageStore, turn: TurnId, model: &str) -> Self {
        let placeholder = Message::placeholder(turn, model);
        let id = placeholder.id().clone();
        store.append(placeholder);

        tracing::debug!(turn = %turn, placeholder = %id, model, "Placeholder appended");

        Self {
            turn,
            placeholder: id,
            state: ReconcilerState::Submitting,
        }
    }

    /// The turn being reconciled
    #[must_use]
    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Current identifier of the placeholder (final after rebind)
    #[must_use]
    pub fn placeholder(&self) -> &MessageId {
        &self.placeholder
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// The request was accepted; content may follow
    pub fn opened(&mut self) {
        if self.state == ReconcilerState::Submitting {
            self.state = ReconcilerState::Streaming;
        }
    }

    /// Apply one decoded event
    pub fn apply(&mut self, store: &mut MessageStore, event: StreamEvent) -> Transition {
        if self.state.is_terminal() {
            tracing::debug!(turn = %self.turn, ?event, "Ignoring event after terminal");
            return Transition::Ignored;
        }
        // Content can only arrive once the request was accepted
        self.opened();

        match event {
            StreamEvent::Content { text, .. } => {
                match store.mutate(&self.placeholder, |m| m.append(&text)) {
                    Some(true) => Transition::Continued,
                    _ => {
                        tracing::debug!(turn = %self.turn, "Dropping chunk for missing placeholder");
                        Transition::Ignored
                    }
                }
            }

            StreamEvent::Complete { message_id, .. } => {
                self.state = ReconcilerState::Finalizing;
                store.mutate(&self.placeholder, Message::complete);

                if let Some(server_id) = message_id {
                    match store.rebind(&self.placeholder, server_id.clone()) {
                        Ok(()) => self.placeholder = MessageId::Final(server_id),
                        Err(e) => {
                            tracing::warn!(turn = %self.turn, error = %e, "Could not rebind placeholder");
                        }
                    }
                }

                self.state = ReconcilerState::Idle;
                tracing::info!(turn = %self.turn, message = %self.placeholder, "Response finalized");
                Transition::Finalized { side: None }
            }

            StreamEvent::Error { message, .. } => self.fail(store, &message),
        }
    }

    /// Terminate the placeholder with an error
    ///
    /// Used for backend error payloads as well as transport failures before
    /// or during streaming.
    pub fn fail(&mut self, store: &mut MessageStore, message: &str) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }
        self.state = ReconcilerState::Failed;
        store.mutate(&self.placeholder, |m| m.fail(message));
        tracing::warn!(turn = %self.turn, error = %message, "Response failed");
        Transition::Failed { side: None }
    }
}
