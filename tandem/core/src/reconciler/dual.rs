//! Dual-Stream Reconciler
//!
//! Two placeholders per turn, one per [`Side`]. Events are routed by
//! `model_index`; the two lanes progress independently and either may finish
//! or fail without touching the other.
//!
//! Once both lanes have terminated, [`select`] merges the pair into a single
//! message.

use thiserror::Error;

use super::{ReconcilerState, Transition};
use crate::backend::SelectionRecord;
use crate::messages::{Message, MessageId, ServerId, Side, TurnId};
use crate::store::{MessageStore, StoreError};
use crate::streaming::StreamEvent;

/// Why a selection was refused
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    /// The turn has no unresolved parallel pair
    #[error("turn {0} has no parallel responses to choose from")]
    NoParallelPair(TurnId),

    /// A side is still generating
    #[error("cannot select while a response is still streaming")]
    StillStreaming,

    /// The merge itself was rejected
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a local merge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Identifier of the replacement message
    pub message_id: MessageId,
    /// Side that was kept
    pub side: Side,
    /// What to send to the server for persistence
    pub record: SelectionRecord,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LaneState {
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Lane {
    placeholder: MessageId,
    state: LaneState,
}

impl Lane {
    fn is_open(&self) -> bool {
        self.state == LaneState::Streaming
    }
}

/// Drives two concurrent model responses for one turn
#[derive(Debug)]
pub struct DualStreamReconciler {
    turn: TurnId,
    lanes: [Lane; 2],
    state: ReconcilerState,
}

impl DualStreamReconciler {
    /// Append both placeholders for `turn`, contiguous and in side order
    pub fn begin(store: &mut MessageStore, turn: TurnId, model_a: &str, model_b: &str) -> Self {
        let a = Message::parallel_placeholder(turn, Side::A, model_a);
        let b = Message::parallel_placeholder(turn, Side::B, model_b);
        let lanes = [
            Lane {
                placeholder: a.id().clone(),
                state: LaneState::Streaming,
            },
            Lane {
                placeholder: b.id().clone(),
                state: LaneState::Streaming,
            },
        ];
        store.append(a);
        store.append(b);

        tracing::debug!(turn = %turn, model_a, model_b, "Parallel placeholders appended");

        Self {
            turn,
            lanes,
            state: ReconcilerState::Submitting,
        }
    }

    /// The turn being reconciled
    #[must_use]
    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Current lifecycle state of the turn as a whole
    #[must_use]
    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// Current identifier of one side's placeholder
    #[must_use]
    pub fn placeholder(&self, side: Side) -> &MessageId {
        &self.lanes[side.index()].placeholder
    }

    /// Whether at least one side finished successfully
    #[must_use]
    pub fn any_completed(&self) -> bool {
        self.lanes.iter().any(|l| l.state == LaneState::Completed)
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
        self.opened();

        let index = event.model_index();
        let side = index.and_then(Side::from_index);
        if index.is_some() && side.is_none() {
            tracing::debug!(turn = %self.turn, ?index, "Dropping event for unknown model index");
            return Transition::Ignored;
        }

        let transition = match (event, side) {
            (StreamEvent::Content { text, .. }, Some(side)) => {
                self.append(store, side, &text)
            }
            (StreamEvent::Content { .. }, None) => {
                tracing::debug!(turn = %self.turn, "Dropping content without model index");
                Transition::Ignored
            }

            (StreamEvent::Complete { message_id, .. }, Some(side)) => {
                self.finalize(store, side, message_id)
            }
            (StreamEvent::Complete { message_id, .. }, None) => {
                if message_id.is_some() {
                    // One id cannot name two messages
                    tracing::debug!(turn = %self.turn, "Turn-level completion id not bound");
                }
                let finished: Vec<Side> = [Side::A, Side::B]
                    .into_iter()
                    .filter(|s| self.lanes[s.index()].is_open())
                    .collect();
                for side in &finished {
                    self.finalize(store, *side, None);
                }
                if finished.is_empty() {
                    Transition::Ignored
                } else {
                    Transition::Finalized { side: None }
                }
            }

            (StreamEvent::Error { message, .. }, Some(side)) => {
                self.fail_side(store, side, &message)
            }
            (StreamEvent::Error { message, .. }, None) => {
                let open = self.lanes.iter().any(Lane::is_open);
                self.fail_all(store, &message);
                if open {
                    Transition::Failed { side: None }
                } else {
                    Transition::Ignored
                }
            }
        };

        self.settle();
        transition
    }

    /// Fail every side that is still streaming
    pub fn fail_all(&mut self, store: &mut MessageStore, message: &str) {
        for side in [Side::A, Side::B] {
            self.fail_side(store, side, message);
        }
        self.settle();
    }

    fn append(&mut self, store: &mut MessageStore, side: Side, text: &str) -> Transition {
        let lane = &self.lanes[side.index()];
        if !lane.is_open() {
            tracing::debug!(turn = %self.turn, ?side, "Dropping chunk for terminated side");
            return Transition::Ignored;
        }
        match store.mutate(&lane.placeholder, |m| m.append(text)) {
            Some(true) => Transition::Continued,
            _ => Transition::Ignored,
        }
    }

    fn finalize(
        &mut self,
        store: &mut MessageStore,
        side: Side,
        message_id: Option<ServerId>,
    ) -> Transition {
        let turn = self.turn;
        let lane = &mut self.lanes[side.index()];
        if !lane.is_open() {
            tracing::debug!(turn = %turn, ?side, "Duplicate completion ignored");
            return Transition::Ignored;
        }

        lane.state = LaneState::Completed;
        store.mutate(&lane.placeholder, Message::complete);

        if let Some(server_id) = message_id {
            match store.rebind(&lane.placeholder, server_id.clone()) {
                Ok(()) => lane.placeholder = MessageId::Final(server_id),
                Err(e) => {
                    tracing::warn!(turn = %turn, ?side, error = %e, "Could not rebind placeholder");
                }
            }
        }

        tracing::info!(turn = %turn, ?side, message = %lane.placeholder, "Parallel response finalized");
        Transition::Finalized { side: Some(side) }
    }

    fn fail_side(&mut self, store: &mut MessageStore, side: Side, message: &str) -> Transition {
        let turn = self.turn;
        let lane = &mut self.lanes[side.index()];
        if !lane.is_open() {
            return Transition::Ignored;
        }
        lane.state = LaneState::Failed;
        store.mutate(&lane.placeholder, |m| m.fail(message));
        tracing::warn!(turn = %turn, ?side, error = %message, "Parallel response failed");
        Transition::Failed { side: Some(side) }
    }

    /// Leave the streaming state once both sides terminated
    fn settle(&mut self) {
        if self.lanes.iter().any(Lane::is_open) {
            return;
        }
        self.state = if self.any_completed() {
            ReconcilerState::Idle
        } else {
            ReconcilerState::Failed
        };
    }
}

/// Keep one side of a turn's parallel pair and drop the other.
///
/// The pair is found by its turn, not by position. The merge is local and
/// immediate; persisting the returned [`SelectionRecord`] is the caller's
/// business and never rolls the merge back.
///
/// # Errors
///
/// Returns [`SelectError::NoParallelPair`] if the turn has no unresolved pair,
/// [`SelectError::StillStreaming`] if either side is still generating, and
/// [`SelectError::Store`] if the store refuses the replacement. The store is
/// unchanged on error.
pub fn select(store: &mut MessageStore, turn: TurnId, side: Side) -> Result<Selection, SelectError> {
    let (a, b) = store
        .parallel_pair(turn)
        .ok_or(SelectError::NoParallelPair(turn))?;
    if a.is_streaming() || b.is_streaming() {
        return Err(SelectError::StillStreaming);
    }

    let pair = [a, b];
    let (chosen, discarded) = (pair[side.index()], pair[side.other().index()]);
    let record = SelectionRecord {
        content: chosen.content().to_string(),
        model_name: chosen.model().map(String::from),
        chosen_message_id: chosen.id().server_id().cloned(),
        discarded_message_id: discarded.id().server_id().cloned(),
    };
    let replacement = Message::selected_from(chosen);
    let message_id = replacement.id().clone();
    let ids = [a.id().clone(), b.id().clone()];

    store.replace_group([&ids[0], &ids[1]], replacement)?;

    tracing::info!(turn = %turn, ?side, message = %message_id, "Parallel responses merged");
    Ok(Selection {
        message_id,
        side,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRole;
    use pretty_assertions::assert_eq;

    fn content(text: &str, index: usize) -> StreamEvent {
        StreamEvent::Content {
            text: text.to_string(),
            model_index: Some(index),
        }
    }

    fn complete(id: Option<&str>, index: Option<usize>) -> StreamEvent {
        StreamEvent::Complete {
            message_id: id.map(ServerId::new),
            model_index: index,
        }
    }

    fn setup() -> (MessageStore, DualStreamReconciler) {
        let mut store = MessageStore::new();
        let turn = TurnId::new();
        store.append(Message::user("hello", turn));
        let r = DualStreamReconciler::begin(&mut store, turn, "model-a", "model-b");
        (store, r)
    }

    #[test]
    fn test_turn_level_complete() {
        let (mut store, mut r) = setup();
        r.apply(&mut store, content("x", 0));
        r.apply(&mut store, content("y", 1));
        assert_eq!(
            r.apply(&mut store, complete(None, None)),
            Transition::Finalized { side: None }
        );
        assert_eq!(r.state(), ReconcilerState::Idle);

        let messages = store.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content(), "x");
        assert_eq!(messages[1].side(), Some(Side::A));
        assert_eq!(messages[2].content(), "y");
        assert_eq!(messages[2].side(), Some(Side::B));
        assert!(messages[1..].iter().all(|m| m.is_parallel() && !m.is_streaming()));
    }

    #[test]
    fn test_per_model_completion_is_independent() {
        let (mut store, mut r) = setup();
        r.apply(&mut store, content("fast", 1));
        r.apply(&mut store, complete(Some("srv-b"), Some(1)));
        assert_eq!(r.state(), ReconcilerState::Streaming);
        assert!(store.messages()[1].is_streaming());

        r.apply(&mut store, content("slow", 0));
        r.apply(&mut store, complete(Some("srv-a"), Some(0)));
        assert_eq!(r.state(), ReconcilerState::Idle);
        assert_eq!(
            store.messages()[1].id(),
            &MessageId::Final(ServerId::new("srv-a"))
        );
        assert_eq!(store.messages()[1].content(), "slow");
        assert_eq!(
            store.messages()[2].id(),
            &MessageId::Final(ServerId::new("srv-b"))
        );
    }

    #[test]
    fn test_error_on_one_side_keeps_other() {
        let (mut store, mut r) = setup();
        r.apply(&mut store, content("a", 0));
        let t = r.apply(
            &mut store,
            StreamEvent::Error {
                message: "model b crashed".to_string(),
                model_index: Some(1),
            },
        );
        assert_eq!(t, Transition::Failed { side: Some(Side::B) });
        assert_eq!(r.state(), ReconcilerState::Streaming);

        r.apply(&mut store, content("bc", 0));
        r.apply(&mut store, complete(None, Some(0)));
        assert_eq!(r.state(), ReconcilerState::Idle);
        assert!(r.any_completed());
        assert_eq!(store.messages()[1].content(), "abc");
        assert!(store.messages()[2].is_error());
    }

    #[test]
    fn test_content_without_index_dropped() {
        let (mut store, mut r) = setup();
        let t = r.apply(
            &mut store,
            StreamEvent::Content {
                text: "who?".to_string(),
                model_index: None,
            },
        );
        assert_eq!(t, Transition::Ignored);
        assert_eq!(r.apply(&mut store, content("z", 2)), Transition::Ignored);
        assert!(store.messages()[1].content().is_empty());
        assert!(store.messages()[2].content().is_empty());
    }

    #[test]
    fn test_fail_all_marks_turn_failed() {
        let (mut store, mut r) = setup();
        r.fail_all(&mut store, "Error: connection closed");
        assert_eq!(r.state(), ReconcilerState::Failed);
        assert!(!r.any_completed());
        assert!(store.messages()[1..].iter().all(Message::is_error));
    }

    #[test]
    fn test_unindexed_error_fails_only_open_sides() {
        let (mut store, mut r) = setup();
        r.apply(&mut store, content("done", 0));
        r.apply(&mut store, complete(Some("srv-a"), Some(0)));
        r.apply(&mut store, content("partial", 1));

        let t = r.apply(
            &mut store,
            StreamEvent::Error {
                message: "Error: connection closed".to_string(),
                model_index: None,
            },
        );
        assert_eq!(t, Transition::Failed { side: None });
        assert_eq!(r.state(), ReconcilerState::Idle);
        assert!(r.any_completed());

        let messages = store.messages();
        assert_eq!(messages[1].id(), &MessageId::Final(ServerId::new("srv-a")));
        assert_eq!(messages[1].content(), "done");
        assert!(!messages[1].is_error());
        assert!(messages[2].is_error());
        assert_eq!(messages[2].content(), "Error: connection closed");
        assert!(messages[1..].iter().all(|m| !m.is_streaming()));

        let again = StreamEvent::Error {
            message: "late".to_string(),
            model_index: None,
        };
        assert_eq!(r.apply(&mut store, again), Transition::Ignored);
    }

    #[test]
    fn test_select_a() {
        let (mut store, mut r) = setup();
        let turn = r.turn();
        r.apply(&mut store, content("x", 0));
        r.apply(&mut store, content("y", 1));
        r.apply(&mut store, complete(None, None));

        let selection = select(&mut store, turn, Side::A).unwrap();
        assert_eq!(selection.record.content, "x");
        assert_eq!(selection.record.model_name.as_deref(), Some("model-a"));

        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), MessageRole::User);
        assert_eq!(messages[1].content(), "x");
        assert!(!messages[1].is_parallel());
        assert!(!messages[1].is_streaming());
        assert_eq!(messages[1].id(), &selection.message_id);
        assert!(store.get(r.placeholder(Side::B)).is_none());
    }

    #[test]
    fn test_select_while_streaming_rejected() {
        let (mut store, mut r) = setup();
        let turn = r.turn();
        r.apply(&mut store, complete(None, Some(0)));
        let revision = store.revision();

        assert_eq!(
            select(&mut store, turn, Side::A),
            Err(SelectError::StillStreaming)
        );
        assert_eq!(store.revision(), revision);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_select_twice_rejected() {
        let (mut store, mut r) = setup();
        let turn = r.turn();
        r.apply(&mut store, complete(None, None));
        select(&mut store, turn, Side::B).unwrap();
        assert_eq!(
            select(&mut store, turn, Side::A),
            Err(SelectError::NoParallelPair(turn))
        );
    }

    #[test]
    fn test_selection_record_carries_server_ids() {
        let (mut store, mut r) = setup();
        let turn = r.turn();
        r.apply(&mut store, complete(Some("srv-a"), Some(0)));
        r.apply(&mut store, complete(Some("srv-b"), Some(1)));

        let selection = select(&mut store, turn, Side::B).unwrap();
        assert_eq!(selection.record.chosen_message_id, Some(ServerId::new("srv-b")));
        assert_eq!(
            selection.record.discarded_message_id,
            Some(ServerId::new("srv-a"))
        );
        assert!(!selection.message_id.is_final());
    }
}
