//! Stream Reconcilers
//!
//! A reconciler drives one turn from "placeholders appended" to "every
//! placeholder terminated", applying decoded [`StreamEvent`]s to the
//! [`MessageStore`] one at a time.
//!
//! Reconcilers never keep a reference to the store: the Session Controller
//! owns it and lends it for the duration of each call. This keeps every write
//! behind the controller's staleness check.
//!
//! ```text
//!   Idle ──submit──▶ Submitting ──opened──▶ Streaming ──complete──▶ Finalizing ──▶ Idle
//!                         │                     │
//!                         └────open failed──────┴──error / close──▶ Failed ──▶ Idle
//! ```
//!
//! [`StreamEvent`]: crate::streaming::StreamEvent
//! [`MessageStore`]: crate::store::MessageStore

mod dual;
mod single;

pub use dual::{select, DualStreamReconciler, SelectError, Selection};
pub use single::SingleStreamReconciler;

use serde::{Deserialize, Serialize};

use crate::messages::Side;

/// Lifecycle of one turn's response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcilerState {
    /// No response in flight
    Idle,
    /// Placeholders appended, request not yet accepted
    Submitting,
    /// Receiving content
    Streaming,
    /// Applying a successful terminal event
    Finalizing,
    /// Terminated by an error
    Failed,
}

impl ReconcilerState {
    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Submitting => "Sending...",
            Self::Streaming => "Responding...",
            Self::Finalizing => "Finishing...",
            Self::Failed => "Failed",
        }
    }

    /// Whether the turn has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

/// What applying one event did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Content was appended
    Continued,
    /// The event was dropped (stale, duplicate or unroutable)
    Ignored,
    /// A placeholder finished successfully (`side` is `None` in single mode)
    Finalized {
        /// Which parallel side finished
        side: Option<Side>,
    },
    /// A placeholder failed
    Failed {
        /// Which parallel side failed
        side: Option<Side>,
    },
}

impl Transition {
    /// Whether the store changed
    #[must_use]
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

/// Either kind of reconciler, as held by the Session Controller
#[derive(Debug)]
pub enum Reconciler {
    /// One model per turn
    Single(SingleStreamReconciler),
    /// Two models per turn
    Dual(DualStreamReconciler),
}

impl Reconciler {
    /// The turn being reconciled
    #[must_use]
    pub fn turn(&self) -> crate::messages::TurnId {
        match self {
            Self::Single(r) => r.turn(),
            Self::Dual(r) => r.turn(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ReconcilerState {
        match self {
            Self::Single(r) => r.state(),
            Self::Dual(r) => r.state(),
        }
    }

    /// Submitting → Streaming once the request is accepted
    pub fn opened(&mut self) {
        match self {
            Self::Single(r) => r.opened(),
            Self::Dual(r) => r.opened(),
        }
    }

    /// Apply one decoded event
    pub fn apply(
        &mut self,
        store: &mut crate::store::MessageStore,
        event: crate::streaming::StreamEvent,
    ) -> Transition {
        match self {
            Self::Single(r) => r.apply(store, event),
            Self::Dual(r) => r.apply(store, event),
        }
    }

    /// Fail every placeholder still streaming
    pub fn fail(&mut self, store: &mut crate::store::MessageStore, message: &str) {
        match self {
            Self::Single(r) => {
                r.fail(store, message);
            }
            Self::Dual(r) => r.fail_all(store, message),
        }
    }

    /// Whether at least one placeholder finished successfully
    #[must_use]
    pub fn any_completed(&self) -> bool {
        match self {
            Self::Single(r) => r.state() == ReconcilerState::Idle,
            Self::Dual(r) => r.any_completed(),
        }
    }
}
