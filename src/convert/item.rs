//! Lifecycle of a single file in a batch.

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// Where a job item is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Extracting,
    TextFound,
    NeedsOcr,
    Preprocessing,
    Recognizing,
    Writing,
    Done,
    Failed,
    Cancelled,
}

impl ItemState {
    /// Is this a final state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed | ItemState::Cancelled)
    }

    /// Is `self -> next` a legal step?
    pub fn can_move_to(self, next: ItemState) -> bool {
        use ItemState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed | Cancelled) => true,
            (Pending, Extracting)
            | (Extracting, TextFound | NeedsOcr)
            | (TextFound, Writing)
            | (NeedsOcr, Preprocessing)
            | (Preprocessing, Recognizing)
            | (Recognizing, Preprocessing | Writing)
            | (Writing, Done) => true,
            _ => false,
        }
    }

    /// Entering these states must not happen after cancellation.
    pub fn is_guarded_by_cancellation(self) -> bool {
        matches!(
            self,
            ItemState::Preprocessing | ItemState::Recognizing | ItemState::Writing
        )
    }
}

/// Attempted to move a job item along an edge that does not exist.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("illegal job item transition from {from:?} to {to:?}")]
pub struct IllegalTransition {
    pub from: ItemState,
    pub to: ItemState,
}

/// One file in a batch, with its full state history.
#[derive(Clone, Debug)]
pub struct ConversionJobItem {
    index: usize,
    source: PathBuf,
    history: Vec<ItemState>,
}

impl ConversionJobItem {
    pub fn new(index: usize, source: PathBuf) -> Self {
        Self {
            index,
            source,
            history: vec![ItemState::Pending],
        }
    }

    /// Position of this item in its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The current state.
    pub fn state(&self) -> ItemState {
        // `history` starts with `Pending` and is never shrunk.
        self.history.last().copied().unwrap_or(ItemState::Pending)
    }

    /// Every state this item has been in, oldest first.
    pub fn history(&self) -> &[ItemState] {
        &self.history
    }

    /// Move to `next`, or refuse if there is no such edge.
    pub fn advance(&mut self, next: ItemState) -> Result<(), IllegalTransition> {
        let current = self.state();
        if !current.can_move_to(next) {
            return Err(IllegalTransition {
                from: current,
                to: next,
            });
        }
        trace!(index = self.index, from = ?current, to = ?next, "Job item transition");
        self.history.push(next);
        Ok(())
    }
}
