// Replay checkpoints.
//
// A checkpoint is a derived state captured at some sequence, together
// with the log entry it ends on. Folding the entries after it yields the
// same state as folding the whole log.

use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, Sequence, TableId};
use crate::state::TableState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    state: TableState,
    /// The entry at `state.current_sequence`, as it was when captured.
    anchor: LogEntry,
}

impl Checkpoint {
    pub(crate) fn new(state: TableState, anchor: LogEntry) -> Self {
        Self { state, anchor }
    }

    pub fn table_id(&self) -> &TableId {
        &self.state.table_id
    }

    /// Sequence of the last entry folded into the checkpoint.
    pub fn sequence(&self) -> Sequence {
        self.state.current_sequence
    }

    pub fn state(&self) -> &TableState {
        &self.state
    }

    pub fn anchor(&self) -> &LogEntry {
        &self.anchor
    }

    pub fn into_state(self) -> TableState {
        self.state
    }
}
