// Table State Machine
//
// Derives the current table state from a sequence of log entries and
// decides which lifecycle transitions are legal.
// This module is pure, deterministic, and side-effect free.

use serde::{Deserialize, Serialize};

use crate::log::payload::{Environment, Payload, Schema};
use crate::log::{EngineId, LogEntry, MutationKind, Sequence, TableId, Timestamp};

pub mod cache;

pub use cache::StateCache;

/// High-level lifecycle state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Table exists but has not been opened for use.
    Created,

    /// Table is readable and stable.
    Active,

    /// One engine is applying a mutation (schema change, write, rewrite).
    Mutating,

    /// An aborted mutation is being undone.
    RollingBack,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Mutating => "MUTATING",
            LifecycleState::RollingBack => "ROLLING_BACK",
        };
        f.write_str(name)
    }
}

/// Lifecycle transition table.
///
/// Returns the target of `kind` applied from `from`, where `None` means
/// the table does not exist yet. Every pair not listed is illegal.
pub fn target_state(from: Option<LifecycleState>, kind: MutationKind) -> Option<LifecycleState> {
    use LifecycleState::*;
    use MutationKind::*;

    match (from, kind) {
        (None, CreateTable) => Some(Created),
        (Some(Created), Activate) => Some(Active),
        (Some(Active), BeginMutation) => Some(Mutating),
        (Some(Mutating), CommitMutation) => Some(Active),
        (Some(Mutating), AbortMutation) => Some(RollingBack),
        (Some(RollingBack), RollbackComplete) => Some(Active),
        _ => None,
    }
}

/// Full derived state of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    pub table_id: TableId,
    pub current_state: LifecycleState,
    pub current_sequence: Sequence,
    pub schema_version: u64,
    pub schema: Schema,
    /// Schema that the in-flight mutation installs when it commits.
    pub staged_schema: Option<Schema>,
    pub environment: Environment,
    /// Set only while `Mutating`.
    pub active_writer_engine: Option<EngineId>,
    pub last_timestamp: Timestamp,
}

/// Errors produced during state transitions.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("corrupt log for table {table_id} at sequence {sequence}: {reason}")]
    CorruptLog {
        table_id: TableId,
        sequence: Sequence,
        reason: String,
    },
}

/// Compute the state that `kind` with `payload` by `author` would produce.
///
/// The resulting state carries the next sequence number and the current
/// state's timestamp; folding the stamped entry sets the real timestamp.
pub fn next_state(
    current: Option<&TableState>,
    table_id: &TableId,
    kind: MutationKind,
    payload: &Payload,
    author: &EngineId,
) -> Result<TableState, StateError> {
    let from = current.map(|s| s.current_state);
    let target = target_state(from, kind).ok_or_else(|| {
        StateError::IllegalTransition(match from {
            Some(state) => format!("cannot apply {kind} while table {table_id} is {state}"),
            None => format!("cannot apply {kind} to table {table_id}, which does not exist"),
        })
    })?;

    if matches!(payload, Payload::TableDefinition { .. }) && kind != MutationKind::CreateTable {
        return Err(StateError::IllegalTransition(format!(
            "a table definition can only accompany create_table, not {kind}"
        )));
    }
    if matches!(payload, Payload::SchemaDelta(_)) && kind != MutationKind::BeginMutation {
        return Err(StateError::IllegalTransition(format!(
            "a schema delta can only accompany begin_mutation, not {kind}"
        )));
    }
    if matches!(payload, Payload::DataPointer(_)) && kind != MutationKind::BeginMutation {
        return Err(StateError::IllegalTransition(format!(
            "a data pointer can only accompany begin_mutation, not {kind}"
        )));
    }

    let Some(current) = current else {
        let Payload::TableDefinition {
            schema,
            environment,
        } = payload
        else {
            return Err(StateError::IllegalTransition(
                "create_table requires a table definition payload".into(),
            ));
        };

        return Ok(TableState {
            table_id: table_id.clone(),
            current_state: target,
            current_sequence: 1,
            schema_version: 1,
            schema: schema.clone(),
            staged_schema: None,
            environment: *environment,
            active_writer_engine: None,
            last_timestamp: 0,
        });
    };

    let mut next = current.clone();
    next.current_state = target;
    next.current_sequence = current.current_sequence + 1;

    match kind {
        MutationKind::BeginMutation => {
            next.active_writer_engine = Some(author.clone());
            if let Some(delta) = payload.schema_delta() {
                let staged = current.schema.apply(delta).map_err(|e| {
                    StateError::IllegalTransition(format!(
                        "schema delta does not apply to table {table_id}: {e}"
                    ))
                })?;
                next.staged_schema = Some(staged);
            }
        }
        MutationKind::CommitMutation => {
            next.active_writer_engine = None;
            if let Some(staged) = next.staged_schema.take() {
                next.schema = staged;
                next.schema_version += 1;
            }
        }
        MutationKind::AbortMutation => {
            next.active_writer_engine = None;
            next.staged_schema = None;
        }
        MutationKind::CreateTable | MutationKind::Activate | MutationKind::RollbackComplete => {}
    }

    Ok(next)
}

/// Stateful reducer for one table's log entries.
#[derive(Debug)]
pub struct TableStateMachine {
    table_id: TableId,
    state: Option<TableState>,
}

impl TableStateMachine {
    /// A reducer for a table with no entries yet.
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            state: None,
        }
    }

    /// A reducer that continues from an already derived state.
    pub fn resume(state: TableState) -> Self {
        Self {
            table_id: state.table_id.clone(),
            state: Some(state),
        }
    }

    /// Fold one entry into the running state.
    ///
    /// Any disagreement between the entry and the running fold means the
    /// log itself is inconsistent and is reported as `CorruptLog`.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<(), StateError> {
        let corrupt = |reason: String| StateError::CorruptLog {
            table_id: self.table_id.clone(),
            sequence: entry.sequence,
            reason,
        };

        if entry.table_id != self.table_id {
            return Err(corrupt(format!(
                "entry belongs to table {}",
                entry.table_id
            )));
        }

        let expected_sequence = self.current_sequence() + 1;
        if entry.sequence != expected_sequence {
            return Err(corrupt(format!(
                "expected sequence {expected_sequence}, found {}",
                entry.sequence
            )));
        }

        let running = self.state.as_ref().map(|s| s.current_state);
        if entry.prior_state != running {
            return Err(corrupt(format!(
                "prior state {} disagrees with running state {}",
                describe(entry.prior_state),
                describe(running)
            )));
        }

        let mut next = next_state(
            self.state.as_ref(),
            &self.table_id,
            entry.mutation_kind,
            &entry.payload,
            &entry.author,
        )
        .map_err(|e| corrupt(e.to_string()))?;

        if next.current_state != entry.resulting_state {
            return Err(corrupt(format!(
                "entry declares resulting state {} but {} leads to {}",
                entry.resulting_state, entry.mutation_kind, next.current_state
            )));
        }

        next.last_timestamp = entry.timestamp;
        self.state = Some(next);
        Ok(())
    }

    /// Get the current derived state.
    pub fn current_state(&self) -> Option<&TableState> {
        self.state.as_ref()
    }

    pub fn current_sequence(&self) -> Sequence {
        self.state.as_ref().map(|s| s.current_sequence).unwrap_or(0)
    }

    pub fn into_state(self) -> Option<TableState> {
        self.state
    }
}

fn describe(state: Option<LifecycleState>) -> String {
    state.map_or_else(|| "<none>".to_string(), |s| s.to_string())
}

/// Fold an ordered entry sequence of one table from the beginning.
///
/// Returns `None` for an empty sequence.
pub fn derive_state(entries: &[LogEntry]) -> Result<Option<TableState>, StateError> {
    let Some(first) = entries.first() else {
        return Ok(None);
    };

    let mut machine = TableStateMachine::new(first.table_id.clone());
    for entry in entries {
        machine.apply(entry)?;
    }
    Ok(machine.into_state())
}
