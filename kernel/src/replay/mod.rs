// Deterministic Replay Engine
//
// Rebuilds table state by folding the metadata log. Replay never writes,
// so reconstructing the same point twice gives the same answer.

use std::ops::RangeBounds;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::log::{LogBackend, LogEntry, LogError, MetadataLog, Sequence, TableId, Timestamp};
use crate::state::{StateError, TableState, TableStateMachine};

pub mod checkpoint;

pub use checkpoint::Checkpoint;

const DEFAULT_BATCH_SIZE: Sequence = 256;

/// How far into a table's history to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "up_to", content = "value", rename_all = "snake_case")]
pub enum ReplayPoint {
    /// Through the entry with this sequence.
    Sequence(Sequence),
    /// Through the last entry stamped at or before this time.
    Timestamp(Timestamp),
    Latest,
}

impl ReplayPoint {
    fn admits(self, entry: &LogEntry) -> bool {
        match self {
            ReplayPoint::Sequence(n) => entry.sequence <= n,
            ReplayPoint::Timestamp(t) => entry.timestamp <= t,
            ReplayPoint::Latest => true,
        }
    }
}

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("checkpoint of table {table_id} at sequence {sequence} is past the requested point")]
    CheckpointAhead { table_id: TableId, sequence: Sequence },

    #[error("checkpoint of table {table_id} at sequence {sequence} does not match the log: {reason}")]
    CheckpointMismatch {
        table_id: TableId,
        sequence: Sequence,
        reason: String,
    },
}

impl ReplayError {
    /// Whether the failure comes from the log content itself rather than
    /// from access to it.
    pub fn is_corrupt(&self) -> bool {
        match self {
            ReplayError::State(StateError::CorruptLog { .. }) => true,
            ReplayError::Log(err) => matches!(
                err,
                LogError::Codec(_) | LogError::MisplacedRecord { .. }
            ),
            _ => false,
        }
    }
}

/// Outcome of rebuilding every table.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<TableState>,
    pub failed: Vec<(TableId, ReplayError)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Read-only view over a metadata log that derives table state.
pub struct ReplayEngine<'a, S> {
    log: &'a MetadataLog<S>,
    batch_size: Sequence,
}

impl<'a, S: LogBackend> ReplayEngine<'a, S> {
    pub fn new(log: &'a MetadataLog<S>) -> Self {
        Self {
            log,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Read entries in batches of `batch_size`. Smaller batches bound the
    /// work done past a timestamp target.
    pub fn with_batch_size(mut self, batch_size: Sequence) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Derive a table's state at `point`.
    ///
    /// Returns `None` if no entry of the table falls at or before `point`.
    #[instrument(skip(self), fields(table_id = %table_id))]
    pub fn reconstruct(
        &self,
        table_id: &TableId,
        point: ReplayPoint,
    ) -> Result<Option<TableState>, ReplayError> {
        let mut machine = TableStateMachine::new(table_id.clone());
        self.fold(&mut machine, table_id, 1, point)?;
        Ok(machine.into_state())
    }

    /// Capture the state at `point` as a replay starting point.
    pub fn checkpoint(
        &self,
        table_id: &TableId,
        point: ReplayPoint,
    ) -> Result<Option<Checkpoint>, ReplayError> {
        let Some(state) = self.reconstruct(table_id, point)? else {
            return Ok(None);
        };
        let sequence = state.current_sequence;
        let anchor = self
            .log
            .read(table_id, sequence..=sequence)?
            .pop()
            .ok_or_else(|| ReplayError::CheckpointMismatch {
                table_id: table_id.clone(),
                sequence,
                reason: "the log has no entry at that sequence".into(),
            })?;
        Ok(Some(Checkpoint::new(state, anchor)))
    }

    /// Derive a table's state at `point`, folding only the entries after
    /// `checkpoint`.
    ///
    /// The entry the checkpoint ends at must still be in the log exactly
    /// as captured, so a checkpoint from a different or rewritten log is
    /// refused.
    #[instrument(skip(self, checkpoint), fields(table_id = %checkpoint.table_id(), from = checkpoint.sequence()))]
    pub fn reconstruct_from(
        &self,
        checkpoint: &Checkpoint,
        point: ReplayPoint,
    ) -> Result<TableState, ReplayError> {
        let table_id = checkpoint.table_id();
        let base = checkpoint.state();

        let ahead = match point {
            ReplayPoint::Sequence(n) => n < base.current_sequence,
            ReplayPoint::Timestamp(t) => t < base.last_timestamp,
            ReplayPoint::Latest => false,
        };
        if ahead {
            return Err(ReplayError::CheckpointAhead {
                table_id: table_id.clone(),
                sequence: base.current_sequence,
            });
        }

        let mismatch = |reason: String| ReplayError::CheckpointMismatch {
            table_id: table_id.clone(),
            sequence: base.current_sequence,
            reason,
        };
        let recorded = checkpoint.anchor();
        if recorded.sequence != base.current_sequence
            || recorded.resulting_state != base.current_state
            || recorded.timestamp != base.last_timestamp
        {
            return Err(mismatch("anchor entry disagrees with the captured state".into()));
        }
        let anchor = self
            .log
            .read(table_id, base.current_sequence..=base.current_sequence)?
            .pop()
            .ok_or_else(|| mismatch("the log has no entry at that sequence".into()))?;
        if &anchor != recorded {
            return Err(mismatch(format!(
                "log entry is {} by `{}` at {}, checkpoint was taken after {} by `{}` at {}",
                anchor.mutation_kind,
                anchor.author,
                anchor.timestamp,
                recorded.mutation_kind,
                recorded.author,
                recorded.timestamp
            )));
        }

        let mut machine = TableStateMachine::resume(base.clone());
        self.fold(&mut machine, table_id, base.current_sequence + 1, point)?;
        machine
            .into_state()
            .ok_or_else(|| mismatch("resumed fold lost its state".into()))
    }

    /// Rebuild every table in the log.
    ///
    /// A table that fails to fold is reported and skipped; the others
    /// still recover.
    #[instrument(skip(self))]
    pub fn recover_all(&self) -> Result<RecoveryReport, ReplayError> {
        let mut report = RecoveryReport::default();

        for table_id in self.log.tables()? {
            match self.reconstruct(&table_id, ReplayPoint::Latest) {
                Ok(Some(state)) => report.recovered.push(state),
                Ok(None) => {}
                Err(err) => {
                    error!(table_id = %table_id, error = %err, "table failed to recover");
                    report.failed.push((table_id, err));
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "replayed metadata log"
        );
        Ok(report)
    }

    /// Raw entries in `range`, for audit listings.
    pub fn history(
        &self,
        table_id: &TableId,
        range: impl RangeBounds<Sequence>,
    ) -> Result<Vec<LogEntry>, ReplayError> {
        Ok(self.log.read(table_id, range)?)
    }

    /// Apply entries from `from` onward until one falls past `point`.
    fn fold(
        &self,
        machine: &mut TableStateMachine,
        table_id: &TableId,
        mut from: Sequence,
        point: ReplayPoint,
    ) -> Result<(), ReplayError> {
        loop {
            let mut to = from.saturating_add(self.batch_size - 1);
            if let ReplayPoint::Sequence(n) = point {
                to = to.min(n);
            }
            if from > to {
                return Ok(());
            }

            let entries = self.log.read(table_id, from..=to)?;
            for entry in &entries {
                if !point.admits(entry) {
                    return Ok(());
                }
                machine.apply(entry)?;
            }
            if (entries.len() as Sequence) < to - from + 1 {
                return Ok(());
            }
            from = to + 1;
        }
    }
}
