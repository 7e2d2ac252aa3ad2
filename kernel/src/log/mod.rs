// Metadata Log
//
// The append-only, per-table ordered log of accepted mutations. It is
// the single source of truth: every table state is derived from it.
//
// Appends for one table are linearized through a per-table mutex; appends
// for different tables never contend. The sequence and prior state of a
// draft are checked against the table's tail under that mutex, and the
// record is handed to the backend, which stores it durably before success
// is reported.

use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::state::LifecycleState;

pub mod codec;
pub mod file;
pub mod memory;
pub mod payload;
pub mod store;

pub use codec::CodecError;
pub use file::FileLogStore;
pub use memory::InMemoryLogStore;
pub use payload::Payload;
pub use store::{BackendError, LogBackend};

/// Position of an entry within its table's log. The first entry is 1.
pub type Sequence = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Default bound on waiting for a table's append lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable identifier for a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of the compute engine (or adapter) that authored a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle trigger declared by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateTable,
    Activate,
    BeginMutation,
    CommitMutation,
    AbortMutation,
    RollbackComplete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 6] = [
        MutationKind::CreateTable,
        MutationKind::Activate,
        MutationKind::BeginMutation,
        MutationKind::CommitMutation,
        MutationKind::AbortMutation,
        MutationKind::RollbackComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateTable => "create_table",
            MutationKind::Activate => "activate",
            MutationKind::BeginMutation => "begin_mutation",
            MutationKind::CommitMutation => "commit_mutation",
            MutationKind::AbortMutation => "abort_mutation",
            MutationKind::RollbackComplete => "rollback_complete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, sequenced record of a table mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: Sequence,
    pub table_id: TableId,
    pub timestamp: Timestamp,
    pub mutation_kind: MutationKind,
    pub payload: Payload,
    /// `None` only for the entry that creates the table.
    pub prior_state: Option<LifecycleState>,
    pub resulting_state: LifecycleState,
    pub author: EngineId,
}

/// An entry before the log has stamped it.
///
/// The draft names the sequence it expects to occupy, so retrying a
/// draft whose first attempt actually landed fails as a conflict instead
/// of inserting a duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub sequence: Sequence,
    pub mutation_kind: MutationKind,
    pub payload: Payload,
    pub prior_state: Option<LifecycleState>,
    pub resulting_state: LifecycleState,
    pub author: EngineId,
}

impl EntryDraft {
    fn into_entry(self, table_id: TableId, timestamp: Timestamp) -> LogEntry {
        LogEntry {
            sequence: self.sequence,
            table_id,
            timestamp,
            mutation_kind: self.mutation_kind,
            payload: self.payload,
            prior_state: self.prior_state,
            resulting_state: self.resulting_state,
            author: self.author,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("sequence conflict on table {table_id}: next sequence is {next}, draft claims {attempted}")]
    Conflict {
        table_id: TableId,
        next: Sequence,
        attempted: Sequence,
    },

    #[error("prior state conflict on table {table_id}: log tail is {tail:?}, draft claims {claimed:?}")]
    PriorStateMismatch {
        table_id: TableId,
        tail: Option<LifecycleState>,
        claimed: Option<LifecycleState>,
    },

    #[error("timed out waiting for the append lock of table {0}")]
    LockTimeout(TableId),

    #[error("log record for table {table_id} at position {position} claims sequence {found}")]
    MisplacedRecord {
        table_id: TableId,
        position: Sequence,
        found: Sequence,
    },

    #[error("storage backend error: {0}")]
    Backend(BackendError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl LogError {
    /// Whether the same draft may be retried as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::LockTimeout(_) | LogError::Backend(_))
    }
}

/// Last committed position of a table, as seen under its append lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    pub sequence: Sequence,
    pub state: Option<LifecycleState>,
    pub timestamp: Timestamp,
}

impl Tail {
    const EMPTY: Tail = Tail {
        sequence: 0,
        state: None,
        timestamp: 0,
    };
}

/// Per-table serialization point. `None` until the tail is loaded.
type TailSlot = Arc<Mutex<Option<Tail>>>;

pub struct MetadataLog<S> {
    store: S,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    tails: DashMap<TableId, TailSlot>,
}

impl<S: LogBackend> MetadataLog<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            tails: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn slot(&self, table_id: &TableId) -> TailSlot {
        Arc::clone(self.tails.entry(table_id.clone()).or_default().value())
    }

    /// Run `f` while holding the table's append lock.
    ///
    /// Everything `f` observes through the writer stays valid until it
    /// returns; no other append to the table can interleave. Fails with
    /// `LockTimeout` if the lock is not acquired within the configured
    /// timeout, in which case `f` never runs.
    pub fn with_table<R>(
        &self,
        table_id: &TableId,
        f: impl FnOnce(&mut TableWriter<'_, S>) -> R,
    ) -> Result<R, LogError> {
        let slot = self.slot(table_id);
        let mut tail = slot
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LogError::LockTimeout(table_id.clone()))?;

        let mut writer = TableWriter {
            log: self,
            table_id,
            tail: &mut *tail,
        };
        let result = f(&mut writer);

        let empty = tail.map_or(true, |t| t.sequence == 0);
        drop(tail);
        if empty {
            self.release_slot(table_id);
        }
        Ok(result)
    }

    /// Forget the lock slot of a table with no entries, unless another
    /// caller still holds it. Keeps lookups of unknown tables from
    /// growing the map.
    fn release_slot(&self, table_id: &TableId) {
        self.tails
            .remove_if(table_id, |_, slot| Arc::strong_count(slot) <= 2);
    }

    /// Append a drafted entry to a table.
    #[instrument(skip(self, draft), fields(table_id = %table_id, sequence = draft.sequence))]
    pub fn append(&self, table_id: &TableId, draft: EntryDraft) -> Result<LogEntry, LogError> {
        self.with_table(table_id, |writer| writer.append(draft))?
    }

    /// Entries of a table whose sequence falls in `range`, in order.
    ///
    /// The result is always a gapless prefix-consistent slice: reading the
    /// same range again returns the same entries, plus any appended since
    /// if the range is open-ended.
    pub fn read(
        &self,
        table_id: &TableId,
        range: impl RangeBounds<Sequence>,
    ) -> Result<Vec<LogEntry>, LogError> {
        let from = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_add(1),
            Bound::Unbounded => 1,
        };
        let to = match range.end_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_sub(1),
            Bound::Unbounded => Sequence::MAX,
        };
        if from > to {
            return Ok(Vec::new());
        }

        let records = self
            .store
            .read_range(table_id, from.max(1), to)
            .map_err(LogError::Backend)?;

        let mut entries = Vec::with_capacity(records.len());
        for (position, record) in records {
            let entry = codec::decode_entry(&record)?;
            if entry.sequence != position {
                return Err(LogError::MisplacedRecord {
                    table_id: table_id.clone(),
                    position,
                    found: entry.sequence,
                });
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Last committed sequence of a table, 0 if it has no entries.
    pub fn current_sequence(&self, table_id: &TableId) -> Result<Sequence, LogError> {
        self.store.last_sequence(table_id).map_err(LogError::Backend)
    }

    /// Every table with at least one entry.
    pub fn tables(&self) -> Result<Vec<TableId>, LogError> {
        self.store.tables().map_err(LogError::Backend)
    }
}

/// Append access to one table, valid while its append lock is held.
pub struct TableWriter<'a, S> {
    log: &'a MetadataLog<S>,
    table_id: &'a TableId,
    tail: &'a mut Option<Tail>,
}

impl<S: LogBackend> TableWriter<'_, S> {
    pub fn table_id(&self) -> &TableId {
        self.table_id
    }

    /// The table's last committed position.
    pub fn tail(&mut self) -> Result<Tail, LogError> {
        if let Some(tail) = *self.tail {
            return Ok(tail);
        }

        let store = &self.log.store;
        let last = store
            .last_sequence(self.table_id)
            .map_err(LogError::Backend)?;

        let tail = if last == 0 {
            Tail::EMPTY
        } else {
            let entry = self
                .log
                .read(self.table_id, last..=last)?
                .pop()
                .ok_or_else(|| {
                    LogError::Backend(BackendError::Io(format!(
                        "record {last} of table {} disappeared",
                        self.table_id
                    )))
                })?;
            Tail {
                sequence: entry.sequence,
                state: Some(entry.resulting_state),
                timestamp: entry.timestamp,
            }
        };

        *self.tail = Some(tail);
        Ok(tail)
    }

    /// Stamp and durably append a draft.
    pub fn append(&mut self, draft: EntryDraft) -> Result<LogEntry, LogError> {
        let tail = self.tail()?;

        if draft.sequence != tail.sequence + 1 {
            warn!(
                table_id = %self.table_id,
                next = tail.sequence + 1,
                attempted = draft.sequence,
                "rejecting append with stale sequence"
            );
            return Err(LogError::Conflict {
                table_id: self.table_id.clone(),
                next: tail.sequence + 1,
                attempted: draft.sequence,
            });
        }
        if draft.prior_state != tail.state {
            return Err(LogError::PriorStateMismatch {
                table_id: self.table_id.clone(),
                tail: tail.state,
                claimed: draft.prior_state,
            });
        }

        // Keep per-table timestamps non-decreasing even if the clock steps back.
        let timestamp = self.log.clock.now_ms().max(tail.timestamp);
        let entry = draft.into_entry(self.table_id.clone(), timestamp);
        let record = codec::encode_entry(&entry)?;

        match self.log.store.append(self.table_id, entry.sequence, &record) {
            Ok(()) => {
                *self.tail = Some(Tail {
                    sequence: entry.sequence,
                    state: Some(entry.resulting_state),
                    timestamp,
                });
                debug!(
                    table_id = %self.table_id,
                    sequence = entry.sequence,
                    kind = %entry.mutation_kind,
                    "appended log entry"
                );
                Ok(entry)
            }
            Err(BackendError::SequenceTaken { next, attempted, .. }) => {
                // Someone outside this process, or an earlier attempt that
                // reported failure, got there first. Reload on next use.
                *self.tail = None;
                Err(LogError::Conflict {
                    table_id: self.table_id.clone(),
                    next,
                    attempted,
                })
            }
            Err(err) => {
                *self.tail = None;
                Err(LogError::Backend(err))
            }
        }
    }
}
