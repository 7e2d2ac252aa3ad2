// Metadata Log Storage Abstraction
//
// Defines the durability contract for the authoritative metadata log.
// Implementations may persist to disk, object storage, databases, etc.
// Records are opaque bytes here; encoding belongs to the log layer.

use std::sync::Arc;

use super::{Sequence, TableId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("sequence {attempted} on table {table_id} is not next; next free sequence is {next}")]
    SequenceTaken {
        table_id: TableId,
        attempted: Sequence,
        next: Sequence,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// Storage backend for the metadata log.
///
/// Properties required from implementations:
/// - Append-only, partitioned by table
/// - Conditional append: a record lands only at `last + 1`
/// - Durable before `append` returns `Ok`
/// - Ordered range reads that only ever expose durable records
///
/// Implementations MUST NOT:
/// - Reorder records
/// - Mutate existing records
/// - Allow sequence gaps
pub trait LogBackend: Send + Sync {
    /// Store `record` as `sequence` of `table_id`.
    ///
    /// Fails with `SequenceTaken` unless `sequence` is exactly one past
    /// the last stored sequence for the table (1 for a new table).
    fn append(&self, table_id: &TableId, sequence: Sequence, record: &[u8])
        -> Result<(), BackendError>;

    /// Records with sequence in `from..=to`, in order.
    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError>;

    /// Last stored sequence for the table, 0 if the table has no records.
    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError>;

    /// Every table with at least one record.
    fn tables(&self) -> Result<Vec<TableId>, BackendError>;
}

impl<B: LogBackend + ?Sized> LogBackend for Box<B> {
    fn append(
        &self,
        table_id: &TableId,
        sequence: Sequence,
        record: &[u8],
    ) -> Result<(), BackendError> {
        (**self).append(table_id, sequence, record)
    }

    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError> {
        (**self).read_range(table_id, from, to)
    }

    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError> {
        (**self).last_sequence(table_id)
    }

    fn tables(&self) -> Result<Vec<TableId>, BackendError> {
        (**self).tables()
    }
}

impl<B: LogBackend + ?Sized> LogBackend for Arc<B> {
    fn append(
        &self,
        table_id: &TableId,
        sequence: Sequence,
        record: &[u8],
    ) -> Result<(), BackendError> {
        (**self).append(table_id, sequence, record)
    }

    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError> {
        (**self).read_range(table_id, from, to)
    }

    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError> {
        (**self).last_sequence(table_id)
    }

    fn tables(&self) -> Result<Vec<TableId>, BackendError> {
        (**self).tables()
    }
}
