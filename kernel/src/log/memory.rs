// In-memory log backend.
//
// Durable only for the lifetime of the process. Used by tests,
// simulations and embedders that persist elsewhere.

use dashmap::DashMap;

use super::store::{BackendError, LogBackend};
use super::{Sequence, TableId};

#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    /// Record `n` of a table lives at index `n - 1`.
    tables: DashMap<TableId, Vec<Vec<u8>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record in place, simulating a corrupted backend.
    #[cfg(any(test, feature = "testing"))]
    pub fn tamper(&self, table_id: &TableId, sequence: Sequence, record: Vec<u8>) -> bool {
        match self.tables.get_mut(table_id) {
            Some(mut records) if sequence >= 1 && (sequence as usize) <= records.len() => {
                records[sequence as usize - 1] = record;
                true
            }
            _ => false,
        }
    }
}

impl LogBackend for InMemoryLogStore {
    fn append(
        &self,
        table_id: &TableId,
        sequence: Sequence,
        record: &[u8],
    ) -> Result<(), BackendError> {
        let mut records = self.tables.entry(table_id.clone()).or_default();
        let next = records.len() as Sequence + 1;

        if sequence != next {
            return Err(BackendError::SequenceTaken {
                table_id: table_id.clone(),
                attempted: sequence,
                next,
            });
        }

        records.push(record.to_vec());
        Ok(())
    }

    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError> {
        let Some(records) = self.tables.get(table_id) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .enumerate()
            .map(|(idx, record)| (idx as Sequence + 1, record))
            .filter(|(seq, _)| *seq >= from && *seq <= to)
            .map(|(seq, record)| (seq, record.clone()))
            .collect())
    }

    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError> {
        Ok(self
            .tables
            .get(table_id)
            .map(|records| records.len() as Sequence)
            .unwrap_or(0))
    }

    fn tables(&self) -> Result<Vec<TableId>, BackendError> {
        let mut tables: Vec<TableId> = self
            .tables
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        tables.sort();
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_append() {
        let store = InMemoryLogStore::new();
        let table = TableId::new("t");

        store.append(&table, 1, b"one").unwrap();
        store.append(&table, 2, b"two").unwrap();

        let err = store.append(&table, 2, b"again").unwrap_err();
        assert_eq!(
            err,
            BackendError::SequenceTaken {
                table_id: table.clone(),
                attempted: 2,
                next: 3,
            }
        );

        assert!(store.append(&table, 5, b"gap").is_err());
        assert_eq!(store.last_sequence(&table).unwrap(), 2);
    }

    #[test]
    fn range_reads_are_ordered_and_bounded() {
        let store = InMemoryLogStore::new();
        let table = TableId::new("t");
        for seq in 1..=5 {
            store.append(&table, seq, &[seq as u8]).unwrap();
        }

        let records = store.read_range(&table, 2, 4).unwrap();
        let seqs: Vec<_> = records.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(records[0].1, vec![2u8]);

        assert!(store
            .read_range(&TableId::new("missing"), 1, u64::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn tables_are_partitioned() {
        let store = InMemoryLogStore::new();
        store.append(&TableId::new("b"), 1, b"x").unwrap();
        store.append(&TableId::new("a"), 1, b"y").unwrap();

        assert_eq!(
            store.tables().unwrap(),
            vec![TableId::new("a"), TableId::new("b")]
        );
        assert_eq!(store.last_sequence(&TableId::new("a")).unwrap(), 1);
    }
}
