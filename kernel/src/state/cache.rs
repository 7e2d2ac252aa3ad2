// Current-state cache.
//
// Latest derived state per table. Never authoritative: every entry can
// be rebuilt from the log, and the log wins any disagreement.

use dashmap::DashMap;

use super::TableState;
use crate::log::TableId;

#[derive(Debug, Default)]
pub struct StateCache {
    states: DashMap<TableId, TableState>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_id: &TableId) -> Option<TableState> {
        self.states.get(table_id).map(|s| s.value().clone())
    }

    pub fn put(&self, state: TableState) {
        self.states.insert(state.table_id.clone(), state);
    }

    /// Drop a table's cached state so the next read rebuilds it.
    pub fn invalidate(&self, table_id: &TableId) -> Option<TableState> {
        self.states.remove(table_id).map(|(_, state)| state)
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<_> = self.states.iter().map(|s| s.key().clone()).collect();
        tables.sort();
        tables
    }
}
