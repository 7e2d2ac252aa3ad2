// Ingestion session registry.
//
// Tracks streaming-ingestion sessions per table. Lives beside the log,
// never in it: sessions are operational facts, not table mutations.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::log::{EngineId, TableId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSession {
    pub id: SessionId,
    pub table_id: TableId,
    pub engine: EngineId,
    pub started_at: Timestamp,
}

#[derive(Debug)]
pub struct SessionRegistry {
    clock: Arc<dyn Clock>,
    sessions: DashMap<TableId, Vec<IngestionSession>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: DashMap::new(),
        }
    }

    /// Register a streaming-ingestion session against a table.
    pub fn register(&self, table_id: &TableId, engine: &EngineId) -> SessionId {
        let session = IngestionSession {
            id: SessionId(Uuid::new_v4()),
            table_id: table_id.clone(),
            engine: engine.clone(),
            started_at: self.clock.now_ms(),
        };
        let id = session.id;

        self.sessions
            .entry(table_id.clone())
            .or_default()
            .push(session);

        info!(table_id = %table_id, engine = %engine, session = %id, "ingestion session registered");
        id
    }

    /// End a session. Returns `false` if it was not registered.
    pub fn end(&self, table_id: &TableId, id: SessionId) -> bool {
        let Some(mut sessions) = self.sessions.get_mut(table_id) else {
            return false;
        };

        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        let removed = sessions.len() != before;
        let now_empty = sessions.is_empty();
        drop(sessions);

        if now_empty {
            self.sessions.remove_if(table_id, |_, s| s.is_empty());
        }
        if removed {
            info!(table_id = %table_id, session = %id, "ingestion session ended");
        }
        removed
    }

    /// Snapshot of the sessions active against a table.
    pub fn active(&self, table_id: &TableId) -> Vec<IngestionSession> {
        self.sessions
            .get(table_id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn count(&self, table_id: &TableId) -> usize {
        self.sessions.get(table_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn register_and_end() {
        let registry = SessionRegistry::new(Arc::new(ManualClock::new(42)));
        let table = TableId::new("events");
        let other = TableId::new("orders");

        let a = registry.register(&table, &EngineId::new("flink"));
        let b = registry.register(&table, &EngineId::new("kafka-connect"));

        assert_eq!(registry.count(&table), 2);
        assert_eq!(registry.count(&other), 0);
        assert_eq!(registry.active(&table)[0].started_at, 42);

        assert!(registry.end(&table, a));
        assert!(!registry.end(&table, a));
        assert!(!registry.end(&other, b));
        assert_eq!(registry.count(&table), 1);

        assert!(registry.end(&table, b));
        assert!(registry.active(&table).is_empty());
    }
}
