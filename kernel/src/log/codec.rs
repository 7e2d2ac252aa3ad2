// Persisted Entry Format
//
// Every log entry is stored as one self-describing record with a
// stable schema. The payload is encoded separately and stored as
// opaque bytes, so the record layout never depends on payload kind.

use serde::{Deserialize, Serialize};

use super::payload::Payload;
use super::{EngineId, LogEntry, MutationKind, Sequence, TableId, Timestamp};
use crate::state::LifecycleState;

/// Version of the record layout written by this build.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode log record: {0}")]
    Encode(String),

    #[error("failed to decode log record: {0}")]
    Decode(String),

    #[error("unsupported log record format version {0}")]
    UnsupportedVersion(u32),
}

/// On-disk shape of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub format_version: u32,
    pub sequence: Sequence,
    pub table_id: String,
    pub timestamp: Timestamp,
    pub mutation_kind: MutationKind,
    pub prior_state: Option<LifecycleState>,
    pub resulting_state: LifecycleState,
    pub payload: Vec<u8>,
    pub author: String,
}

pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_payload(bytes: &[u8]) -> Result<Payload, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

impl PersistedEntry {
    pub fn from_entry(entry: &LogEntry) -> Result<Self, CodecError> {
        Ok(Self {
            format_version: FORMAT_VERSION,
            sequence: entry.sequence,
            table_id: entry.table_id.as_str().to_string(),
            timestamp: entry.timestamp,
            mutation_kind: entry.mutation_kind,
            prior_state: entry.prior_state,
            resulting_state: entry.resulting_state,
            payload: encode_payload(&entry.payload)?,
            author: entry.author.as_str().to_string(),
        })
    }

    pub fn into_entry(self) -> Result<LogEntry, CodecError> {
        if self.format_version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(self.format_version));
        }

        Ok(LogEntry {
            sequence: self.sequence,
            table_id: TableId::new(self.table_id),
            timestamp: self.timestamp,
            mutation_kind: self.mutation_kind,
            payload: decode_payload(&self.payload)?,
            prior_state: self.prior_state,
            resulting_state: self.resulting_state,
            author: EngineId::new(self.author),
        })
    }
}

/// Encode an entry into its persisted byte form.
pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>, CodecError> {
    let record = PersistedEntry::from_entry(entry)?;
    serde_json::to_vec(&record).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode an entry from its persisted byte form.
pub fn decode_entry(bytes: &[u8]) -> Result<LogEntry, CodecError> {
    let record: PersistedEntry =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    record.into_entry()
}
