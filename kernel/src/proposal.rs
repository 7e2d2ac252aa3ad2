// Mutation Proposals
//
// What an adapter submits on behalf of an engine. A proposal names the
// sequence it believes is current; the coordinator rejects it as a
// conflict if that belief is stale.

use serde::{Deserialize, Serialize};

use crate::log::payload::{DataPointer, Environment, Payload, Schema, SchemaDelta};
use crate::log::{EngineId, MutationKind, Sequence, TableId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationProposal {
    pub table_id: TableId,
    pub requested_kind: MutationKind,
    pub requested_by: EngineId,
    #[serde(default)]
    pub payload: Payload,
    /// Sequence the proposer last observed; 0 for a table that does not exist.
    pub expected_prior_sequence: Sequence,
    /// Explicit operator override for destructive schema changes.
    #[serde(default)]
    pub allow_destructive: bool,
}

impl MutationProposal {
    pub fn new(
        table_id: TableId,
        requested_kind: MutationKind,
        requested_by: EngineId,
        expected_prior_sequence: Sequence,
    ) -> Self {
        Self {
            table_id,
            requested_kind,
            requested_by,
            payload: Payload::Marker,
            expected_prior_sequence,
            allow_destructive: false,
        }
    }

    pub fn create_table(
        table_id: TableId,
        requested_by: EngineId,
        schema: Schema,
        environment: Environment,
    ) -> Self {
        Self::new(table_id, MutationKind::CreateTable, requested_by, 0).with_payload(
            Payload::TableDefinition {
                schema,
                environment,
            },
        )
    }

    pub fn begin_schema_change(
        table_id: TableId,
        requested_by: EngineId,
        delta: SchemaDelta,
        expected_prior_sequence: Sequence,
    ) -> Self {
        Self::new(
            table_id,
            MutationKind::BeginMutation,
            requested_by,
            expected_prior_sequence,
        )
        .with_payload(Payload::SchemaDelta(delta))
    }

    pub fn begin_write(
        table_id: TableId,
        requested_by: EngineId,
        pointer: DataPointer,
        expected_prior_sequence: Sequence,
    ) -> Self {
        Self::new(
            table_id,
            MutationKind::BeginMutation,
            requested_by,
            expected_prior_sequence,
        )
        .with_payload(Payload::DataPointer(pointer))
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Mark the proposal as carrying the destructive-change override.
    pub fn with_override(mut self) -> Self {
        self.allow_destructive = true;
        self
    }
}
