// Built-in policies.

use std::collections::BTreeSet;

use super::{DenyReason, KindSet, Policy, PolicyContext, Verdict};
use crate::log::payload::Environment;
use crate::log::{EngineId, MutationKind};
use crate::proposal::MutationProposal;
use crate::state::{LifecycleState, TableState};

pub const NO_DESTRUCTIVE_SCHEMA_CHANGE: &str = "no-destructive-schema-change";
pub const SINGLE_WRITER_EXCLUSION: &str = "single-writer-exclusion";
pub const NO_REWRITE_DURING_INGESTION: &str = "no-rewrite-during-ingestion";
pub const SCHEMA_COMPATIBILITY: &str = "schema-compatibility";

/// Denies column drops, lossy type changes and tightening a column to
/// required on an `ACTIVE` table in a protected environment, unless the
/// proposal carries the destructive-change override.
#[derive(Debug, Clone)]
pub struct NoDestructiveSchemaChange {
    protected: Vec<Environment>,
}

impl NoDestructiveSchemaChange {
    pub fn new(protected: Vec<Environment>) -> Self {
        Self { protected }
    }

    /// Protect production only.
    pub fn production() -> Self {
        Self::new(vec![Environment::Production])
    }
}

impl Policy for NoDestructiveSchemaChange {
    fn name(&self) -> &str {
        NO_DESTRUCTIVE_SCHEMA_CHANGE
    }

    fn applies_to(&self) -> KindSet {
        KindSet::of(&[MutationKind::BeginMutation])
    }

    fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        _context: &PolicyContext,
    ) -> Verdict {
        let (Some(state), Some(delta)) = (state, proposal.payload.schema_delta()) else {
            return Verdict::Allow;
        };
        if state.current_state != LifecycleState::Active
            || !self.protected.contains(&state.environment)
            || proposal.allow_destructive
        {
            return Verdict::Allow;
        }

        match delta.first_destructive(&state.schema) {
            Some(change) => Verdict::Deny(DenyReason::new(
                self.name(),
                format!(
                    "refusing to {} on {} table {} without an explicit override",
                    change.describe(),
                    state.environment,
                    state.table_id
                ),
            )),
            None => Verdict::Allow,
        }
    }
}

/// Only one engine may hold a table in `MUTATING`, and only that engine
/// may commit or abort its mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWriterExclusion;

impl Policy for SingleWriterExclusion {
    fn name(&self) -> &str {
        SINGLE_WRITER_EXCLUSION
    }

    fn applies_to(&self) -> KindSet {
        KindSet::of(&[
            MutationKind::BeginMutation,
            MutationKind::CommitMutation,
            MutationKind::AbortMutation,
        ])
    }

    fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        _context: &PolicyContext,
    ) -> Verdict {
        let Some(writer) = state.and_then(|s| s.active_writer_engine.as_ref()) else {
            return Verdict::Allow;
        };
        if writer == &proposal.requested_by {
            return Verdict::Allow;
        }

        let message = match proposal.requested_kind {
            MutationKind::BeginMutation => format!(
                "table {} is already being mutated by engine `{writer}`",
                proposal.table_id
            ),
            kind => format!(
                "engine `{}` cannot {kind}: the active writer of table {} is `{writer}`",
                proposal.requested_by, proposal.table_id
            ),
        };
        Verdict::Deny(DenyReason::new(self.name(), message))
    }
}

/// Denies full-table rewrites while streaming ingestion is registered
/// against the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRewriteDuringIngestion;

impl Policy for NoRewriteDuringIngestion {
    fn name(&self) -> &str {
        NO_REWRITE_DURING_INGESTION
    }

    /// Any kind, since the payload decides.
    fn applies_to(&self) -> KindSet {
        KindSet::all()
    }

    fn evaluate(
        &self,
        _state: Option<&TableState>,
        proposal: &MutationProposal,
        context: &PolicyContext,
    ) -> Verdict {
        if !proposal.payload.is_full_rewrite() || !context.has_active_ingestion() {
            return Verdict::Allow;
        }

        let engines: BTreeSet<&str> = context
            .ingestion_sessions
            .iter()
            .map(|s| s.engine.as_str())
            .collect();
        let engines: Vec<&str> = engines.into_iter().collect();

        Verdict::Deny(DenyReason::new(
            self.name(),
            format!(
                "{} streaming ingestion session(s) active on table {} (engines: {})",
                context.ingestion_sessions.len(),
                proposal.table_id,
                engines.join(", ")
            ),
        ))
    }
}

/// Denies schema deltas that do not apply cleanly to the current schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaCompatibility;

impl Policy for SchemaCompatibility {
    fn name(&self) -> &str {
        SCHEMA_COMPATIBILITY
    }

    fn applies_to(&self) -> KindSet {
        KindSet::of(&[MutationKind::BeginMutation])
    }

    fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        _context: &PolicyContext,
    ) -> Verdict {
        let (Some(state), Some(delta)) = (state, proposal.payload.schema_delta()) else {
            return Verdict::Allow;
        };

        match state.schema.apply(delta) {
            Ok(_) => Verdict::Allow,
            Err(err) => Verdict::Deny(DenyReason::new(
                self.name(),
                format!("schema delta for table {} is invalid: {err}", state.table_id),
            )),
        }
    }
}

/// Restricts which engines may touch tables under an id prefix.
#[derive(Debug, Clone)]
pub struct WriterAllowlist {
    name: String,
    table_prefix: String,
    engines: BTreeSet<EngineId>,
}

impl WriterAllowlist {
    pub fn new(
        name: impl Into<String>,
        table_prefix: impl Into<String>,
        engines: impl IntoIterator<Item = EngineId>,
    ) -> Self {
        Self {
            name: name.into(),
            table_prefix: table_prefix.into(),
            engines: engines.into_iter().collect(),
        }
    }
}

impl Policy for WriterAllowlist {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self) -> KindSet {
        KindSet::all()
    }

    fn evaluate(
        &self,
        _state: Option<&TableState>,
        proposal: &MutationProposal,
        _context: &PolicyContext,
    ) -> Verdict {
        if !proposal.table_id.as_str().starts_with(&self.table_prefix)
            || self.engines.contains(&proposal.requested_by)
        {
            return Verdict::Allow;
        }

        Verdict::Deny(DenyReason::new(
            self.name(),
            format!(
                "engine `{}` is not allowed to modify tables under `{}`",
                proposal.requested_by, self.table_prefix
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::sessions::{IngestionSession, SessionId};
    use crate::log::payload::{
        Column, DataPointer, DataType, Schema, SchemaChange, SchemaDelta, WriteOperation,
    };
    use crate::log::TableId;
    use uuid::Uuid;

    fn state(lifecycle: LifecycleState, environment: Environment) -> TableState {
        TableState {
            table_id: TableId::new("sales.orders"),
            current_state: lifecycle,
            current_sequence: 2,
            schema_version: 1,
            schema: Schema::new(vec![
                Column::new("id", DataType::Int64, false),
                Column::new("note", DataType::String, true),
            ]),
            staged_schema: None,
            environment,
            active_writer_engine: None,
            last_timestamp: 0,
        }
    }

    fn drop_note() -> MutationProposal {
        MutationProposal::begin_schema_change(
            TableId::new("sales.orders"),
            EngineId::new("spark"),
            SchemaDelta::new(vec![SchemaChange::DropColumn { name: "note".into() }]),
            2,
        )
    }

    fn deny_policy(verdict: Verdict) -> String {
        match verdict {
            Verdict::Deny(reason) => reason.policy_name,
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn destructive_change_denied_in_production() {
        let policy = NoDestructiveSchemaChange::production();
        let active = state(LifecycleState::Active, Environment::Production);

        let verdict = policy.evaluate(Some(&active), &drop_note(), &PolicyContext::default());
        assert_eq!(deny_policy(verdict), NO_DESTRUCTIVE_SCHEMA_CHANGE);

        let overridden = drop_note().with_override();
        assert!(policy
            .evaluate(Some(&active), &overridden, &PolicyContext::default())
            .is_allow());
    }

    #[test]
    fn destructive_change_allowed_outside_protected_environments() {
        let policy = NoDestructiveSchemaChange::production();
        let staging = state(LifecycleState::Active, Environment::Staging);

        assert!(policy
            .evaluate(Some(&staging), &drop_note(), &PolicyContext::default())
            .is_allow());
    }

    #[test]
    fn widening_is_not_destructive() {
        let policy = NoDestructiveSchemaChange::production();
        let active = state(LifecycleState::Active, Environment::Production);
        let add = MutationProposal::begin_schema_change(
            TableId::new("sales.orders"),
            EngineId::new("spark"),
            SchemaDelta::new(vec![SchemaChange::AddColumn {
                column: Column::new("region", DataType::String, true),
            }]),
            2,
        );

        assert!(policy
            .evaluate(Some(&active), &add, &PolicyContext::default())
            .is_allow());
    }

    #[test]
    fn second_writer_is_excluded() {
        let mut mutating = state(LifecycleState::Mutating, Environment::Production);
        mutating.active_writer_engine = Some(EngineId::new("spark"));

        let by = |engine: &str, kind| {
            MutationProposal::new(TableId::new("sales.orders"), kind, EngineId::new(engine), 2)
        };

        let verdict = SingleWriterExclusion.evaluate(
            Some(&mutating),
            &by("flink", MutationKind::BeginMutation),
            &PolicyContext::default(),
        );
        assert_eq!(deny_policy(verdict), SINGLE_WRITER_EXCLUSION);

        let verdict = SingleWriterExclusion.evaluate(
            Some(&mutating),
            &by("flink", MutationKind::CommitMutation),
            &PolicyContext::default(),
        );
        assert_eq!(deny_policy(verdict), SINGLE_WRITER_EXCLUSION);

        assert!(SingleWriterExclusion
            .evaluate(
                Some(&mutating),
                &by("spark", MutationKind::CommitMutation),
                &PolicyContext::default(),
            )
            .is_allow());
    }

    #[test]
    fn rewrite_denied_while_ingesting() {
        let active = state(LifecycleState::Active, Environment::Production);
        let rewrite = MutationProposal::begin_write(
            TableId::new("sales.orders"),
            EngineId::new("spark"),
            DataPointer {
                location: "s3://lake/orders/v2".into(),
                operation: WriteOperation::FullRewrite,
            },
            2,
        );
        let ingesting = PolicyContext::new(vec![IngestionSession {
            id: SessionId(Uuid::new_v4()),
            table_id: TableId::new("sales.orders"),
            engine: EngineId::new("flink"),
            started_at: 0,
        }]);

        let verdict = NoRewriteDuringIngestion.evaluate(Some(&active), &rewrite, &ingesting);
        assert_eq!(deny_policy(verdict), NO_REWRITE_DURING_INGESTION);

        assert!(NoRewriteDuringIngestion
            .evaluate(Some(&active), &rewrite, &PolicyContext::default())
            .is_allow());

        let append = rewrite.with_payload(crate::log::Payload::DataPointer(DataPointer {
            location: "s3://lake/orders/v2".into(),
            operation: WriteOperation::Append,
        }));
        assert!(NoRewriteDuringIngestion
            .evaluate(Some(&active), &append, &ingesting)
            .is_allow());
    }

    #[test]
    fn rewrite_on_commit_is_denied_while_ingesting() {
        let mut mutating = state(LifecycleState::Mutating, Environment::Production);
        mutating.active_writer_engine = Some(EngineId::new("spark"));
        let commit = MutationProposal::new(
            TableId::new("sales.orders"),
            MutationKind::CommitMutation,
            EngineId::new("spark"),
            3,
        )
        .with_payload(
            crate::log::Payload::DataPointer(DataPointer {
                location: "s3://lake/orders/v2".into(),
                operation: WriteOperation::FullRewrite,
            }),
        );
        let ingesting = PolicyContext::new(vec![IngestionSession {
            id: SessionId(Uuid::new_v4()),
            table_id: TableId::new("sales.orders"),
            engine: EngineId::new("flink"),
            started_at: 0,
        }]);

        assert!(NoRewriteDuringIngestion
            .applies_to()
            .contains(MutationKind::CommitMutation));
        let verdict = NoRewriteDuringIngestion.evaluate(Some(&mutating), &commit, &ingesting);
        assert_eq!(deny_policy(verdict), NO_REWRITE_DURING_INGESTION);
    }

    #[test]
    fn incompatible_delta_is_denied() {
        let active = state(LifecycleState::Active, Environment::Development);
        let proposal = MutationProposal::begin_schema_change(
            TableId::new("sales.orders"),
            EngineId::new("spark"),
            SchemaDelta::new(vec![SchemaChange::DropColumn {
                name: "missing".into(),
            }]),
            2,
        );

        match SchemaCompatibility.evaluate(Some(&active), &proposal, &PolicyContext::default()) {
            Verdict::Deny(reason) => assert!(reason.human_message.contains("missing")),
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn allowlist_scopes_by_prefix() {
        let policy = WriterAllowlist::new(
            "finance-writers",
            "finance.",
            [EngineId::new("spark-finance")],
        );
        let ctx = PolicyContext::default();

        let outsider = MutationProposal::new(
            TableId::new("finance.ledger"),
            MutationKind::BeginMutation,
            EngineId::new("trino"),
            2,
        );
        assert_eq!(deny_policy(policy.evaluate(None, &outsider, &ctx)), "finance-writers");

        let elsewhere = MutationProposal::new(
            TableId::new("sales.orders"),
            MutationKind::BeginMutation,
            EngineId::new("trino"),
            2,
        );
        assert!(policy.evaluate(None, &elsewhere, &ctx).is_allow());
    }
}
