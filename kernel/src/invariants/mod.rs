// Invariant Framework
//
// Invariants are pure rules that must hold before a proposed mutation is
// admitted to the log. Violations are detected *before* anything is
// written, so a denied proposal leaves no trace beyond its verdict.

use serde::{Deserialize, Serialize};

use crate::log::MutationKind;
use crate::proposal::MutationProposal;
use crate::state::TableState;

pub mod builtin;
pub mod compose;
pub mod config;
pub mod sessions;

pub use builtin::{
    NoDestructiveSchemaChange, NoRewriteDuringIngestion, SchemaCompatibility,
    SingleWriterExclusion, WriterAllowlist,
};
pub use compose::{AllOf, AnyOf};
pub use config::PolicySpec;
pub use sessions::{IngestionSession, SessionId, SessionRegistry};

/// Structured reason returned with a denied proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("policy `{policy_name}` denied the proposal: {human_message}")]
pub struct DenyReason {
    pub policy_name: String,
    pub human_message: String,
}

impl DenyReason {
    pub fn new(policy_name: impl Into<String>, human_message: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            human_message: human_message.into(),
        }
    }
}

/// Result of policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Set of mutation kinds a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::of(&MutationKind::ALL)
    }

    pub fn of(kinds: &[MutationKind]) -> Self {
        Self(kinds.iter().fold(0, |bits, kind| bits | Self::bit(*kind)))
    }

    fn bit(kind: MutationKind) -> u8 {
        1 << (kind as u8)
    }

    pub fn contains(self, kind: MutationKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn union(self, other: KindSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Facts from outside the log that policies may consult.
///
/// Built by the coordinator as a value snapshot before evaluation, so a
/// policy sees exactly its declared inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyContext {
    /// Streaming-ingestion sessions registered against the table.
    pub ingestion_sessions: Vec<IngestionSession>,
}

impl PolicyContext {
    pub fn new(ingestion_sessions: Vec<IngestionSession>) -> Self {
        Self { ingestion_sessions }
    }

    pub fn has_active_ingestion(&self) -> bool {
        !self.ingestion_sessions.is_empty()
    }
}

/// Trait implemented by all policies.
///
/// Policies must be:
/// - Pure over `(state, proposal, context)`
/// - Deterministic
/// - Side-effect free
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Mutation kinds this policy has an opinion on.
    fn applies_to(&self) -> KindSet;

    /// `state` is `None` when the table does not exist yet.
    fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        context: &PolicyContext,
    ) -> Verdict;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy `{0}` is already registered")]
    DuplicateName(String),

    #[error("policy `{0}` applies to no mutation kinds")]
    AppliesToNothing(String),

    #[error("invalid policy `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

/// One row of a full evaluation trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTrace {
    pub policy_name: String,
    pub outcome: TraceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum TraceOutcome {
    Allowed,
    Denied(String),
    /// The policy does not apply to the proposal's mutation kind.
    NotApplicable,
}

/// Invariant engine that evaluates an ordered set of policies.
#[derive(Default)]
pub struct InvariantEngine {
    policies: Vec<Box<dyn Policy>>,
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// Engine holding the built-in policy set in its default order.
    pub fn with_builtin_policies() -> Self {
        Self {
            policies: PolicySpec::defaults().iter().map(PolicySpec::build).collect(),
        }
    }

    /// Register a policy after those already registered.
    pub fn register<P: Policy + 'static>(&mut self, policy: P) -> Result<(), PolicyError> {
        self.register_boxed(Box::new(policy))
    }

    pub fn register_boxed(&mut self, policy: Box<dyn Policy>) -> Result<(), PolicyError> {
        if self.policies.iter().any(|p| p.name() == policy.name()) {
            return Err(PolicyError::DuplicateName(policy.name().to_string()));
        }
        if policy.applies_to().is_empty() {
            return Err(PolicyError::AppliesToNothing(policy.name().to_string()));
        }
        self.policies.push(policy);
        Ok(())
    }

    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Evaluate the policies in registration order.
    ///
    /// Stops at the first denial.
    pub fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        context: &PolicyContext,
    ) -> Verdict {
        for policy in &self.policies {
            if !policy.applies_to().contains(proposal.requested_kind) {
                continue;
            }
            if let Verdict::Deny(reason) = policy.evaluate(state, proposal, context) {
                return Verdict::Deny(reason);
            }
        }
        Verdict::Allow
    }

    /// Evaluate every policy without short-circuiting, for audit.
    pub fn evaluate_all(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        context: &PolicyContext,
    ) -> Vec<PolicyTrace> {
        self.policies
            .iter()
            .map(|policy| {
                let outcome = if !policy.applies_to().contains(proposal.requested_kind) {
                    TraceOutcome::NotApplicable
                } else {
                    match policy.evaluate(state, proposal, context) {
                        Verdict::Allow => TraceOutcome::Allowed,
                        Verdict::Deny(reason) => TraceOutcome::Denied(reason.human_message),
                    }
                };
                PolicyTrace {
                    policy_name: policy.name().to_string(),
                    outcome,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantEngine")
            .field("policies", &self.policy_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EngineId, TableId};

    struct NoMutationFromCreated;

    impl Policy for NoMutationFromCreated {
        fn name(&self) -> &str {
            "no-mutation-from-created"
        }

        fn applies_to(&self) -> KindSet {
            KindSet::of(&[MutationKind::BeginMutation])
        }

        fn evaluate(
            &self,
            state: Option<&TableState>,
            _proposal: &MutationProposal,
            _context: &PolicyContext,
        ) -> Verdict {
            match state {
                Some(s) if s.current_state == crate::state::LifecycleState::Created => {
                    Verdict::Deny(DenyReason::new(
                        self.name(),
                        "cannot mutate table before activation",
                    ))
                }
                _ => Verdict::Allow,
            }
        }
    }

    struct AlwaysDeny(&'static str);

    impl Policy for AlwaysDeny {
        fn name(&self) -> &str {
            self.0
        }

        fn applies_to(&self) -> KindSet {
            KindSet::all()
        }

        fn evaluate(
            &self,
            _state: Option<&TableState>,
            _proposal: &MutationProposal,
            _context: &PolicyContext,
        ) -> Verdict {
            Verdict::Deny(DenyReason::new(self.0, "always"))
        }
    }

    fn proposal(kind: MutationKind) -> MutationProposal {
        MutationProposal::new(TableId::new("t"), kind, EngineId::new("spark"), 0)
    }

    #[test]
    fn kind_set_membership() {
        let set = KindSet::of(&[MutationKind::BeginMutation, MutationKind::CommitMutation]);
        assert!(set.contains(MutationKind::BeginMutation));
        assert!(!set.contains(MutationKind::Activate));
        assert!(KindSet::all().contains(MutationKind::RollbackComplete));
        assert!(KindSet::empty().is_empty());
        assert!(set
            .union(KindSet::of(&[MutationKind::Activate]))
            .contains(MutationKind::Activate));
    }

    #[test]
    fn first_denial_wins() {
        let mut engine = InvariantEngine::new();
        engine.register(AlwaysDeny("first")).unwrap();
        engine.register(AlwaysDeny("second")).unwrap();

        let verdict = engine.evaluate(
            None,
            &proposal(MutationKind::CreateTable),
            &PolicyContext::default(),
        );

        match verdict {
            Verdict::Deny(reason) => assert_eq!(reason.policy_name, "first"),
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn inapplicable_policies_are_skipped() {
        let mut engine = InvariantEngine::new();
        engine.register(NoMutationFromCreated).unwrap();

        let verdict = engine.evaluate(
            None,
            &proposal(MutationKind::Activate),
            &PolicyContext::default(),
        );
        assert!(verdict.is_allow());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut engine = InvariantEngine::new();
        engine.register(AlwaysDeny("dup")).unwrap();

        assert_eq!(
            engine.register(AlwaysDeny("dup")).unwrap_err(),
            PolicyError::DuplicateName("dup".into())
        );
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn trace_covers_every_policy() {
        let mut engine = InvariantEngine::new();
        engine.register(NoMutationFromCreated).unwrap();
        engine.register(AlwaysDeny("a")).unwrap();
        engine.register(AlwaysDeny("b")).unwrap();

        let trace = engine.evaluate_all(
            None,
            &proposal(MutationKind::Activate),
            &PolicyContext::default(),
        );

        assert_eq!(trace.len(), 3);
        assert_eq!(trace[0].outcome, TraceOutcome::NotApplicable);
        assert_eq!(trace[1].outcome, TraceOutcome::Denied("always".into()));
        assert_eq!(trace[2].policy_name, "b");
    }

    #[test]
    fn builtin_engine_order() {
        let engine = InvariantEngine::with_builtin_policies();
        assert_eq!(
            engine.policy_names(),
            vec![
                "schema-compatibility",
                "no-destructive-schema-change",
                "single-writer-exclusion",
                "no-rewrite-during-ingestion",
            ]
        );
    }
}
