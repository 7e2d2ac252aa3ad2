// Policy composition.

use super::{DenyReason, KindSet, Policy, PolicyContext, Verdict};
use crate::proposal::MutationProposal;
use crate::state::TableState;

/// Allows only if every applicable member allows.
pub struct AllOf {
    name: String,
    policies: Vec<Box<dyn Policy>>,
}

impl AllOf {
    pub fn new(name: impl Into<String>, policies: Vec<Box<dyn Policy>>) -> Self {
        Self {
            name: name.into(),
            policies,
        }
    }
}

impl Policy for AllOf {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self) -> KindSet {
        self.policies
            .iter()
            .fold(KindSet::empty(), |set, p| set.union(p.applies_to()))
    }

    fn evaluate(
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
                return Verdict::Deny(DenyReason::new(
                    format!("{}:{}", self.name, reason.policy_name),
                    reason.human_message,
                ));
            }
        }
        Verdict::Allow
    }
}

/// Allows if any applicable member allows.
///
/// A group none of whose members apply to the proposal allows it.
pub struct AnyOf {
    name: String,
    policies: Vec<Box<dyn Policy>>,
}

impl AnyOf {
    pub fn new(name: impl Into<String>, policies: Vec<Box<dyn Policy>>) -> Self {
        Self {
            name: name.into(),
            policies,
        }
    }
}

impl Policy for AnyOf {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self) -> KindSet {
        self.policies
            .iter()
            .fold(KindSet::empty(), |set, p| set.union(p.applies_to()))
    }

    fn evaluate(
        &self,
        state: Option<&TableState>,
        proposal: &MutationProposal,
        context: &PolicyContext,
    ) -> Verdict {
        let mut denials = Vec::new();
        for policy in &self.policies {
            if !policy.applies_to().contains(proposal.requested_kind) {
                continue;
            }
            match policy.evaluate(state, proposal, context) {
                Verdict::Allow => return Verdict::Allow,
                Verdict::Deny(reason) => {
                    denials.push(format!("{}: {}", reason.policy_name, reason.human_message))
                }
            }
        }

        if denials.is_empty() {
            return Verdict::Allow;
        }
        Verdict::Deny(DenyReason::new(
            self.name.clone(),
            format!("no alternative allowed the proposal ({})", denials.join("; ")),
        ))
    }
}
