// Policy-Driven Drift Handling (Dry-Run)
//
// Converts drift findings into intended actions without enforcement.
// The mapping from severity to action is configurable.

use serde::{Deserialize, Serialize};

use super::drift::{DriftReport, DriftSeverity, DriftType};

/// Intended action for a detected drift.
///
/// These actions are *not executed*; they describe what an enforcing
/// deployment would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntendedAction {
    /// Log only, no escalation.
    Observe,

    /// Notify operators or governance systems.
    Alert,

    /// Would block or roll back in enforcement mode.
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftRule {
    pub severity: DriftSeverity,
    pub action: IntendedAction,
    pub reason: String,
}

/// Severity-to-action mapping, loaded from the arbiter config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftPolicyConfig {
    pub rules: Vec<DriftRule>,
}

impl Default for DriftPolicyConfig {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl DriftPolicyConfig {
    /// Built-in mapping, used when no config is provided.
    pub fn default_policy() -> Self {
        Self {
            rules: vec![
                DriftRule {
                    severity: DriftSeverity::Info,
                    action: IntendedAction::Observe,
                    reason: "informational drift, no action required".into(),
                },
                DriftRule {
                    severity: DriftSeverity::Warning,
                    action: IntendedAction::Alert,
                    reason: "warning-level drift, operator attention recommended".into(),
                },
                DriftRule {
                    severity: DriftSeverity::Critical,
                    action: IntendedAction::Enforce,
                    reason: "critical drift detected, enforcement would be required".into(),
                },
            ],
        }
    }

    fn rule_for(&self, severity: DriftSeverity) -> Option<&DriftRule> {
        self.rules.iter().find(|r| r.severity == severity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub action: IntendedAction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPlan {
    pub decisions: Vec<PolicyDecision>,
}

impl DecisionPlan {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Whether any decision would enforce.
    pub fn requires_enforcement(&self) -> bool {
        self.decisions
            .iter()
            .any(|d| d.action == IntendedAction::Enforce)
    }
}

/// One decision per finding, in finding order.
///
/// A severity with no configured rule is observed.
pub fn evaluate_drift_policy(report: &DriftReport, config: &DriftPolicyConfig) -> DecisionPlan {
    let decisions = report
        .findings
        .iter()
        .map(|finding| {
            let (action, reason) = match config.rule_for(finding.severity) {
                Some(rule) => (rule.action, rule.reason.clone()),
                None => (
                    IntendedAction::Observe,
                    format!("no rule configured for {:?} drift", finding.severity),
                ),
            };
            PolicyDecision {
                drift_type: finding.drift_type,
                severity: finding.severity,
                action,
                reason,
            }
        })
        .collect();

    DecisionPlan { decisions }
}
