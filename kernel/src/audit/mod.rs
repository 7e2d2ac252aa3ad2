// Audit
//
// Compares the state the log says a table should be in with what an
// external catalog reports, and plans (never executes) a response.

pub mod drift;
pub mod plan;
pub mod simulate;

pub use drift::{
    detect_drift, DriftFinding, DriftReport, DriftSeverity, DriftType, ObservedTableState,
};
pub use plan::{
    evaluate_drift_policy, DecisionPlan, DriftPolicyConfig, DriftRule, IntendedAction,
    PolicyDecision,
};
pub use simulate::{simulate_table, SimulationError, SimulationResult};
