// End-to-End Audit Simulation
//
// Runs the full pipeline in dry-run mode:
// log → replay → drift → policy → decision plan

use serde::Serialize;

use super::drift::{detect_drift, DriftReport, ObservedTableState};
use super::plan::{evaluate_drift_policy, DecisionPlan, DriftPolicyConfig};
use crate::log::{LogBackend, TableId};
use crate::replay::{ReplayEngine, ReplayError, ReplayPoint};
use crate::state::TableState;

/// Result of a full simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub expected_state: TableState,
    pub drift_report: DriftReport,
    pub decision_plan: DecisionPlan,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),

    #[error("table {0} has no entries in the log")]
    UnknownTable(TableId),

    #[error("observed state describes table {observed}, not {requested}")]
    TableMismatch { requested: TableId, observed: TableId },
}

/// Run a full end-to-end simulation.
///
/// This function is:
/// - deterministic
/// - side-effect free
/// - safe to run repeatedly
pub fn simulate_table<S: LogBackend>(
    replay: &ReplayEngine<'_, S>,
    table_id: &TableId,
    observed: &ObservedTableState,
    policy: &DriftPolicyConfig,
) -> Result<SimulationResult, SimulationError> {
    if &observed.table_id != table_id {
        return Err(SimulationError::TableMismatch {
            requested: table_id.clone(),
            observed: observed.table_id.clone(),
        });
    }

    let expected_state = replay
        .reconstruct(table_id, ReplayPoint::Latest)?
        .ok_or_else(|| SimulationError::UnknownTable(table_id.clone()))?;

    let drift_report = detect_drift(&expected_state, observed);
    let decision_plan = evaluate_drift_policy(&drift_report, policy);

    Ok(SimulationResult {
        expected_state,
        drift_report,
        decision_plan,
    })
}
