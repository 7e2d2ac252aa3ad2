// Drift Detection & Classification
//
// Compares expected table state (from replay) with the state an
// external catalog reports, and classifies drift by severity.

use serde::{Deserialize, Serialize};

use crate::log::{EngineId, TableId};
use crate::state::{LifecycleState, TableState};

/// What an external catalog reports about a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTableState {
    pub table_id: TableId,
    pub schema_version: u64,
    #[serde(default)]
    pub active_writer: Option<EngineId>,
    /// Data written but not yet committed by any arbitrated mutation.
    #[serde(default)]
    pub has_uncommitted_snapshot: bool,
}

/// Severity of detected drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    /// Informational drift (no immediate risk).
    Info,

    /// Warning-level drift (potential risk).
    Warning,

    /// Critical drift (data correctness at risk).
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    UnexpectedMutation,
    SchemaMismatch,
    WriterMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub findings: Vec<DriftFinding>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn highest_severity(&self) -> Option<DriftSeverity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Detect and classify drift between expected and observed state.
pub fn detect_drift(expected: &TableState, observed: &ObservedTableState) -> DriftReport {
    let mut findings = Vec::new();

    // Data landed while no mutation was arbitrated.
    if expected.current_state == LifecycleState::Active && observed.has_uncommitted_snapshot {
        findings.push(DriftFinding {
            drift_type: DriftType::UnexpectedMutation,
            severity: DriftSeverity::Warning,
            message: format!(
                "table {} has an uncommitted snapshot while expected state is ACTIVE",
                expected.table_id
            ),
        });
    }

    if observed.schema_version > expected.schema_version {
        findings.push(DriftFinding {
            drift_type: DriftType::SchemaMismatch,
            severity: DriftSeverity::Critical,
            message: format!(
                "catalog schema version {} is ahead of arbitrated version {}",
                observed.schema_version, expected.schema_version
            ),
        });
    } else if observed.schema_version < expected.schema_version {
        findings.push(DriftFinding {
            drift_type: DriftType::SchemaMismatch,
            severity: DriftSeverity::Warning,
            message: format!(
                "catalog schema version {} lags arbitrated version {}",
                observed.schema_version, expected.schema_version
            ),
        });
    }

    match (&expected.active_writer_engine, &observed.active_writer) {
        (expected_writer, Some(observed_writer))
            if expected_writer.as_ref() != Some(observed_writer) =>
        {
            findings.push(DriftFinding {
                drift_type: DriftType::WriterMismatch,
                severity: DriftSeverity::Critical,
                message: match expected_writer {
                    Some(w) => format!("engine `{observed_writer}` is writing, but `{w}` holds the mutation"),
                    None => format!("engine `{observed_writer}` is writing with no arbitrated mutation"),
                },
            });
        }
        (Some(expected_writer), None) => findings.push(DriftFinding {
            drift_type: DriftType::WriterMismatch,
            severity: DriftSeverity::Info,
            message: format!("engine `{expected_writer}` holds the mutation but is not seen writing"),
        }),
        _ => {}
    }

    DriftReport { findings }
}
