// Mutation Coordinator
//
// The single entry point adapters use to change a table. Every proposal
// is decided against the table's current state while the table's append
// lock is held, so the decision and the append are one atomic step.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::invariants::{
    DenyReason, InvariantEngine, PolicyContext, PolicyTrace, SessionRegistry, Verdict,
};
use crate::log::codec::CodecError;
use crate::log::{
    EntryDraft, LogBackend, LogEntry, LogError, MetadataLog, Sequence, TableId, TableWriter,
};
use crate::proposal::MutationProposal;
use crate::replay::{ReplayEngine, ReplayError, ReplayPoint};
use crate::state::{self, StateCache, StateError, TableState, TableStateMachine};

/// Decision on a well-formed proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Accepted { entry: LogEntry },
    Rejected { reason: DenyReason },
}

impl ProposalOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProposalOutcome::Accepted { .. })
    }
}

/// What `propose` would decide, without appending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DryRunOutcome {
    WouldAccept { resulting_state: TableState },
    Rejected { reason: DenyReason },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("conflict on table {table_id}: proposal expected sequence {expected_prior}, current is {current}")]
    Conflict {
        table_id: TableId,
        expected_prior: Sequence,
        current: Sequence,
    },

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("corrupt log for table {table_id}: {reason}")]
    CorruptLog { table_id: TableId, reason: String },

    #[error("I/O failure: {0}")]
    IoFailure(String),
}

impl CoordinatorError {
    /// Whether resubmitting the same proposal may succeed.
    ///
    /// A conflict needs a fresh read of the table first; corruption and
    /// illegal transitions never resolve on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::IoFailure(_))
    }
}

enum Decision {
    Allow(TableState),
    Deny(DenyReason),
}

pub struct MutationCoordinator<S> {
    log: Arc<MetadataLog<S>>,
    invariants: InvariantEngine,
    sessions: Arc<SessionRegistry>,
    cache: StateCache,
    /// Tables whose log does not fold, with the reason.
    quarantine: DashMap<TableId, String>,
}

impl<S: LogBackend> MutationCoordinator<S> {
    /// Replay every table and start accepting proposals.
    ///
    /// Tables whose log is corrupt are quarantined rather than failing
    /// startup; a storage failure aborts it.
    #[instrument(skip_all)]
    pub fn open(
        log: Arc<MetadataLog<S>>,
        invariants: InvariantEngine,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self, CoordinatorError> {
        let coordinator = Self {
            log,
            invariants,
            sessions,
            cache: StateCache::new(),
            quarantine: DashMap::new(),
        };

        let report = ReplayEngine::new(&*coordinator.log)
            .recover_all()
            .map_err(|e| CoordinatorError::IoFailure(e.to_string()))?;

        for state in report.recovered {
            coordinator.cache.put(state);
        }
        for (table_id, err) in report.failed {
            if !err.is_corrupt() {
                return Err(coordinator.replay_failure(&table_id, err));
            }
            coordinator.quarantine_table(&table_id, err.to_string());
        }

        info!(
            tables = coordinator.cache.len(),
            quarantined = coordinator.quarantine.len(),
            policies = ?coordinator.invariants.policy_names(),
            "mutation coordinator open"
        );
        Ok(coordinator)
    }

    pub fn log(&self) -> &Arc<MetadataLog<S>> {
        &self.log
    }

    pub fn invariants(&self) -> &InvariantEngine {
        &self.invariants
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Decide a proposal and, if accepted, append it.
    #[instrument(
        skip(self, proposal),
        fields(
            table_id = %proposal.table_id,
            kind = %proposal.requested_kind,
            by = %proposal.requested_by,
            expected = proposal.expected_prior_sequence,
        )
    )]
    pub fn propose(&self, proposal: MutationProposal) -> Result<ProposalOutcome, CoordinatorError> {
        let table_id = proposal.table_id.clone();
        self.ensure_not_quarantined(&table_id)?;

        self.log
            .with_table(&table_id, |writer| self.propose_locked(writer, proposal))
            .map_err(|e| self.log_failure(&table_id, e))?
    }

    fn propose_locked(
        &self,
        writer: &mut TableWriter<'_, S>,
        proposal: MutationProposal,
    ) -> Result<ProposalOutcome, CoordinatorError> {
        let current = self.current_state(writer)?;
        self.check_expected_sequence(current.as_ref(), &proposal)?;

        let next = match self.decide(current.as_ref(), &proposal)? {
            Decision::Allow(next) => next,
            Decision::Deny(reason) => {
                info!(policy = %reason.policy_name, reason = %reason.human_message, "proposal rejected");
                return Ok(ProposalOutcome::Rejected { reason });
            }
        };

        let draft = EntryDraft {
            sequence: next.current_sequence,
            mutation_kind: proposal.requested_kind,
            payload: proposal.payload,
            prior_state: current.as_ref().map(|s| s.current_state),
            resulting_state: next.current_state,
            author: proposal.requested_by,
        };

        let table_id = writer.table_id().clone();
        let entry = writer
            .append(draft)
            .map_err(|e| self.log_failure(&table_id, e))?;

        let mut machine = match current {
            Some(state) => TableStateMachine::resume(state),
            None => TableStateMachine::new(table_id.clone()),
        };
        machine
            .apply(&entry)
            .map_err(|e| self.state_failure(&table_id, e))?;
        if let Some(state) = machine.into_state() {
            self.cache.put(state);
        }

        info!(
            sequence = entry.sequence,
            state = %entry.resulting_state,
            "proposal accepted"
        );
        Ok(ProposalOutcome::Accepted { entry })
    }

    /// Decide a proposal exactly as `propose` would, without appending.
    #[instrument(skip(self, proposal), fields(table_id = %proposal.table_id, kind = %proposal.requested_kind))]
    pub fn dry_run(&self, proposal: &MutationProposal) -> Result<DryRunOutcome, CoordinatorError> {
        let table_id = &proposal.table_id;
        self.ensure_not_quarantined(table_id)?;

        self.log
            .with_table(table_id, |writer| -> Result<DryRunOutcome, CoordinatorError> {
                let current = self.current_state(writer)?;
                self.check_expected_sequence(current.as_ref(), proposal)?;
                Ok(match self.decide(current.as_ref(), proposal)? {
                    Decision::Allow(resulting_state) => DryRunOutcome::WouldAccept { resulting_state },
                    Decision::Deny(reason) => DryRunOutcome::Rejected { reason },
                })
            })
            .map_err(|e| self.log_failure(table_id, e))?
    }

    /// Every policy's verdict on a proposal against the current state.
    pub fn explain(&self, proposal: &MutationProposal) -> Result<Vec<PolicyTrace>, CoordinatorError> {
        let current = self.get_state(&proposal.table_id)?;
        let context = self.policy_context(&proposal.table_id);
        Ok(self
            .invariants
            .evaluate_all(current.as_ref(), proposal, &context))
    }

    /// Latest state of a table, `None` if it does not exist.
    pub fn get_state(&self, table_id: &TableId) -> Result<Option<TableState>, CoordinatorError> {
        self.ensure_not_quarantined(table_id)?;
        if let Some(state) = self.cache.get(table_id) {
            return Ok(Some(state));
        }

        self.log
            .with_table(table_id, |writer| self.current_state(writer))
            .map_err(|e| self.log_failure(table_id, e))?
    }

    /// Derive a table's state at `point` from the log. Never touches the cache.
    pub fn reconstruct(
        &self,
        table_id: &TableId,
        point: ReplayPoint,
    ) -> Result<Option<TableState>, CoordinatorError> {
        ReplayEngine::new(&*self.log)
            .reconstruct(table_id, point)
            .map_err(|e| self.replay_failure(table_id, e))
    }

    /// Re-derive a table's state from the log and repair the cache if it
    /// disagrees. Returns whether the cache was already correct.
    #[instrument(skip(self), fields(table_id = %table_id))]
    pub fn verify_cache(&self, table_id: &TableId) -> Result<bool, CoordinatorError> {
        self.ensure_not_quarantined(table_id)?;

        self.log
            .with_table(table_id, |_writer| -> Result<bool, CoordinatorError> {
                let derived = self.rebuild(table_id)?;
                let cached = self.cache.get(table_id);
                if cached == derived {
                    return Ok(true);
                }

                warn!(
                    cached = ?cached.as_ref().map(|s| s.current_sequence),
                    derived = ?derived.as_ref().map(|s| s.current_sequence),
                    "state cache disagreed with log; repaired"
                );
                match derived {
                    Some(state) => self.cache.put(state),
                    None => {
                        self.cache.invalidate(table_id);
                    }
                }
                Ok(false)
            })
            .map_err(|e| self.log_failure(table_id, e))?
    }

    /// Lift a quarantine once the table's log folds cleanly again.
    #[instrument(skip(self), fields(table_id = %table_id))]
    pub fn release_quarantine(
        &self,
        table_id: &TableId,
    ) -> Result<Option<TableState>, CoordinatorError> {
        self.log
            .with_table(table_id, |_writer| -> Result<Option<TableState>, CoordinatorError> {
                let state = self.rebuild(table_id)?;
                self.quarantine.remove(table_id);
                if let Some(state) = &state {
                    self.cache.put(state.clone());
                }
                info!("quarantine released");
                Ok(state)
            })
            .map_err(|e| self.log_failure(table_id, e))?
    }

    /// Quarantined tables with the reason each was quarantined.
    pub fn quarantined_tables(&self) -> Vec<(TableId, String)> {
        let mut tables: Vec<_> = self
            .quarantine
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        tables.sort();
        tables
    }

    pub fn is_quarantined(&self, table_id: &TableId) -> bool {
        self.quarantine.contains_key(table_id)
    }

    /// Drop all derived state. The log is untouched.
    pub fn shutdown(self) {
        let tables = self.cache.len();
        self.cache.clear();
        info!(tables, "mutation coordinator shut down");
    }

    /// Current state as seen under the append lock.
    ///
    /// The cache is trusted only if it ends exactly where the log ends;
    /// otherwise the state is rebuilt from the log.
    fn current_state(
        &self,
        writer: &mut TableWriter<'_, S>,
    ) -> Result<Option<TableState>, CoordinatorError> {
        let table_id = writer.table_id().clone();
        let tail = writer
            .tail()
            .map_err(|e| self.log_failure(&table_id, e))?;

        match self.cache.get(&table_id) {
            Some(state)
                if state.current_sequence == tail.sequence
                    && Some(state.current_state) == tail.state =>
            {
                return Ok(Some(state));
            }
            None if tail.sequence == 0 => return Ok(None),
            Some(state) => warn!(
                cached = state.current_sequence,
                tail = tail.sequence,
                "state cache disagrees with log; rebuilding"
            ),
            None => debug!(tail = tail.sequence, "state not cached; rebuilding"),
        }

        self.cache.invalidate(&table_id);
        let rebuilt = self.rebuild(&table_id)?;
        if let Some(state) = &rebuilt {
            self.cache.put(state.clone());
        }
        Ok(rebuilt)
    }

    fn rebuild(&self, table_id: &TableId) -> Result<Option<TableState>, CoordinatorError> {
        ReplayEngine::new(&*self.log)
            .reconstruct(table_id, ReplayPoint::Latest)
            .map_err(|e| self.replay_failure(table_id, e))
    }

    fn check_expected_sequence(
        &self,
        current: Option<&TableState>,
        proposal: &MutationProposal,
    ) -> Result<(), CoordinatorError> {
        let current_sequence = current.map(|s| s.current_sequence).unwrap_or(0);
        if proposal.expected_prior_sequence == current_sequence {
            return Ok(());
        }

        warn!(
            expected = proposal.expected_prior_sequence,
            current = current_sequence,
            "proposal is based on a stale sequence"
        );
        Err(CoordinatorError::Conflict {
            table_id: proposal.table_id.clone(),
            expected_prior: proposal.expected_prior_sequence,
            current: current_sequence,
        })
    }

    /// Policies first, then transition legality.
    ///
    /// A policy denial is a normal outcome and must be reported even for
    /// proposals that would also be illegal, such as a second engine
    /// trying to begin a mutation on a table that is already `MUTATING`.
    fn decide(
        &self,
        current: Option<&TableState>,
        proposal: &MutationProposal,
    ) -> Result<Decision, CoordinatorError> {
        let context = self.policy_context(&proposal.table_id);
        if let Verdict::Deny(reason) = self.invariants.evaluate(current, proposal, &context) {
            return Ok(Decision::Deny(reason));
        }

        state::next_state(
            current,
            &proposal.table_id,
            proposal.requested_kind,
            &proposal.payload,
            &proposal.requested_by,
        )
        .map(Decision::Allow)
        .map_err(|e| self.state_failure(&proposal.table_id, e))
    }

    fn policy_context(&self, table_id: &TableId) -> PolicyContext {
        PolicyContext::new(self.sessions.active(table_id))
    }

    fn ensure_not_quarantined(&self, table_id: &TableId) -> Result<(), CoordinatorError> {
        match self.quarantine.get(table_id) {
            Some(reason) => Err(CoordinatorError::CorruptLog {
                table_id: table_id.clone(),
                reason: reason.value().clone(),
            }),
            None => Ok(()),
        }
    }

    fn quarantine_table(&self, table_id: &TableId, reason: String) -> CoordinatorError {
        error!(table_id = %table_id, reason = %reason, "table quarantined: log does not fold");
        self.cache.invalidate(table_id);
        self.quarantine.insert(table_id.clone(), reason.clone());
        CoordinatorError::CorruptLog {
            table_id: table_id.clone(),
            reason,
        }
    }

    fn log_failure(&self, table_id: &TableId, err: LogError) -> CoordinatorError {
        match err {
            LogError::Conflict {
                table_id,
                next,
                attempted,
            } => CoordinatorError::Conflict {
                table_id,
                expected_prior: attempted.saturating_sub(1),
                current: next.saturating_sub(1),
            },
            LogError::PriorStateMismatch { .. } => CoordinatorError::IllegalTransition(err.to_string()),
            LogError::LockTimeout(_)
            | LogError::Backend(_)
            | LogError::Codec(CodecError::Encode(_)) => CoordinatorError::IoFailure(err.to_string()),
            LogError::Codec(_) | LogError::MisplacedRecord { .. } => {
                self.quarantine_table(table_id, err.to_string())
            }
        }
    }

    fn state_failure(&self, table_id: &TableId, err: StateError) -> CoordinatorError {
        match err {
            StateError::IllegalTransition(message) => CoordinatorError::IllegalTransition(message),
            StateError::CorruptLog { .. } => self.quarantine_table(table_id, err.to_string()),
        }
    }

    fn replay_failure(&self, table_id: &TableId, err: ReplayError) -> CoordinatorError {
        match err {
            ReplayError::Log(err) => self.log_failure(table_id, err),
            ReplayError::State(err) => self.state_failure(table_id, err),
            other => CoordinatorError::IllegalTransition(other.to_string()),
        }
    }
}
