#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbiter_kernel::clock::ManualClock;
use arbiter_kernel::invariants::{InvariantEngine, SessionRegistry};
use arbiter_kernel::log::payload::{Column, DataType, Environment, Schema};
use arbiter_kernel::log::{BackendError, InMemoryLogStore, LogBackend};
use arbiter_kernel::{
    EngineId, MetadataLog, MutationCoordinator, MutationKind, MutationProposal, ProposalOutcome,
    Sequence, TableId,
};

pub struct Harness<S> {
    pub clock: Arc<ManualClock>,
    pub log: Arc<MetadataLog<S>>,
    pub coordinator: MutationCoordinator<S>,
}

pub fn harness() -> Harness<InMemoryLogStore> {
    harness_with(InMemoryLogStore::new())
}

pub fn harness_with<S: LogBackend>(store: S) -> Harness<S> {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let log = Arc::new(MetadataLog::new(store).with_clock(clock.clone()));
    let coordinator = open(&log, &clock);
    Harness {
        clock,
        log,
        coordinator,
    }
}

/// A fresh coordinator over an existing log, as after a restart.
pub fn open<S: LogBackend>(
    log: &Arc<MetadataLog<S>>,
    clock: &Arc<ManualClock>,
) -> MutationCoordinator<S> {
    MutationCoordinator::open(
        Arc::clone(log),
        InvariantEngine::with_builtin_policies(),
        Arc::new(SessionRegistry::new(clock.clone())),
    )
    .expect("coordinator opens")
}

pub fn orders() -> TableId {
    TableId::new("sales.orders")
}

pub fn engine(name: &str) -> EngineId {
    EngineId::new(name)
}

pub fn orders_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Int64, false),
        Column::new("amount", DataType::Float64, true),
        Column::new("note", DataType::String, true),
    ])
}

pub fn step(
    table: &TableId,
    kind: MutationKind,
    by: &str,
    expected: Sequence,
) -> MutationProposal {
    MutationProposal::new(table.clone(), kind, engine(by), expected)
}

pub fn accept<S: LogBackend>(
    coordinator: &MutationCoordinator<S>,
    proposal: MutationProposal,
) -> arbiter_kernel::LogEntry {
    match coordinator.propose(proposal).expect("proposal decided") {
        ProposalOutcome::Accepted { entry } => entry,
        ProposalOutcome::Rejected { reason } => panic!("unexpected rejection: {reason}"),
    }
}

/// Create and activate a table. The returned sequence is 2.
pub fn create_active<S: LogBackend>(
    coordinator: &MutationCoordinator<S>,
    table: &TableId,
    environment: Environment,
) -> Sequence {
    accept(
        coordinator,
        MutationProposal::create_table(
            table.clone(),
            engine("spark"),
            orders_schema(),
            environment,
        ),
    );
    accept(coordinator, step(table, MutationKind::Activate, "spark", 1)).sequence
}

/// Backend that fails appends on demand.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryLogStore,
    fail_next: AtomicBool,
    land_then_fail: AtomicBool,
}

impl FlakyStore {
    /// Fail the next append without storing the record.
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Store the next record, then report failure anyway.
    pub fn fail_next_ack(&self) {
        self.land_then_fail.store(true, Ordering::SeqCst);
    }
}

impl LogBackend for FlakyStore {
    fn append(
        &self,
        table_id: &TableId,
        sequence: Sequence,
        record: &[u8],
    ) -> Result<(), BackendError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Io("injected write failure".into()));
        }
        self.inner.append(table_id, sequence, record)?;
        if self.land_then_fail.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Io("injected lost acknowledgement".into()));
        }
        Ok(())
    }

    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError> {
        self.inner.read_range(table_id, from, to)
    }

    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError> {
        self.inner.last_sequence(table_id)
    }

    fn tables(&self) -> Result<Vec<TableId>, BackendError> {
        self.inner.tables()
    }
}
