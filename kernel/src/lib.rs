// Arbiter Kernel
//
// Core correctness primitives for the table mutation control plane:
// the metadata log, the table state machine, the invariant engine,
// the mutation coordinator, and deterministic replay.

pub mod audit;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod invariants;
pub mod log;
pub mod proposal;
pub mod replay;
pub mod state;

pub use config::ArbiterConfig;
pub use coordinator::{CoordinatorError, DryRunOutcome, MutationCoordinator, ProposalOutcome};
pub use log::{EngineId, LogEntry, MetadataLog, MutationKind, Sequence, TableId, Timestamp};
pub use proposal::MutationProposal;
pub use replay::{ReplayEngine, ReplayPoint};
pub use state::{LifecycleState, TableState};
