mod common;

use arbiter_kernel::invariants::builtin::{
    NO_DESTRUCTIVE_SCHEMA_CHANGE, NO_REWRITE_DURING_INGESTION, SINGLE_WRITER_EXCLUSION,
};
use arbiter_kernel::log::codec;
use arbiter_kernel::log::payload::{
    DataPointer, DataType, Environment, Payload, SchemaChange, SchemaDelta, WriteOperation,
};
use arbiter_kernel::log::LogBackend;
use arbiter_kernel::replay::ReplayError;
use arbiter_kernel::state::derive_state;
use arbiter_kernel::{
    CoordinatorError, LifecycleState, MutationKind, MutationProposal, ProposalOutcome,
    ReplayEngine, ReplayPoint, TableId,
};

use common::*;

fn denied_by(outcome: ProposalOutcome) -> String {
    match outcome {
        ProposalOutcome::Rejected { reason } => reason.policy_name,
        ProposalOutcome::Accepted { entry } => panic!("unexpected acceptance of {entry:?}"),
    }
}

#[test]
fn second_engine_cannot_begin_while_first_is_mutating() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    let begin = accept(
        &h.coordinator,
        step(&table, MutationKind::BeginMutation, "engine-a", seq),
    );
    assert_eq!(begin.resulting_state, LifecycleState::Mutating);

    let state = h.coordinator.get_state(&table).unwrap().unwrap();
    assert_eq!(state.current_state, LifecycleState::Mutating);
    assert_eq!(state.active_writer_engine, Some(engine("engine-a")));

    let outcome = h
        .coordinator
        .propose(step(&table, MutationKind::BeginMutation, "engine-b", 3))
        .unwrap();
    assert_eq!(denied_by(outcome), SINGLE_WRITER_EXCLUSION);

    // Engine B cannot finish A's mutation either.
    let outcome = h
        .coordinator
        .propose(step(&table, MutationKind::CommitMutation, "engine-b", 3))
        .unwrap();
    assert_eq!(denied_by(outcome), SINGLE_WRITER_EXCLUSION);

    accept(
        &h.coordinator,
        step(&table, MutationKind::CommitMutation, "engine-a", 3),
    );
    let state = h.coordinator.get_state(&table).unwrap().unwrap();
    assert_eq!(state.current_state, LifecycleState::Active);
    assert!(state.active_writer_engine.is_none());
}

#[test]
fn destructive_schema_change_needs_override_in_production() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    let drop_note = MutationProposal::begin_schema_change(
        table.clone(),
        engine("spark"),
        SchemaDelta::new(vec![SchemaChange::DropColumn {
            name: "note".into(),
        }]),
        seq,
    );

    let outcome = h.coordinator.propose(drop_note.clone()).unwrap();
    assert_eq!(denied_by(outcome), NO_DESTRUCTIVE_SCHEMA_CHANGE);
    assert_eq!(h.log.current_sequence(&table).unwrap(), 2);

    accept(&h.coordinator, drop_note.with_override());
    accept(
        &h.coordinator,
        step(&table, MutationKind::CommitMutation, "spark", 3),
    );

    let state = h.coordinator.get_state(&table).unwrap().unwrap();
    assert_eq!(state.schema_version, 2);
    assert!(state.schema.column("note").is_none());
}

#[test]
fn destructive_change_outside_production_needs_no_override() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Development);

    let drop_note = MutationProposal::begin_schema_change(
        table.clone(),
        engine("spark"),
        SchemaDelta::new(vec![SchemaChange::DropColumn {
            name: "note".into(),
        }]),
        seq,
    );
    assert!(h.coordinator.propose(drop_note).unwrap().is_accepted());
}

#[test]
fn rename_does_not_hide_a_destructive_change() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    let narrow = MutationProposal::begin_schema_change(
        table.clone(),
        engine("spark"),
        SchemaDelta::new(vec![
            SchemaChange::RenameColumn {
                from: "amount".into(),
                to: "amt".into(),
            },
            SchemaChange::AlterType {
                name: "amt".into(),
                data_type: DataType::Int32,
            },
        ]),
        seq,
    );
    let outcome = h.coordinator.propose(narrow).unwrap();
    assert_eq!(denied_by(outcome), NO_DESTRUCTIVE_SCHEMA_CHANGE);

    let require = MutationProposal::begin_schema_change(
        table.clone(),
        engine("spark"),
        SchemaDelta::new(vec![
            SchemaChange::RenameColumn {
                from: "note".into(),
                to: "n2".into(),
            },
            SchemaChange::SetNullability {
                name: "n2".into(),
                nullable: false,
            },
        ]),
        seq,
    );
    let outcome = h.coordinator.propose(require).unwrap();
    assert_eq!(denied_by(outcome), NO_DESTRUCTIVE_SCHEMA_CHANGE);

    assert_eq!(h.log.current_sequence(&table).unwrap(), seq);
    let state = h.coordinator.get_state(&table).unwrap().unwrap();
    assert_eq!(state.schema, orders_schema());
}

#[test]
fn stale_expected_sequence_is_a_conflict_and_leaves_log_unchanged() {
    let h = harness();
    let table = orders();
    let mut seq = create_active(&h.coordinator, &table, Environment::Staging);
    for kind in [
        MutationKind::BeginMutation,
        MutationKind::CommitMutation,
        MutationKind::BeginMutation,
        MutationKind::CommitMutation,
    ] {
        seq = accept(&h.coordinator, step(&table, kind, "spark", seq)).sequence;
    }
    assert_eq!(seq, 6);
    let before = h.log.read(&table, ..).unwrap();

    let err = h
        .coordinator
        .propose(step(&table, MutationKind::BeginMutation, "spark", 5))
        .unwrap_err();

    assert_eq!(
        err,
        CoordinatorError::Conflict {
            table_id: table.clone(),
            expected_prior: 5,
            current: 6,
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(h.log.read(&table, ..).unwrap(), before);
}

#[test]
fn illegal_transition_is_reported_after_policies() {
    let h = harness();
    let table = orders();
    create_active(&h.coordinator, &table, Environment::Staging);

    let err = h
        .coordinator
        .propose(step(&table, MutationKind::RollbackComplete, "spark", 2))
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::IllegalTransition(_)));
}

#[test]
fn corrupt_prior_state_quarantines_table() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);
    accept(
        &h.coordinator,
        step(&table, MutationKind::BeginMutation, "spark", seq),
    );

    // Entry 3 claims to start from CREATED although entry 2 left the table ACTIVE.
    let original = h.log.store().read_range(&table, 3, 3).unwrap().remove(0).1;
    let mut entry = codec::decode_entry(&original).unwrap();
    entry.prior_state = Some(LifecycleState::Created);
    assert!(h
        .log
        .store()
        .tamper(&table, 3, codec::encode_entry(&entry).unwrap()));

    let err = ReplayEngine::new(&*h.log)
        .reconstruct(&table, ReplayPoint::Latest)
        .unwrap_err();
    assert!(err.is_corrupt());
    assert!(matches!(err, ReplayError::State(_)));

    // The running coordinator notices on verification; a restarted one at open.
    let err = h.coordinator.verify_cache(&table).unwrap_err();
    assert!(matches!(err, CoordinatorError::CorruptLog { .. }));
    assert!(h.coordinator.is_quarantined(&table));

    let restarted = open(&h.log, &h.clock);
    assert_eq!(restarted.quarantined_tables().len(), 1);
    assert_eq!(restarted.quarantined_tables()[0].0, table);

    let err = restarted
        .propose(step(&table, MutationKind::CommitMutation, "spark", 3))
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CorruptLog { .. }));
    assert!(restarted.get_state(&table).is_err());

    // Quarantine holds until the log folds again.
    assert!(restarted.release_quarantine(&table).is_err());
    assert!(restarted.is_quarantined(&table));

    assert!(h.log.store().tamper(&table, 3, original));
    let state = restarted.release_quarantine(&table).unwrap().unwrap();
    assert_eq!(state.current_state, LifecycleState::Mutating);
    assert!(!restarted.is_quarantined(&table));
    accept(
        &restarted,
        step(&table, MutationKind::CommitMutation, "spark", 3),
    );
}

#[test]
fn full_rewrite_waits_for_ingestion_to_end() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    let session = h.coordinator.sessions().register(&table, &engine("flink"));
    let rewrite = MutationProposal::begin_write(
        table.clone(),
        engine("spark"),
        DataPointer {
            location: "s3://lake/sales/orders/rewrite-0001".into(),
            operation: WriteOperation::FullRewrite,
        },
        seq,
    );

    let outcome = h.coordinator.propose(rewrite.clone()).unwrap();
    assert_eq!(denied_by(outcome), NO_REWRITE_DURING_INGESTION);

    assert!(h.coordinator.sessions().end(&table, session));
    assert!(h.coordinator.propose(rewrite).unwrap().is_accepted());
}

#[test]
fn full_rewrite_cannot_ride_on_a_commit() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    h.coordinator.sessions().register(&table, &engine("flink"));
    let begin = accept(
        &h.coordinator,
        step(&table, MutationKind::BeginMutation, "spark", seq),
    );

    let rewrite = Payload::DataPointer(DataPointer {
        location: "s3://lake/sales/orders/rewrite-0002".into(),
        operation: WriteOperation::FullRewrite,
    });
    let commit = step(&table, MutationKind::CommitMutation, "spark", begin.sequence)
        .with_payload(rewrite.clone());
    let outcome = h.coordinator.propose(commit).unwrap();
    assert_eq!(denied_by(outcome), NO_REWRITE_DURING_INGESTION);
    assert_eq!(h.log.current_sequence(&table).unwrap(), begin.sequence);

    // Without ingestion the pointer is still refused outside begin_mutation.
    let quiet = TableId::new("sales.orders_quiet");
    let seq = create_active(&h.coordinator, &quiet, Environment::Production);
    let begin = accept(
        &h.coordinator,
        step(&quiet, MutationKind::BeginMutation, "spark", seq),
    );
    let err = h
        .coordinator
        .propose(
            step(&quiet, MutationKind::CommitMutation, "spark", begin.sequence)
                .with_payload(rewrite),
        )
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::IllegalTransition(_)));
    assert_eq!(h.log.current_sequence(&quiet).unwrap(), begin.sequence);
}

#[test]
fn accepted_state_matches_replayed_state() {
    let h = harness();
    let table = orders();
    let mut seq = create_active(&h.coordinator, &table, Environment::Production);

    for (kind, by) in [
        (MutationKind::BeginMutation, "spark"),
        (MutationKind::AbortMutation, "spark"),
        (MutationKind::RollbackComplete, "spark"),
        (MutationKind::BeginMutation, "trino"),
    ] {
        h.clock.advance(10);
        seq = accept(&h.coordinator, step(&table, kind, by, seq)).sequence;

        let reported = h.coordinator.get_state(&table).unwrap();
        let replayed = derive_state(&h.log.read(&table, ..).unwrap()).unwrap();
        assert_eq!(reported, replayed);
    }
}

#[test]
fn reconstruct_depends_only_on_the_prefix() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Production);

    let at_two = h
        .coordinator
        .reconstruct(&table, ReplayPoint::Sequence(2))
        .unwrap();

    accept(
        &h.coordinator,
        step(&table, MutationKind::BeginMutation, "spark", seq),
    );
    accept(
        &h.coordinator,
        step(&table, MutationKind::CommitMutation, "spark", 3),
    );

    assert_eq!(
        h.coordinator
            .reconstruct(&table, ReplayPoint::Sequence(2))
            .unwrap(),
        at_two
    );
}

#[test]
fn checkpoint_replay_matches_full_replay() {
    let h = harness();
    let table = orders();
    let mut seq = create_active(&h.coordinator, &table, Environment::Production);
    let replay = ReplayEngine::new(&*h.log);
    let checkpoint = replay
        .checkpoint(&table, ReplayPoint::Latest)
        .unwrap()
        .unwrap();

    for kind in [MutationKind::BeginMutation, MutationKind::CommitMutation] {
        seq = accept(&h.coordinator, step(&table, kind, "spark", seq)).sequence;
    }

    let resumed = replay
        .reconstruct_from(&checkpoint, ReplayPoint::Latest)
        .unwrap();
    let full = replay
        .reconstruct(&table, ReplayPoint::Latest)
        .unwrap()
        .unwrap();
    assert_eq!(resumed, full);
    assert_eq!(resumed.current_sequence, 4);
}

#[test]
fn failed_write_is_retryable() {
    let h = harness_with(FlakyStore::default());
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Staging);
    let begin = step(&table, MutationKind::BeginMutation, "spark", seq);

    h.log.store().fail_next_append();
    let err = h.coordinator.propose(begin.clone()).unwrap_err();
    assert!(matches!(err, CoordinatorError::IoFailure(_)));
    assert!(err.is_retryable());
    assert_eq!(h.log.current_sequence(&table).unwrap(), 2);

    let entry = accept(&h.coordinator, begin);
    assert_eq!(entry.sequence, 3);
}

#[test]
fn retry_after_lost_acknowledgement_degrades_to_conflict() {
    let h = harness_with(FlakyStore::default());
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Staging);
    let begin = step(&table, MutationKind::BeginMutation, "spark", seq);

    h.log.store().fail_next_ack();
    let err = h.coordinator.propose(begin.clone()).unwrap_err();
    assert!(err.is_retryable());

    let err = h.coordinator.propose(begin).unwrap_err();
    assert_eq!(
        err,
        CoordinatorError::Conflict {
            table_id: table.clone(),
            expected_prior: 2,
            current: 3,
        }
    );

    let entries = h.log.read(&table, ..).unwrap();
    assert_eq!(entries.len(), 3);
    let state = h.coordinator.get_state(&table).unwrap().unwrap();
    assert_eq!(state.current_state, LifecycleState::Mutating);
    assert_eq!(state.current_sequence, 3);
}

#[test]
fn timestamps_never_go_backwards() {
    let h = harness();
    let table = orders();
    let seq = create_active(&h.coordinator, &table, Environment::Staging);

    h.clock.set(0);
    let entry = accept(
        &h.coordinator,
        step(&table, MutationKind::BeginMutation, "spark", seq),
    );

    let entries = h.log.read(&table, ..).unwrap();
    assert_eq!(entry.timestamp, entries[1].timestamp);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}
