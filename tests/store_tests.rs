//! Execution store contract, run against every storage engine.

use std::sync::Arc;
use std::time::Duration;

use compute_node::error::StoreError;
use compute_node::models::{Execution, ExecutionShard, ExecutionState, Job, JobSpec, ResourceUsage};
use compute_node::store::{
    self, ExecutionStore, KvExecutionStore, MemoryBackend, SqliteBackend,
    UpdateExecutionStateRequest, NEW_EXECUTION_COMMENT,
};

fn execution(id: &str, job_id: &str, index: u32) -> Execution {
    Execution::new(
        id,
        ExecutionShard::new(Job::new(job_id, JobSpec::default()), index),
        ResourceUsage::cpu(1.0),
    )
}

fn advance(store: &dyn ExecutionStore, id: &str, states: &[ExecutionState]) {
    for state in states {
        store
            .update_execution_state(UpdateExecutionStateRequest::new(id, *state))
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

fn create_stamps_record_index_and_history(store: &dyn ExecutionStore) {
    let mut e = execution("e-1", "job-1", 0);
    e.version = 42;
    e.latest_comment = "ignored".to_string();
    store.create_execution(e).unwrap();

    let stored = store.get_execution("e-1").unwrap();
    assert_eq!(stored.state, ExecutionState::Created);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.create_time, stored.update_time);
    assert_eq!(stored.latest_comment, NEW_EXECUTION_COMMENT);

    let shard = store.get_executions("job-1:0").unwrap();
    assert_eq!(shard.len(), 1);
    assert_eq!(shard[0].id, "e-1");

    let history = store.get_execution_history("e-1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].previous_state, ExecutionState::Undefined);
    assert_eq!(history[0].new_state, ExecutionState::Created);
    assert_eq!(history[0].new_version, 1);
}

fn create_rejects_duplicates_and_bad_initial_state(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    let err = store.create_execution(execution("e-1", "job-1", 0)).unwrap_err();
    assert!(matches!(err, StoreError::ExecutionAlreadyExists(ref id) if id == "e-1"));

    let mut running = execution("e-2", "job-1", 0);
    running.state = ExecutionState::Running;
    let err = store.create_execution(running).unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidNewExecution { actual: ExecutionState::Running, .. }
    ));
    assert!(matches!(
        store.get_execution("e-2"),
        Err(StoreError::ExecutionNotFound(_))
    ));
    assert_eq!(store.get_executions("job-1:0").unwrap().len(), 1);
}

fn missing_records_are_typed_errors(store: &dyn ExecutionStore) {
    assert!(matches!(
        store.get_execution("nope"),
        Err(StoreError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        store.get_executions("job-x:0"),
        Err(StoreError::ExecutionsNotFoundForShard(_))
    ));
    assert!(matches!(
        store.get_execution_history("nope"),
        Err(StoreError::ExecutionHistoryNotFound(_))
    ));
    assert!(matches!(
        store.update_execution_state(UpdateExecutionStateRequest::new(
            "nope",
            ExecutionState::BidAccepted
        )),
        Err(StoreError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        store.delete_execution("nope"),
        Err(StoreError::ExecutionNotFound(_))
    ));
}

fn transitions_bump_version_and_append_history(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    let created = store.get_execution("e-1").unwrap();

    store
        .update_execution_state(
            UpdateExecutionStateRequest::new("e-1", ExecutionState::BidAccepted)
                .expect_state(ExecutionState::Created)
                .expect_version(1)
                .with_comment("accepted"),
        )
        .unwrap();
    store
        .update_execution_state(
            UpdateExecutionStateRequest::new("e-1", ExecutionState::Running)
                .expect_state(ExecutionState::BidAccepted),
        )
        .unwrap();

    let stored = store.get_execution("e-1").unwrap();
    assert_eq!(stored.state, ExecutionState::Running);
    assert_eq!(stored.version, 3);
    assert_eq!(stored.create_time, created.create_time);
    assert!(stored.update_time >= created.update_time);
    assert_eq!(stored.latest_comment, "");

    let history = store.get_execution_history("e-1").unwrap();
    let versions: Vec<u64> = history.iter().map(|h| h.new_version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(history[1].comment, "accepted");
    assert_eq!(history[2].previous_state, ExecutionState::BidAccepted);
    assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
}

fn rejected_checks_leave_no_trace(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();

    let err = store
        .update_execution_state(
            UpdateExecutionStateRequest::new("e-1", ExecutionState::Running)
                .expect_state(ExecutionState::BidAccepted),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidExecutionState {
            actual: ExecutionState::Created,
            expected: ExecutionState::BidAccepted,
            ..
        }
    ));

    let err = store
        .update_execution_state(
            UpdateExecutionStateRequest::new("e-1", ExecutionState::BidAccepted).expect_version(7),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidExecutionVersion { actual: 1, expected: 7, .. }
    ));

    let stored = store.get_execution("e-1").unwrap();
    assert_eq!(stored.state, ExecutionState::Created);
    assert_eq!(stored.version, 1);
    assert_eq!(store.get_execution_history("e-1").unwrap().len(), 1);
}

fn terminal_states_are_final(store: &dyn ExecutionStore) {
    for (i, terminal) in [
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ]
    .into_iter()
    .enumerate()
    {
        let id = format!("e-{}", i);
        store.create_execution(execution(&id, "job-1", 0)).unwrap();
        advance(store, &id, &[terminal]);

        for next in ExecutionState::ALL {
            let err = store
                .update_execution_state(UpdateExecutionStateRequest::new(&id, next))
                .unwrap_err();
            assert!(
                matches!(err, StoreError::ExecutionAlreadyTerminal { actual, .. } if actual == terminal),
                "{} -> {} should be rejected",
                terminal,
                next
            );
        }
        assert_eq!(store.get_execution(&id).unwrap().version, 2);
        assert_eq!(store.get_execution_history(&id).unwrap().len(), 2);
    }
}

fn shard_listing_is_ordered_by_update_time(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-a", "job-1", 0)).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    store.create_execution(execution("e-b", "job-1", 0)).unwrap();
    store.create_execution(execution("e-c", "job-1", 1)).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    advance(store, "e-a", &[ExecutionState::BidAccepted]);

    let ids: Vec<String> = store
        .get_executions("job-1:0")
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["e-b", "e-a"]);
    assert_eq!(store.get_executions("job-1:1").unwrap().len(), 1);
}

fn live_executions_are_the_executing_ones(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-created", "job-1", 0)).unwrap();
    store.create_execution(execution("e-running", "job-1", 1)).unwrap();
    store.create_execution(execution("e-waiting", "job-1", 2)).unwrap();
    store.create_execution(execution("e-done", "job-1", 3)).unwrap();
    advance(store, "e-running", &[ExecutionState::BidAccepted, ExecutionState::Running]);
    std::thread::sleep(Duration::from_millis(5));
    advance(
        store,
        "e-waiting",
        &[
            ExecutionState::BidAccepted,
            ExecutionState::Running,
            ExecutionState::WaitingVerification,
        ],
    );
    advance(store, "e-done", &[ExecutionState::Completed]);

    let ids: Vec<String> = store
        .get_live_executions()
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["e-running", "e-waiting"]);

    let ids: Vec<String> = store
        .get_active_executions()
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["e-created", "e-running", "e-waiting"]);
}

fn delete_removes_record_index_and_history(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    store.create_execution(execution("e-2", "job-1", 0)).unwrap();
    store.create_execution(execution("e-3", "job-1", 1)).unwrap();
    advance(store, "e-1", &[ExecutionState::BidAccepted]);

    store.delete_execution("e-1").unwrap();
    assert!(matches!(
        store.get_execution("e-1"),
        Err(StoreError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        store.get_execution_history("e-1"),
        Err(StoreError::ExecutionHistoryNotFound(_))
    ));
    let remaining: Vec<String> = store
        .get_executions("job-1:0")
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(remaining, vec!["e-2"]);

    store.delete_execution("e-3").unwrap();
    assert!(matches!(
        store.get_executions("job-1:1"),
        Err(StoreError::ExecutionsNotFoundForShard(_))
    ));
    assert_eq!(store.get_execution_history("e-2").unwrap().len(), 1);
}

fn counts_follow_transitions(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    store.create_execution(execution("e-2", "job-1", 1)).unwrap();
    store.create_execution(execution("e-3", "job-1", 2)).unwrap();
    assert_eq!(store.get_execution_count(ExecutionState::Created).unwrap(), 3);

    advance(store, "e-1", &[ExecutionState::BidAccepted, ExecutionState::Running]);
    advance(store, "e-2", &[ExecutionState::Cancelled]);
    assert_eq!(store.get_execution_count(ExecutionState::Created).unwrap(), 1);
    assert_eq!(store.get_execution_count(ExecutionState::BidAccepted).unwrap(), 0);
    assert_eq!(store.get_execution_count(ExecutionState::Running).unwrap(), 1);
    assert_eq!(store.get_execution_count(ExecutionState::Cancelled).unwrap(), 1);

    // rejected transitions do not move the counter
    let _ = store.update_execution_state(UpdateExecutionStateRequest::new(
        "e-2",
        ExecutionState::Running,
    ));
    assert_eq!(store.get_execution_count(ExecutionState::Running).unwrap(), 1);

    store.delete_execution("e-1").unwrap();
    assert_eq!(store.get_execution_count(ExecutionState::Running).unwrap(), 0);
}

fn returned_copies_are_detached(store: &dyn ExecutionStore) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    let mut copy = store.get_execution("e-1").unwrap();
    copy.state = ExecutionState::Completed;
    copy.version = 99;

    let stored = store.get_execution("e-1").unwrap();
    assert_eq!(stored.state, ExecutionState::Created);
    assert_eq!(stored.version, 1);
}

fn concurrent_updates_serialize_per_execution(store: Arc<dyn ExecutionStore>) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();

    // every writer races for the same expected version; exactly one may win
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                store
                    .update_execution_state(
                        UpdateExecutionStateRequest::new("e-1", ExecutionState::BidAccepted)
                            .expect_version(1),
                    )
                    .is_ok()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(store.get_execution("e-1").unwrap().version, 2);
    assert_eq!(store.get_execution_history("e-1").unwrap().len(), 2);
}

fn concurrent_transitions_keep_counts_consistent(store: Arc<dyn ExecutionStore>) {
    store.create_execution(execution("e-1", "job-1", 0)).unwrap();
    let states = [
        ExecutionState::BidAccepted,
        ExecutionState::Running,
        ExecutionState::WaitingVerification,
        ExecutionState::ResultAccepted,
        ExecutionState::Publishing,
    ];

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let state = states[(worker + i) % states.len()];
                    store
                        .update_execution_state(UpdateExecutionStateRequest::new("e-1", state))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let current = store.get_execution("e-1").unwrap().state;
    let total: u64 = ExecutionState::ALL
        .into_iter()
        .map(|state| store.get_execution_count(state).unwrap())
        .sum();
    assert_eq!(total, 1);
    assert_eq!(store.get_execution_count(current).unwrap(), 1);
}

fn separators_in_ids_do_not_leak_across_keys(store: &dyn ExecutionStore) {
    store.create_execution(execution("a", "job-1", 0)).unwrap();
    store.create_execution(execution("a/b", "job-1", 1)).unwrap();
    store.create_execution(execution("e-1", "j", 0)).unwrap();
    store.create_execution(execution("e-2", "j:0/x", 0)).unwrap();

    let history = store.get_execution_history("a").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_id, "a");

    let shard: Vec<String> = store
        .get_executions("j:0")
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(shard, vec!["e-1"]);
    assert_eq!(store.get_executions("j:0/x:0").unwrap()[0].id, "e-2");

    store.delete_execution("a").unwrap();
    assert_eq!(store.get_execution_history("a/b").unwrap().len(), 1);
    assert_eq!(store.get_execution("a/b").unwrap().id, "a/b");
}

macro_rules! store_suite {
    ($module:ident, $open:expr) => {
        mod $module {
            use super::*;

            #[test]
            fn create_stamps_record_index_and_history() {
                let (store, _dir) = $open;
                super::create_stamps_record_index_and_history(store.as_ref());
            }

            #[test]
            fn create_rejects_duplicates_and_bad_initial_state() {
                let (store, _dir) = $open;
                super::create_rejects_duplicates_and_bad_initial_state(store.as_ref());
            }

            #[test]
            fn missing_records_are_typed_errors() {
                let (store, _dir) = $open;
                super::missing_records_are_typed_errors(store.as_ref());
            }

            #[test]
            fn transitions_bump_version_and_append_history() {
                let (store, _dir) = $open;
                super::transitions_bump_version_and_append_history(store.as_ref());
            }

            #[test]
            fn rejected_checks_leave_no_trace() {
                let (store, _dir) = $open;
                super::rejected_checks_leave_no_trace(store.as_ref());
            }

            #[test]
            fn terminal_states_are_final() {
                let (store, _dir) = $open;
                super::terminal_states_are_final(store.as_ref());
            }

            #[test]
            fn shard_listing_is_ordered_by_update_time() {
                let (store, _dir) = $open;
                super::shard_listing_is_ordered_by_update_time(store.as_ref());
            }

            #[test]
            fn live_executions_are_the_executing_ones() {
                let (store, _dir) = $open;
                super::live_executions_are_the_executing_ones(store.as_ref());
            }

            #[test]
            fn delete_removes_record_index_and_history() {
                let (store, _dir) = $open;
                super::delete_removes_record_index_and_history(store.as_ref());
            }

            #[test]
            fn counts_follow_transitions() {
                let (store, _dir) = $open;
                super::counts_follow_transitions(store.as_ref());
            }

            #[test]
            fn returned_copies_are_detached() {
                let (store, _dir) = $open;
                super::returned_copies_are_detached(store.as_ref());
            }

            #[test]
            fn concurrent_updates_serialize_per_execution() {
                let (store, _dir) = $open;
                super::concurrent_updates_serialize_per_execution(store);
            }

            #[test]
            fn concurrent_transitions_keep_counts_consistent() {
                let (store, _dir) = $open;
                super::concurrent_transitions_keep_counts_consistent(store);
            }

            #[test]
            fn separators_in_ids_do_not_leak_across_keys() {
                let (store, _dir) = $open;
                super::separators_in_ids_do_not_leak_across_keys(store.as_ref());
            }
        }
    };
}

fn open_memory() -> (Arc<dyn ExecutionStore>, Option<tempfile::TempDir>) {
    let store: Arc<dyn ExecutionStore> =
        Arc::new(KvExecutionStore::open(MemoryBackend::new()).unwrap());
    (store, None)
}

fn open_sqlite() -> (Arc<dyn ExecutionStore>, Option<tempfile::TempDir>) {
    let dir = tempfile::tempdir().unwrap();
    let store = store::open_sqlite(&dir.path().join("executions.db")).unwrap();
    (store, Some(dir))
}

store_suite!(memory, open_memory());
store_suite!(sqlite, open_sqlite());

// ---------------------------------------------------------------------------
// Sqlite durability
// ---------------------------------------------------------------------------

#[test]
fn sqlite_store_survives_reopen_with_counts_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("executions.db");

    {
        let store = KvExecutionStore::open(SqliteBackend::open(&path).unwrap()).unwrap();
        store.create_execution(execution("e-1", "job-1", 0)).unwrap();
        store.create_execution(execution("e-2", "job-1", 1)).unwrap();
        advance(&store, "e-1", &[ExecutionState::BidAccepted, ExecutionState::Running]);
    }

    let store = store::open_sqlite(&path).unwrap();
    let e1 = store.get_execution("e-1").unwrap();
    assert_eq!(e1.state, ExecutionState::Running);
    assert_eq!(e1.version, 3);
    assert_eq!(store.get_execution_history("e-1").unwrap().len(), 3);
    assert_eq!(store.get_executions("job-1:1").unwrap()[0].id, "e-2");
    assert_eq!(store.get_execution_count(ExecutionState::Running).unwrap(), 1);
    assert_eq!(store.get_execution_count(ExecutionState::Created).unwrap(), 1);
    assert_eq!(store.get_live_executions().unwrap().len(), 1);
}

#[test]
fn open_follows_store_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");

    let sqlite = store::open(&compute_node::config::StoreConfig::Sqlite { path: path.clone() })
        .unwrap();
    sqlite.create_execution(execution("e-1", "job-1", 0)).unwrap();
    assert!(path.exists());

    let memory = store::open(&compute_node::config::StoreConfig::Memory).unwrap();
    assert!(matches!(
        memory.get_execution("e-1"),
        Err(StoreError::ExecutionNotFound(_))
    ));
}
