//! Property tests: after draining the outbox, the remote holds exactly the
//! local state of every synced record, whether or not groups are collapsed
//! and whether or not batches are interrupted and replayed.

use proptest::prelude::*;
use std::sync::Arc;
use tallydb_core::Row;
use tallydb_sync_engine::{SyncConfig, UploadEngine, UploadOutcome};
use tallydb_testkit::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn local_rows(db: &TestDatabase) -> Vec<Row> {
    db.query(
        &format!("SELECT * FROM {GENERATED_TABLE} ORDER BY id"),
        &[],
    )
    .unwrap()
}

fn remote_rows(remote: &MemoryRemote) -> Vec<Row> {
    (0..5)
        .filter_map(|n| remote.record(GENERATED_TABLE, &format!("t{n}")))
        .collect()
}

fn run_script(db: &TestDatabase, script: &[Vec<LocalWrite>]) {
    for txn_writes in script {
        db.write(|txn| {
            for write in txn_writes {
                write.apply(txn)?;
            }
            Ok(())
        })
        .unwrap();
    }
}

async fn drain(engine: &UploadEngine) {
    loop {
        match engine.upload_once().await {
            Ok(UploadOutcome::Idle) => return,
            Ok(UploadOutcome::Uploaded { .. }) => {}
            Ok(other) => panic!("unexpected outcome {other:?}"),
            // Injected transient faults; replay.
            Err(e) => assert!(e.is_retryable(), "unexpected error {e}"),
        }
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn remote_converges_to_local(
        script in write_script_strategy(6, 5),
        collapse in any::<bool>(),
    ) {
        let db = TestDatabase::memory();
        run_script(&db, &script);

        let remote = Arc::new(MemoryRemote::new());
        let engine = UploadEngine::new(
            db.handle(),
            remote.clone(),
            Arc::new(StaticCredentials::new(test_credential("token"))),
            fast_sync_config().with_collapse_operations(collapse),
        );
        runtime().block_on(drain(&engine));

        prop_assert_eq!(db.pending_count().unwrap(), 0);
        prop_assert_eq!(remote_rows(&remote), local_rows(&db));
    }

    #[test]
    fn interrupted_batches_replay_to_the_same_state(
        script in write_script_strategy(4, 6),
        fault_every in 2usize..5,
    ) {
        let db = TestDatabase::memory();
        run_script(&db, &script);

        let remote = Arc::new(MemoryRemote::new());
        let engine = UploadEngine::new(
            db.handle(),
            remote.clone(),
            Arc::new(StaticCredentials::new(test_credential("token"))),
            SyncConfig::new().with_collapse_operations(false),
        );
        runtime().block_on(async {
            for round in 0..64 {
                if round % fault_every == 0 {
                    remote.fail_next(Fault::Transport);
                }
                match engine.upload_once().await {
                    Ok(UploadOutcome::Idle) => break,
                    Ok(_) | Err(_) => {}
                }
            }
            drain(&engine).await;
        });

        prop_assert_eq!(remote_rows(&remote), local_rows(&db));
    }
}
