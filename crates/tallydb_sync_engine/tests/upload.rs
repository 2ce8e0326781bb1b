//! Upload engine behavior against the in-memory remote.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tallydb_core::OUTBOX_TABLE;
use tallydb_sync_engine::{
    apply_op, ErrorClass, RetryConfig, SyncConfig, SyncError, UploadEngine, UploadOutcome,
    UploadState,
};
use tallydb_testkit::prelude::*;

fn engine_with(
    db: &TestDatabase,
    remote: &Arc<MemoryRemote>,
    provider: Arc<SwitchableCredentials>,
    config: SyncConfig,
) -> UploadEngine {
    UploadEngine::new(db.handle(), remote.clone(), provider, config)
}

fn signed_in(token: &str) -> Arc<SwitchableCredentials> {
    Arc::new(SwitchableCredentials::signed_in(test_credential(token)))
}

fn put_transaction(db: &TestDatabase, id: &str, amount_cents: i64) {
    db.write(|txn| txn.put("transactions", id, transaction_row(amount_cents)))
        .unwrap();
}

#[test]
fn failed_write_leaves_no_row_and_no_entry() {
    let db = TestDatabase::memory();
    let result: Result<(), _> = db.write(|txn| {
        txn.put("transactions", "t1", transaction_row(100))?;
        txn.put("no_such_table", "x", row(json!({})))
    });
    assert!(result.is_err());
    assert!(db.get("transactions", "t1").unwrap().is_none());
    assert_eq!(db.pending_count().unwrap(), 0);

    put_transaction(&db, "t1", 100);
    assert!(db.get("transactions", "t1").unwrap().is_some());
    assert_eq!(db.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn queued_write_uploads_once_a_credential_arrives() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let provider = Arc::new(SwitchableCredentials::new());
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());

    db.write(|txn| txn.put("transactions", "1", row(json!({"amount_cents": 500}))))
        .unwrap();

    assert_eq!(engine.upload_once().await.unwrap(), UploadOutcome::Offline);
    assert_eq!(db.pending_count().unwrap(), 1);
    assert_eq!(remote.attempts(), 0);

    provider.set(Some(test_credential("token")));
    let outcome = engine.upload_once().await.unwrap();
    assert!(matches!(
        outcome,
        UploadOutcome::Uploaded { operations: 1, .. }
    ));

    let calls = remote.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        RemoteCall::Upsert { table, id, data } => {
            assert_eq!(table, "transactions");
            assert_eq!(id, "1");
            assert_eq!(data["amount_cents"], json!(500));
        }
        other => panic!("expected an upsert, got {other:?}"),
    }
    assert_eq!(db.pending_count().unwrap(), 0);
    assert_eq!(engine.upload_once().await.unwrap(), UploadOutcome::Idle);
}

#[tokio::test]
async fn offline_writes_produce_exactly_their_effects_in_order() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let provider = Arc::new(SwitchableCredentials::new());
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());
    engine.start();

    for n in 0..5 {
        put_transaction(&db, &format!("t{n}"), n * 100);
    }
    db.write(|txn| {
        txn.patch("transactions", "t0", row(json!({"merchant": "Bakery"})))
            .map(|_| ())
    })
    .unwrap();

    let mut status = engine.status();
    wait_for_status("the engine to park", &mut status, |s| {
        s.upload == UploadState::WaitingForCredentials
    })
    .await;
    assert_eq!(remote.attempts(), 0);
    assert_eq!(db.pending_count().unwrap(), 6);

    provider.set(Some(test_credential("token")));
    engine.credentials_changed();
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;

    let calls = remote.calls();
    let summary: Vec<(&str, &str)> = calls.iter().map(|c| (c.verb(), c.id())).collect();
    assert_eq!(
        summary,
        vec![
            ("upsert", "t0"),
            ("upsert", "t1"),
            ("upsert", "t2"),
            ("upsert", "t3"),
            ("upsert", "t4"),
            ("patch", "t0"),
        ]
    );
    assert_eq!(remote.record("transactions", "t0").unwrap()["merchant"], json!("Bakery"));
    engine.stop().await;
}

#[tokio::test]
async fn modification_is_never_applied_before_creation() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    put_transaction(&db, "t1", 100);
    db.write(|txn| {
        txn.patch("transactions", "t1", row(json!({"amount_cents": 250})))
            .map(|_| ())
    })
    .unwrap();

    remote.fail_next(Fault::Transport);
    let err = engine.upload_once().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Retryable);
    assert_eq!(db.pending_count().unwrap(), 2);

    while engine.upload_once().await.unwrap() != UploadOutcome::Idle {}

    let verbs: Vec<&str> = remote.calls().iter().map(RemoteCall::verb).collect();
    assert_eq!(verbs, vec!["upsert", "patch"]);
    assert_eq!(
        remote.record("transactions", "t1").unwrap()["amount_cents"],
        json!(250)
    );
}

#[tokio::test]
async fn replaying_a_successful_batch_changes_nothing() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    db.write(|txn| {
        txn.put("transactions", "t1", transaction_row(100))?;
        txn.put("users", "u1", user_row("a@example.com"))?;
        txn.delete("transactions", "t1").map(|_| ())
    })
    .unwrap();
    let batch = db.peek_next_group().unwrap().unwrap();

    engine.upload_once().await.unwrap();
    let before = (
        remote.record("users", "u1"),
        remote.record_count("transactions"),
    );

    let credential = test_credential("token");
    for op in batch.ops() {
        apply_op(remote.as_ref(), &credential, &op).await.unwrap();
    }
    let after = (
        remote.record("users", "u1"),
        remote.record_count("transactions"),
    );
    assert_eq!(before, after);
}

#[tokio::test]
async fn retired_group_is_gone_and_next_group_is_at_the_head() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    put_transaction(&db, "t1", 100);
    put_transaction(&db, "t2", 200);
    let first = db.peek_next_group().unwrap().unwrap().group_id;

    let outcome = engine.upload_once().await.unwrap();
    assert_eq!(
        outcome,
        UploadOutcome::Uploaded {
            group_id: first,
            operations: 1
        }
    );
    assert!(db.group_entries(first).unwrap().is_empty());

    let next = db.peek_next_group().unwrap().unwrap();
    assert!(next.group_id > first);
    assert_eq!(next.entries[0].op.id, "t2");
}

#[tokio::test]
async fn create_then_delete_collapses_past_a_conflicting_create() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.conflict_on_upsert("transactions", "2");
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    db.write(|txn| {
        txn.put("transactions", "2", transaction_row(900))?;
        txn.delete("transactions", "2").map(|_| ())
    })
    .unwrap();

    let outcome = engine.upload_once().await.unwrap();
    assert!(matches!(
        outcome,
        UploadOutcome::Uploaded { operations: 1, .. }
    ));
    assert_eq!(
        remote.calls(),
        vec![RemoteCall::Delete {
            table: "transactions".into(),
            id: "2".into()
        }]
    );
    assert_eq!(db.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn uncollapsed_create_hits_the_conflict() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.conflict_on_upsert("transactions", "2");
    let engine = engine_with(
        &db,
        &remote,
        signed_in("token"),
        fast_sync_config().with_collapse_operations(false),
    );

    db.write(|txn| {
        txn.put("transactions", "2", transaction_row(900))?;
        txn.delete("transactions", "2").map(|_| ())
    })
    .unwrap();
    let group_id = db.peek_next_group().unwrap().unwrap().group_id;

    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    assert_eq!(db.pending_count().unwrap(), 2);
}

#[tokio::test]
async fn rejected_credential_is_refetched() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.require_token("fresh");
    let provider = signed_in("stale");
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());

    put_transaction(&db, "t1", 100);

    let err = engine.upload_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    assert_eq!(provider.invalidation_count(), 1);
    assert_eq!(db.pending_count().unwrap(), 1);

    provider.set(Some(test_credential("fresh")));
    engine.upload_once().await.unwrap();
    assert_eq!(remote.tokens_seen(), vec!["stale", "fresh"]);
    assert_eq!(db.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn background_engine_recovers_from_a_rejected_credential() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.require_token("fresh");
    let provider = signed_in("stale");
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());
    engine.start();

    put_transaction(&db, "t1", 100);
    wait_for("the credential to be rejected", || {
        provider.invalidation_count() >= 1
    })
    .await;
    assert_eq!(db.pending_count().unwrap(), 1);

    provider.set(Some(test_credential("fresh")));
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;
    assert!(remote.record("transactions", "t1").is_some());
    engine.stop().await;
}

#[tokio::test]
async fn expired_credentials_are_not_used() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let provider = Arc::new(SwitchableCredentials::signed_in(
        test_credential("old").with_expiry(std::time::SystemTime::UNIX_EPOCH),
    ));
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());

    put_transaction(&db, "t1", 100);
    let err = engine.upload_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Credentials(_)));
    assert!(err.is_retryable());
    assert_eq!(remote.attempts(), 0);

    provider.set(Some(test_credential("new").expiring_in(Duration::from_secs(3600))));
    engine.upload_once().await.unwrap();
    assert_eq!(remote.tokens_seen(), vec!["new"]);
}

#[tokio::test]
async fn credential_fetch_failures_back_off() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let provider = signed_in("token");
    provider.fail_next_fetches(2);
    let engine = engine_with(&db, &remote, provider.clone(), fast_sync_config());
    engine.start();

    put_transaction(&db, "t1", 100);
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;

    assert_eq!(provider.fetch_count(), 3);
    assert_eq!(engine.status().borrow().retries, 2);
    engine.stop().await;
}

#[tokio::test]
async fn transient_failures_retry_with_backoff() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next_n(Fault::Unavailable, 3);
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    let mut status = engine.status();
    engine.start();

    put_transaction(&db, "t1", 100);
    let done = wait_for_status("the batch to upload", &mut status, |s| {
        s.uploaded_batches == 1
    })
    .await;

    assert_eq!(done.retries, 3);
    assert!(done.last_upload_error.is_none());
    assert!(done.last_uploaded_at.is_some());
    assert_eq!(remote.attempts(), 4);
    assert_eq!(remote.calls().len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn conflict_blocks_until_retried() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.conflict_on_upsert("transactions", "a");
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    let mut status = engine.status();
    engine.start();

    put_transaction(&db, "a", 100);
    let blocked = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "b", 200);

    let seen = wait_for_status("the outbox to block", &mut status, |s| {
        s.upload == UploadState::Blocked { group_id: blocked }
    })
    .await;
    let error = seen.last_upload_error.unwrap();
    assert_eq!(error.class, ErrorClass::Conflict);
    assert_eq!(error.group_id, Some(blocked));
    assert_eq!(engine.blocked_group(), Some(blocked));

    stays_false("a later group uploading", Duration::from_millis(100), || {
        remote.record("transactions", "b").is_some()
    })
    .await;
    let failure = db.upload_failure(blocked).unwrap().unwrap();
    assert_eq!(failure.class, "conflict");
    assert_eq!(failure.attempts, 1);

    engine.retry_blocked();
    wait_for("a second recorded attempt", || {
        db.upload_failure(blocked)
            .unwrap()
            .is_some_and(|f| f.attempts == 2)
    })
    .await;

    remote.heal();
    engine.retry_blocked();
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;
    assert!(remote.record("transactions", "a").is_some());
    assert!(remote.record("transactions", "b").is_some());
    assert!(db.upload_failures().unwrap().is_empty());
    assert_eq!(engine.blocked_group(), None);
    engine.stop().await;
}

#[tokio::test]
async fn discarding_the_blocked_group_unblocks_the_outbox() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(Fault::Rejected(403));
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    let mut status = engine.status();
    engine.start();

    put_transaction(&db, "a", 100);
    let blocked = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "b", 200);
    wait_for_status("the outbox to block", &mut status, |s| {
        s.upload == UploadState::Blocked { group_id: blocked }
    })
    .await;
    assert_eq!(db.upload_failure(blocked).unwrap().unwrap().class, "fatal");

    assert_eq!(engine.discard_blocked().await.unwrap(), Some(blocked));
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;

    assert!(remote.record("transactions", "a").is_none());
    assert!(remote.record("transactions", "b").is_some());
    assert!(db.upload_failure(blocked).unwrap().is_none());
    assert_eq!(engine.discard_blocked().await.unwrap(), None);
    engine.stop().await;
}

#[tokio::test]
async fn blocked_group_stays_blocked_across_a_restart() {
    let mut db = TestDatabase::file();
    let remote = Arc::new(MemoryRemote::new());
    remote.conflict_on_upsert("transactions", "a");

    put_transaction(&db, "a", 100);
    let group_id = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "b", 200);

    let first = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    assert_eq!(
        first.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    drop(first);
    db.reopen();

    let second = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    assert_eq!(second.blocked_group(), None);
    assert_eq!(
        second.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    assert_eq!(second.blocked_group(), Some(group_id));
    assert_eq!(
        second.status().borrow().upload,
        UploadState::Blocked { group_id }
    );
    assert_eq!(remote.attempts(), 1);
    assert_eq!(db.upload_failure(group_id).unwrap().unwrap().attempts, 1);

    remote.heal();
    second.retry_blocked();
    assert!(matches!(
        second.upload_once().await.unwrap(),
        UploadOutcome::Uploaded { group_id: uploaded, .. } if uploaded == group_id
    ));
    assert!(matches!(
        second.upload_once().await.unwrap(),
        UploadOutcome::Uploaded { .. }
    ));
    assert_eq!(second.blocked_group(), None);
    assert!(db.upload_failures().unwrap().is_empty());
}

#[tokio::test]
async fn undecodable_group_blocks_as_fatal_and_can_be_discarded() {
    let db = TestDatabase::file();
    let remote = Arc::new(MemoryRemote::new());

    put_transaction(&db, "a", 100);
    let group_id = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "b", 200);

    let raw = rusqlite::Connection::open(db.path().unwrap()).unwrap();
    raw.execute(
        &format!("UPDATE {OUTBOX_TABLE} SET op = 'BOGUS' WHERE group_id = ?1"),
        [group_id as i64],
    )
    .unwrap();
    drop(raw);

    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());
    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    let failure = db.upload_failure(group_id).unwrap().unwrap();
    assert_eq!(failure.class, "fatal");
    assert_eq!(failure.attempts, 1);
    assert_eq!(
        engine
            .status()
            .borrow()
            .last_upload_error
            .as_ref()
            .map(|e| e.class),
        Some(ErrorClass::Fatal)
    );
    assert_eq!(remote.attempts(), 0);

    assert_eq!(engine.discard_blocked().await.unwrap(), Some(group_id));
    assert!(matches!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Uploaded { .. }
    ));
    assert!(remote.record("transactions", "a").is_none());
    assert!(remote.record("transactions", "b").is_some());
}

#[tokio::test]
async fn rejected_credential_after_a_block_is_refetched_at_once() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.conflict_on_upsert("transactions", "a");
    remote.fail_next(Fault::Unauthorized);
    let provider = signed_in("token");
    // Any backoff would outlast the wait deadline.
    let config = fast_sync_config().with_retry(RetryConfig::fixed(Duration::from_secs(60)));
    let engine = engine_with(&db, &remote, provider.clone(), config);
    let mut status = engine.status();

    put_transaction(&db, "a", 100);
    let blocked = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "b", 200);
    engine.start();

    wait_for_status("the outbox to block", &mut status, |s| {
        s.upload == UploadState::Blocked { group_id: blocked }
    })
    .await;
    assert_eq!(provider.invalidation_count(), 1);

    remote.heal();
    remote.fail_next(Fault::Unauthorized);
    engine.retry_blocked();
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;

    assert_eq!(provider.invalidation_count(), 2);
    assert_eq!(engine.status().borrow().retries, 0);
    assert_eq!(engine.blocked_group(), None);
    assert!(remote.record("transactions", "a").is_some());
    assert!(remote.record("transactions", "b").is_some());
    engine.stop().await;
}

#[tokio::test]
async fn repeated_fatal_failures_are_skipped_past_the_threshold() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next_n(Fault::Rejected(422), 2);
    let engine = engine_with(
        &db,
        &remote,
        signed_in("token"),
        fast_sync_config().with_fatal_skip_threshold(2),
    );

    put_transaction(&db, "bad", 100);
    let group_id = db.peek_next_group().unwrap().unwrap().group_id;
    put_transaction(&db, "good", 200);

    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    // Blocked groups are not retried without being asked.
    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Blocked { group_id }
    );
    assert_eq!(remote.attempts(), 1);

    engine.retry_blocked();
    assert_eq!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Discarded { group_id }
    );
    assert!(matches!(
        engine.upload_once().await.unwrap(),
        UploadOutcome::Uploaded { .. }
    ));
    assert!(remote.record("transactions", "good").is_some());
    assert!(remote.record("transactions", "bad").is_none());
}

#[tokio::test]
async fn stop_waits_for_the_call_in_flight_and_restart_replays() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_delay(Some(Duration::from_millis(50)));
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    db.write(|txn| {
        for n in 0..3 {
            txn.put("transactions", &format!("t{n}"), transaction_row(n))?;
        }
        Ok(())
    })
    .unwrap();

    engine.start();
    assert!(engine.is_running());
    wait_for("the first call", || remote.attempts() >= 1).await;
    engine.stop().await;
    assert!(!engine.is_running());

    assert_eq!(remote.calls().len(), 1);
    assert_eq!(db.pending_count().unwrap(), 3);
    assert_eq!(engine.status().borrow().upload, UploadState::Stopped);

    remote.set_delay(None);
    engine.start();
    wait_for("the outbox to drain", || db.pending_count().unwrap() == 0).await;
    let ids: Vec<String> = remote.calls().iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, vec!["t0", "t0", "t1", "t2"]);
    engine.stop().await;
}

#[tokio::test]
async fn pending_count_live_query_follows_uploads() {
    let db = TestDatabase::memory();
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine_with(&db, &remote, signed_in("token"), fast_sync_config());

    let mut pending = db
        .handle()
        .watch(
            &format!("SELECT COUNT(*) AS n FROM {OUTBOX_TABLE}"),
            vec![],
            [OUTBOX_TABLE],
        )
        .unwrap();
    let first = within("the first snapshot", pending.next()).await.unwrap().unwrap();
    assert_eq!(first.rows[0]["n"], json!(0));

    put_transaction(&db, "t1", 100);
    let queued = within("the queued snapshot", pending.next()).await.unwrap().unwrap();
    assert_eq!(queued.rows[0]["n"], json!(1));

    engine.start();
    let drained = within("the drained snapshot", pending.next()).await.unwrap().unwrap();
    assert_eq!(drained.rows[0]["n"], json!(0));
    engine.stop().await;
}
