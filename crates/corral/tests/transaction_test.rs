//! Tests for transaction pairing and failure modes

use std::time::Duration;

use futures::FutureExt;
use corral::prelude::*;
use corral::testing::{RecordedCall, ScriptedAdapter, Step};

fn fast_config() -> Config<ScriptedAdapter> {
    Config::new()
        .with_backoff_bounds(Duration::from_millis(10), Duration::from_millis(40))
        .with_idle_interval(Duration::from_secs(60))
        .with_timeout(Duration::from_millis(500))
        .with_queue_timeout(Duration::from_millis(300))
}

fn pairs(adapter: &ScriptedAdapter) -> (usize, usize, usize) {
    let calls = adapter.calls();
    let begins = calls.iter().filter(|c| matches!(c, RecordedCall::Begin)).count();
    let commits = calls.iter().filter(|c| matches!(c, RecordedCall::Commit)).count();
    let rollbacks = calls
        .iter()
        .filter(|c| matches!(c, RecordedCall::Rollback))
        .count();
    (begins, commits, rollbacks)
}

// ==================== Pairing ====================

#[tokio::test]
async fn test_every_begin_pairs_with_exactly_one_ending() {
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok, // connect
        Step::Ok, // begin 1
        Step::Ok, // commit 1
        Step::Ok, // begin 2
        Step::Ok, // rollback 2
    ]);
    let pool = Pool::start(adapter.clone(), fast_config()).await.unwrap();

    pool.transaction(|_| async move { TxOutcome::Commit(()) }.boxed())
        .await
        .unwrap();
    let rolled: Result<()> = pool
        .transaction(|_| async move { TxOutcome::Rollback }.boxed())
        .await;
    assert!(rolled.unwrap_err().is_rollback());

    let (begins, commits, rollbacks) = pairs(&adapter);
    assert_eq!(begins, 2);
    assert_eq!(commits + rollbacks, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_excuses_the_pairing() {
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok,                        // connect
        Step::Ok,                        // begin
        Step::Disconnect("gone".into()), // query
        Step::Ok,                        // reconnect
    ]);
    let pool = Pool::start(adapter.clone(), fast_config()).await.unwrap();

    let result: Result<()> = pool
        .transaction(|client| {
            async move {
                match client.query("Q".into(), vec![]).await {
                    Ok(_) => TxOutcome::Commit(()),
                    Err(err) => TxOutcome::Error(err),
                }
            }
            .boxed()
        })
        .await;
    assert_eq!(result.unwrap_err().to_string(), "gone");

    assert!(
        adapter
            .wait_for(|_| adapter.connect_count() >= 2, Duration::from_secs(2))
            .await
    );
    // Neither commit nor rollback reached the adapter: the disconnect
    // intervened and the holder tore the session down.
    let (begins, commits, rollbacks) = pairs(&adapter);
    assert_eq!((begins, commits, rollbacks), (1, 0, 0));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_user_error_rolls_back_and_surfaces() {
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok, // connect
        Step::Ok, // begin
        Step::Ok, // rollback
    ]);
    let pool = Pool::start(adapter.clone(), fast_config()).await.unwrap();

    let result: Result<()> = pool
        .transaction(|_| {
            async move { TxOutcome::Error(Error::connection("user gave up")) }.boxed()
        })
        .await;
    assert_eq!(result.unwrap_err().to_string(), "user gave up");

    let (begins, commits, rollbacks) = pairs(&adapter);
    assert_eq!((begins, commits, rollbacks), (1, 0, 1));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_commit_error_surfaces_and_ends_transaction() {
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok,                            // connect
        Step::Ok,                            // begin
        Step::Error("serialization".into()), // commit
        Step::Ok,                            // begin (next transaction works)
        Step::Ok,                            // commit
    ]);
    let pool = Pool::start(adapter.clone(), fast_config()).await.unwrap();

    let result: Result<()> = pool
        .transaction(|_| async move { TxOutcome::Commit(()) }.boxed())
        .await;
    assert_eq!(result.unwrap_err().to_string(), "serialization");

    pool.transaction(|_| async move { TxOutcome::Commit(()) }.boxed())
        .await
        .unwrap();

    let (begins, commits, _) = pairs(&adapter);
    assert_eq!(begins, 2);
    assert_eq!(commits, 2);
    pool.shutdown().await;
}

// ==================== Abandonment ====================

#[tokio::test]
async fn test_abandoned_transaction_is_rolled_back() {
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok, // connect
        Step::Ok, // begin
        Step::Ok, // rollback (implicit)
    ]);
    let pool = Pool::start(adapter.clone(), fast_config()).await.unwrap();

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let _: Result<()> = pool
                .transaction(|_| {
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        TxOutcome::Commit(())
                    }
                    .boxed()
                })
                .await;
        })
    };
    assert!(
        adapter
            .wait_for(
                |calls| calls.contains(&RecordedCall::Begin),
                Duration::from_secs(1)
            )
            .await
    );

    task.abort();

    assert!(
        adapter
            .wait_for(
                |calls| calls.contains(&RecordedCall::Rollback)
                    && calls.contains(&RecordedCall::Checkin),
                Duration::from_secs(1)
            )
            .await
    );

    // The connection is reusable afterwards.
    let client = pool.checkout().await.unwrap();
    client.checkin().await;
    pool.shutdown().await;
}
