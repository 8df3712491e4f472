//! Tests for log entries and phase timing

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use corral::prelude::*;
use corral::testing::{ScriptedAdapter, Step};

type Entries = Arc<Mutex<Vec<LogEntry<String, Vec<String>>>>>;

fn capture() -> (Entries, Config<ScriptedAdapter>) {
    let entries: Entries = Arc::new(Mutex::new(Vec::new()));
    let sink = entries.clone();
    let config = Config::new()
        .with_idle_interval(Duration::from_secs(60))
        .with_timeout(Duration::from_millis(500))
        .with_queue_timeout(Duration::from_millis(300))
        .with_log(Arc::new(move |entry| {
            sink.lock().push(entry.clone());
        }));
    (entries, config)
}

// ==================== Phase nullability ====================

#[tokio::test]
async fn test_single_query_carries_pool_and_connection_time() {
    let (entries, config) = capture();
    let adapter = ScriptedAdapter::new(vec![Step::Ok, Step::OkOutput(vec!["r".into()])]);
    let pool = Pool::start(adapter, config).await.unwrap();

    pool.run(|client| async move { client.query("Q".into(), vec![]).await }.boxed())
        .await
        .unwrap();

    let entries = entries.lock().clone();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.call, Call::Query);
    assert_eq!(entry.query.as_deref(), Some("Q"));
    assert_eq!(entry.params.as_deref(), Some(&[] as &[String]));
    assert!(entry.result.is_ok());
    // The call paid the pool queue and ran on the adapter; no decode ran.
    assert!(entry.pool_time.is_some());
    assert!(entry.connection_time.is_some());
    assert_eq!(entry.decode_time, None);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_pool_time_only_on_first_call_of_the_window() {
    let (entries, config) = capture();
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok, // connect
        Step::Ok, // begin
        Step::Ok, // query
        Step::Ok, // commit
    ]);
    let pool = Pool::start(adapter, config).await.unwrap();

    pool.transaction(|client| {
        async move {
            match client.query("Q".into(), vec![]).await {
                Ok(_) => TxOutcome::Commit(()),
                Err(err) => TxOutcome::Error(err),
            }
        }
        .boxed()
    })
    .await
    .unwrap();

    let entries = entries.lock().clone();
    let calls: Vec<Call> = entries.iter().map(|e| e.call).collect();
    assert_eq!(calls, vec![Call::Begin, Call::Query, Call::Commit]);

    // Only the begin paid the check-out; the rest reused the connection.
    assert!(entries[0].pool_time.is_some());
    assert_eq!(entries[1].pool_time, None);
    assert_eq!(entries[2].pool_time, None);
    for entry in &entries {
        assert!(entry.connection_time.is_some());
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_decode_time_present_only_when_decode_ran() {
    let (entries, config) = capture();
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok,                      // connect
        Step::Ok,                      // begin
        Step::Ok,                      // declare (decoded stream)
        Step::Halt(vec!["r".into()]),  // fetch
        Step::Ok,                      // deallocate
        Step::Ok,                      // declare (plain stream)
        Step::Halt(vec!["r".into()]),  // fetch
        Step::Ok,                      // deallocate
        Step::Ok,                      // commit
    ]);
    let pool = Pool::start(adapter, config).await.unwrap();

    pool.transaction(|client| {
        async move {
            let decoded_opts: StreamOptions<ScriptedAdapter> =
                StreamOptions::new().with_decode(Arc::new(|_q, chunk| Ok(chunk)));
            let mut stream = match client.stream("Q1".into(), vec![], decoded_opts).await {
                Ok(stream) => stream,
                Err(err) => return TxOutcome::Error(err),
            };
            while let Some(chunk) = stream.next().await {
                if let Err(err) = chunk {
                    return TxOutcome::Error(err);
                }
            }
            drop(stream);

            let mut stream = match client
                .stream("Q2".into(), vec![], StreamOptions::new())
                .await
            {
                Ok(stream) => stream,
                Err(err) => return TxOutcome::Error(err),
            };
            while let Some(chunk) = stream.next().await {
                if let Err(err) = chunk {
                    return TxOutcome::Error(err);
                }
            }
            drop(stream);
            TxOutcome::Commit(())
        }
        .boxed()
    })
    .await
    .unwrap();

    let entries = entries.lock().clone();
    let fetches: Vec<_> = entries.iter().filter(|e| e.call == Call::Fetch).collect();
    assert_eq!(fetches.len(), 2);
    assert!(fetches[0].decode_time.is_some());
    assert_eq!(fetches[1].decode_time, None);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_error_results_render_the_error() {
    let (entries, config) = capture();
    let adapter = ScriptedAdapter::new(vec![
        Step::Ok,                     // connect
        Step::Error("nope".into()),   // query
    ]);
    let pool = Pool::start(adapter, config).await.unwrap();

    let err = pool
        .run(|client| async move { client.query("Q".into(), vec![]).await }.boxed())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "nope");

    let entries = entries.lock().clone();
    assert_eq!(entries[0].result.as_ref().unwrap_err(), "nope");
    assert!(entries[0].connection_time.is_some());
    pool.shutdown().await;
}

// ==================== Hook safety ====================

#[tokio::test]
async fn test_panicking_hook_does_not_interrupt_operations() {
    let adapter = ScriptedAdapter::new(vec![Step::Ok, Step::OkOutput(vec!["r".into()])]);
    let config = Config::new()
        .with_idle_interval(Duration::from_secs(60))
        .with_timeout(Duration::from_millis(500))
        .with_queue_timeout(Duration::from_millis(300))
        .with_log(Arc::new(|_entry| panic!("bad hook")));
    let pool = Pool::start(adapter, config).await.unwrap();

    let rows = pool
        .run(|client| async move { client.query("Q".into(), vec![]).await }.boxed())
        .await
        .unwrap();
    assert_eq!(rows, vec!["r".to_string()]);
    pool.shutdown().await;
}
