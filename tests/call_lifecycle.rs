mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockAdapter, recording_observer};
use sql_dispatch::prelude::*;
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(5);

fn unbounded() -> CallOptions {
    CallOptions::builder().unbounded().finish()
}

#[tokio::test]
async fn archived_call_reports_every_state_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let conn = MockAdapter::numbers(5).connection(CallOptions::default());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELECT n FROM numbers", Some(observer))?;
    assert_eq!(call.state(), CallState::Executing);
    assert_eq!(call.query(), "SELECT n FROM numbers");

    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CallState::Executing,
            CallState::Retrieving,
            CallState::Archived
        ]
    );

    let cache = call.result().expect("archived call has a cache");
    assert_eq!(cache.header(), &vec!["n".to_string()]);
    let rows = cache.all_rows().await?;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[4], vec![RowValues::Int(4)]);
    assert!(call.err().is_none());
    assert!(call.time_taken().is_some());
    Ok(())
}

#[tokio::test]
async fn rejected_query_fails_while_executing() -> Result<(), Box<dyn std::error::Error>> {
    let conn = MockAdapter::numbers(1)
        .failing_query("syntax error at or near \"SELEC\"")
        .connection(CallOptions::default());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELEC 1", Some(observer))?;
    assert_eq!(
        timeout(PATIENCE, call.wait()).await?,
        CallState::ExecutingFailed
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![CallState::Executing, CallState::ExecutingFailed]
    );
    let err = call.err().expect("failed call keeps its error");
    assert!(matches!(&*err, SqlDispatchError::QueryError(msg) if msg.contains("syntax error")));
    assert!(call.result().is_none());
    Ok(())
}

#[tokio::test]
async fn cancel_while_executing_interrupts_the_backend() -> Result<(), Box<dyn std::error::Error>>
{
    let adapter = MockAdapter::numbers(3).query_delay(Duration::from_secs(30));
    let conn = adapter.connection(CallOptions::default());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELECT pg_sleep(30)", Some(observer))?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    call.cancel();

    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Canceled);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![CallState::Executing, CallState::Canceled]
    );
    assert!(adapter.stats.interrupted.load(Ordering::SeqCst));
    assert_eq!(adapter.stats.active.load(Ordering::SeqCst), 0);
    assert!(call.result().is_none());
    assert!(call.err().is_none());
    Ok(())
}

#[tokio::test]
async fn cancel_while_retrieving_closes_the_cache() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(10_000).row_delay(Duration::from_millis(2));
    let conn = adapter.connection(unbounded());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELECT n FROM big", Some(observer))?;
    let mut states = call.subscribe();
    timeout(PATIENCE, states.wait_for(|s| *s == CallState::Retrieving)).await??;
    call.cancel();

    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Canceled);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CallState::Executing,
            CallState::Retrieving,
            CallState::Canceled
        ]
    );
    let status = call.result().expect("cache exists once retrieving").status().await;
    assert!(status.closed);
    assert!(!status.exhausted);
    assert!(status.buffered < 10_000);
    assert_eq!(adapter.stats.active.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_after_completion_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let conn = MockAdapter::numbers(2).connection(CallOptions::default());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELECT n", Some(observer))?;
    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);
    call.cancel();
    call.cancel();

    assert_eq!(call.wait().await, CallState::Archived);
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(call.result().unwrap().all_rows().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn broken_stream_fails_while_retrieving() -> Result<(), Box<dyn std::error::Error>> {
    let conn = MockAdapter::numbers(10)
        .failing_after(4)
        .connection(unbounded());
    let (observer, seen) = recording_observer();

    let call = conn.execute("SELECT n", Some(observer))?;
    assert_eq!(
        timeout(PATIENCE, call.wait()).await?,
        CallState::RetrievingFailed
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CallState::Executing,
            CallState::Retrieving,
            CallState::RetrievingFailed
        ]
    );
    assert!(matches!(
        call.err().as_deref(),
        Some(SqlDispatchError::IterationError(_))
    ));

    // Rows that made it into the cache before the failure stay readable.
    let cache = call.result().expect("cache exists once retrieving");
    assert_eq!(cache.rows(0, 10).await?.len(), 4);
    assert!(cache.status().await.closed);
    Ok(())
}

#[tokio::test]
async fn prefetch_limit_archives_early_and_pages_lazily() -> Result<(), Box<dyn std::error::Error>>
{
    let adapter = MockAdapter::numbers(100);
    let options = CallOptions::builder()
        .chunk_size(8)
        .prefetch_rows(20)
        .finish();
    let conn = adapter.connection(options);

    let call = conn.execute("SELECT n", None)?;
    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);

    let cache = call.result().expect("archived call has a cache");
    let status = cache.status().await;
    assert_eq!(status.buffered, 20);
    assert!(!status.exhausted);
    assert_eq!(adapter.stats.rows_served.load(Ordering::SeqCst), 20);

    let page = cache.rows(50, 55).await?;
    let expected: Vec<Row> = (50..55).map(|i| vec![RowValues::Int(i)]).collect();
    assert_eq!(page, expected);
    assert_eq!(cache.len().await, 55);

    let all = cache.all_rows().await?;
    assert_eq!(all.len(), 100);
    assert!(
        all.iter()
            .enumerate()
            .all(|(i, row)| row[0] == RowValues::Int(i as i64))
    );
    assert!(cache.is_exhausted().await);
    Ok(())
}

#[tokio::test]
async fn observer_and_subscriber_agree_on_the_final_state() -> Result<(), Box<dyn std::error::Error>>
{
    let conn = MockAdapter::numbers(3).connection(CallOptions::default());
    let (observer, seen) = recording_observer();
    let call = conn.execute("SELECT n", Some(observer))?;
    let mut states = call.subscribe();

    let last = *timeout(PATIENCE, states.wait_for(|s| s.is_terminal())).await??;
    call.wait().await;
    assert_eq!(seen.lock().unwrap().last().copied(), Some(last));

    let details = call.details();
    assert_eq!(details.state, CallState::Archived);
    assert_eq!(details.id, call.id());
    let json = serde_json::to_value(&details)?;
    assert_eq!(json["state"], "archived");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serialized_adapter_never_runs_two_queries_at_once()
-> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(20)
        .query_delay(Duration::from_millis(10))
        .row_delay(Duration::from_millis(1))
        .serialized();
    let conn = adapter.connection(unbounded());

    let calls = (0..5)
        .map(|i| conn.execute(format!("SELECT {i}"), None))
        .collect::<Result<Vec<_>, _>>()?;
    for call in &calls {
        assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);
    }
    assert_eq!(adapter.stats.queries.load(Ordering::SeqCst), 5);
    assert_eq!(adapter.stats.max_active.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_safe_adapter_runs_queries_side_by_side()
-> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(2).query_delay(Duration::from_millis(200));
    let conn = adapter.connection(unbounded());

    let calls = (0..4)
        .map(|i| conn.execute(format!("SELECT {i}"), None))
        .collect::<Result<Vec<_>, _>>()?;
    for call in &calls {
        assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);
    }
    assert!(adapter.stats.max_active.load(Ordering::SeqCst) > 1);
    Ok(())
}

#[tokio::test]
async fn call_waiting_for_a_serialized_adapter_can_be_canceled()
-> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(3)
        .query_delay(Duration::from_secs(30))
        .serialized();
    let conn = adapter.connection(CallOptions::default());

    // Holds the adapter while its query runs.
    let first = conn.execute("SELECT slowly", None)?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (observer, seen) = recording_observer();
    let second = conn.execute("SELECT n", Some(observer))?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(second.state(), CallState::Executing);
    second.cancel();
    assert_eq!(timeout(PATIENCE, second.wait()).await?, CallState::Canceled);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![CallState::Executing, CallState::Canceled]
    );
    assert_eq!(adapter.stats.queries.load(Ordering::SeqCst), 1);

    first.cancel();
    assert_eq!(timeout(PATIENCE, first.wait()).await?, CallState::Canceled);
    assert_eq!(adapter.stats.queries.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn partly_read_result_yields_to_a_queued_call() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(1_000).serialized();
    let options = CallOptions::builder().prefetch_rows(10).finish();
    let conn = adapter.connection(options);

    let first = conn.execute("SELECT n", None)?;
    assert_eq!(timeout(PATIENCE, first.wait()).await?, CallState::Archived);
    let cache = first.result().expect("cache");
    assert_eq!(cache.len().await, 10);

    // The first result is pulled into memory so the second call can have the adapter.
    let second = conn.execute("SELECT n", None)?;
    assert_eq!(timeout(PATIENCE, second.wait()).await?, CallState::Archived);
    assert_eq!(
        cache.status().await,
        CacheStatus {
            buffered: 1_000,
            exhausted: true,
            closed: false
        }
    );
    assert_eq!(cache.rows(995, 1_000).await?.len(), 5);
    assert_eq!(adapter.stats.max_active.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn result_carries_the_call_timestamp() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(2)
        .query_delay(Duration::from_millis(30))
        .serialized();
    let conn = adapter.connection(CallOptions::default());

    let call = conn.execute("SELECT n", None)?;
    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);
    let cache = call.result().expect("cache");
    assert_eq!(cache.meta().timestamp, call.meta().timestamp);
    assert_eq!(cache.meta().query, call.query());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepted_call_is_canceled_by_a_racing_close()
-> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(1).query_delay(Duration::from_secs(30));
    let conn = std::sync::Arc::new(adapter.connection(CallOptions::default()));

    let issuer = {
        let conn = std::sync::Arc::clone(&conn);
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Ok(call) = conn.execute("SELECT slowly", None) {
                accepted.push(call);
                tokio::task::yield_now().await;
            }
            accepted
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    timeout(PATIENCE, conn.close()).await?;

    let accepted = timeout(PATIENCE, issuer).await??;
    assert!(!accepted.is_empty());
    for call in &accepted {
        assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Canceled);
    }
    Ok(())
}

#[tokio::test]
async fn closing_the_connection_cancels_live_calls() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(3).query_delay(Duration::from_secs(30));
    let conn = adapter.connection(CallOptions::default());

    let call = conn.execute("SELECT slowly", None)?;
    assert_eq!(conn.live_calls().len(), 1);

    timeout(PATIENCE, conn.close()).await?;
    assert_eq!(call.state(), CallState::Canceled);
    assert!(adapter.stats.closed.load(Ordering::SeqCst));
    assert!(conn.live_calls().is_empty());

    let err = conn.execute("SELECT 1", None).unwrap_err();
    assert!(matches!(err, SqlDispatchError::ConfigError(_)));

    // A second close is a no-op.
    conn.close().await;
    Ok(())
}

#[tokio::test]
async fn live_calls_only_lists_unfinished_calls() -> Result<(), Box<dyn std::error::Error>> {
    let conn = MockAdapter::numbers(1)
        .query_delay(Duration::from_millis(100))
        .connection(CallOptions::default());

    let a = conn.execute("SELECT a", None)?;
    let b = conn.execute("SELECT b", None)?;
    let live: Vec<CallId> = conn.live_calls().iter().map(Call::id).collect();
    assert_eq!(live, vec![a.id(), b.id()]);
    assert_ne!(a.id(), b.id());

    timeout(PATIENCE, a.wait()).await?;
    timeout(PATIENCE, b.wait()).await?;
    assert!(conn.live_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_capabilities_are_unsupported() {
    let conn = MockAdapter::numbers(1).connection(CallOptions::default());

    assert!(matches!(
        conn.schema().await,
        Err(SqlDispatchError::Unsupported(_))
    ));
    assert!(matches!(
        conn.get_columns(&TableOptions::new("main", "t")).await,
        Err(SqlDispatchError::Unsupported(_))
    ));
    assert!(matches!(
        conn.get_structure().await,
        Err(SqlDispatchError::Unsupported(_))
    ));
    assert!(matches!(
        conn.select_database("other").await,
        Err(SqlDispatchError::Unsupported(_))
    ));
    assert!(matches!(
        conn.list_databases().await,
        Err(SqlDispatchError::Unsupported(_))
    ));
}

#[tokio::test]
async fn registry_builds_connections_by_tag() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = MockAdapter::numbers(2);
    let registry = adapter.registry();

    let params = ConnectionParams::new("m1", "mocked", "MOCK", "mock://");
    let conn = Connection::new(params, &registry, CallOptions::default())?;
    assert_eq!(conn.kind(), "MOCK");
    let call = conn.execute("SELECT n", None)?;
    assert_eq!(timeout(PATIENCE, call.wait()).await?, CallState::Archived);

    let unknown = ConnectionParams::new("m2", "nothing", "oracle", "oracle://");
    let err = Connection::new(unknown, &registry, CallOptions::default()).unwrap_err();
    assert!(matches!(err, SqlDispatchError::ConfigError(msg) if msg.contains("oracle")));
    Ok(())
}

#[test]
fn execute_outside_a_runtime_is_a_config_error() {
    let conn = MockAdapter::numbers(1).connection(CallOptions::default());
    let err = conn.execute("SELECT 1", None).unwrap_err();
    assert!(matches!(err, SqlDispatchError::ConfigError(_)));
}
