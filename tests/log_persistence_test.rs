// tests/log_persistence_test.rs — Integration test: session logs flushed to SQLite

use wharf::db::{ConnectionPool, SqlValue};
use wharf::infra::config::ServerConfig;
use wharf::retention::{cleanup_once, RetentionPolicy};
use wharf::session::log::{query_recent_sessions, query_session_entries};
use wharf::session::{LogLevel, RequestContext, SessionFactory};
use wharf::SharedResources;

fn persistent_factory() -> (SessionFactory, ConnectionPool) {
    let pool = ConnectionPool::in_memory().unwrap();
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    config.logging.persistent_enabled = true;
    config.logging.log_level = LogLevel::Debug;
    let resources = SharedResources::builder(config)
        .pool(pool.clone())
        .build()
        .unwrap();
    (SessionFactory::new(resources), pool)
}

#[tokio::test]
async fn test_entries_are_flushed_in_call_order() {
    let (f, pool) = persistent_factory();
    let session = f.create_internal(true);
    let messages: Vec<String> = (0..25).map(|i| format!("step {i}")).collect();
    for (i, message) in messages.iter().enumerate() {
        let level = if i % 3 == 0 {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };
        session.log(message.clone(), level).unwrap();
    }
    let session_id = session.id().to_string();
    let log_id = session.close().await.unwrap();
    assert!(log_id.is_some());

    let entries = pool
        .run(move |c| query_session_entries(c, &session_id))
        .await
        .unwrap();
    let flushed: Vec<String> = entries.iter().map(|e| e.message.clone()).collect();
    assert_eq!(flushed, messages);
    let seqs: Vec<i64> = entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..25).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_entries_below_threshold_are_dropped() {
    let pool = ConnectionPool::in_memory().unwrap();
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    config.logging.persistent_enabled = true;
    config.logging.log_level = LogLevel::Warning;
    let f = SessionFactory::new(
        SharedResources::builder(config)
            .pool(pool.clone())
            .build()
            .unwrap(),
    );

    let session = f.create_internal(true);
    session.log("debug detail", LogLevel::Debug).unwrap();
    session.log("heads up", LogLevel::Warning).unwrap();
    session.log("info detail", LogLevel::Info).unwrap();
    assert_eq!(session.pending_log_entries(), 1);
    let session_id = session.id().to_string();
    session.close().await.unwrap();

    let entries = pool
        .run(move |c| query_session_entries(c, &session_id))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, "warning");
}

#[tokio::test]
async fn test_quiet_session_is_not_persisted() {
    let (f, pool) = persistent_factory();
    let session = f.create_method_call(
        RequestContext::new("http://localhost/users", "", 1024).unwrap(),
        "list",
    );
    assert_eq!(session.close().await.unwrap(), None);
    let rows = pool.run(|c| query_recent_sessions(c, 10)).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_failed_session_records_error_and_listener_failure() {
    let (f, pool) = persistent_factory();
    let session = f.create_future_call("nightly", Some("job-1".into()));
    session
        .add_will_close_listener(|_| Box::pin(async { Err(anyhow::anyhow!("cleanup failed")) }))
        .unwrap();
    let session_id = session.id().to_string();
    session
        .close_with_error("handler crashed", Some("at nightly()".into()))
        .await
        .unwrap();

    let rows = pool.run(|c| query_recent_sessions(c, 10)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "future_call");
    assert_eq!(rows[0].endpoint.as_deref(), Some("nightly"));
    assert_eq!(rows[0].error.as_deref(), Some("handler crashed"));

    let entries = pool
        .run(move |c| query_session_entries(c, &session_id))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, "error");
    assert_eq!(entries[0].error.as_deref(), Some("cleanup failed"));
}

#[tokio::test]
async fn test_failed_query_is_logged_and_counted() {
    let (f, pool) = persistent_factory();
    let session = f.create_internal(true);
    session
        .db()
        .execute("CREATE TABLE t (v INTEGER NOT NULL)", vec![])
        .await
        .unwrap();
    let failed = session
        .db()
        .execute("INSERT INTO t (v) VALUES (?1)", vec![SqlValue::Null])
        .await;
    assert!(failed.is_err());
    let session_id = session.id().to_string();
    session.close().await.unwrap();

    let rows = pool.run(|c| query_recent_sessions(c, 1)).await.unwrap();
    assert_eq!(rows[0].num_queries, 2);

    let entries = pool
        .run(move |c| query_session_entries(c, &session_id))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].query.as_deref(), Some("INSERT INTO t (v) VALUES (?1)"));
    assert!(entries[0].error.is_some());
}

#[tokio::test]
async fn test_retention_trims_flushed_sessions() {
    let (f, pool) = persistent_factory();
    for i in 0..4 {
        let session = f.create_internal(true);
        session.log(format!("run {i}"), LogLevel::Info).unwrap();
        session.close().await.unwrap();
    }

    let report = cleanup_once(
        &pool,
        RetentionPolicy {
            max_age: None,
            max_count: Some(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(report.removed_by_count, 3);

    let rows = pool.run(|c| query_recent_sessions(c, 10)).await.unwrap();
    assert_eq!(rows.len(), 1);
    let remaining = pool
        .run(|c| c.query_row("SELECT COUNT(*) FROM log_entry", [], |r| r.get::<_, i64>(0)))
        .await
        .unwrap();
    assert_eq!(remaining, 1);
}

#[test]
fn test_persistent_logging_without_database_is_rejected() {
    let mut config = ServerConfig::default();
    config.logging.persistent_enabled = true;
    let err = SharedResources::builder(config).build().unwrap_err();
    assert!(err.is_configuration());
}
