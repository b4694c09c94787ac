// tests/transaction_test.rs — Integration test: session database access and transactions

use wharf::db::{ConnectionPool, SqlValue};
use wharf::infra::config::ServerConfig;
use wharf::session::{Session, SessionFactory};
use wharf::{SharedResources, WharfError};

fn factory() -> SessionFactory {
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    let resources = SharedResources::builder(config)
        .pool(ConnectionPool::in_memory().unwrap())
        .build()
        .unwrap();
    SessionFactory::new(resources)
}

async fn setup(session: &Session) {
    session
        .db()
        .execute(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL)",
            vec![],
        )
        .await
        .unwrap();
}

async fn titles(session: &Session) -> Vec<String> {
    session
        .db()
        .query("SELECT title FROM notes ORDER BY id", vec![], |r| r.get(0))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_failed_transaction_leaves_no_writes() {
    let f = factory();
    let session = f.create_internal(false);
    setup(&session).await;

    let result: Result<(), anyhow::Error> = session
        .db()
        .transaction(|tx| {
            Box::pin(async move {
                tx.insert("notes", vec![("title", SqlValue::Text("one".into()))])
                    .await?;
                tx.execute(
                    "INSERT INTO notes (title) VALUES (?1)",
                    vec![SqlValue::Text("two".into())],
                )
                .await?;
                let inside: Vec<String> = tx
                    .query("SELECT title FROM notes", vec![], |r| r.get(0))
                    .await?;
                assert_eq!(inside.len(), 2);
                Err(anyhow::anyhow!("abort after two writes"))
            })
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "abort after two writes");
    assert!(titles(&session).await.is_empty());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_successful_transaction_commits() {
    let f = factory();
    let session = f.create_internal(false);
    setup(&session).await;

    let id = session
        .db()
        .transaction(|tx| {
            Box::pin(async move {
                let id = tx
                    .insert("notes", vec![("title", SqlValue::Text("kept".into()))])
                    .await?;
                Ok::<_, WharfError>(id)
            })
        })
        .await
        .unwrap();

    assert_eq!(id, 1);
    assert_eq!(titles(&session).await, vec!["kept".to_string()]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() {
    let f = factory();
    let session = f.create_internal(false);
    setup(&session).await;

    let outer: Result<(), WharfError> = session
        .db()
        .transaction(|tx| {
            Box::pin(async move {
                let inner: Result<(), WharfError> = tx
                    .session()
                    .db()
                    .transaction(|_| Box::pin(async { Ok(()) }))
                    .await;
                assert!(matches!(inner, Err(WharfError::NestedTransaction { .. })));
                tx.insert("notes", vec![("title", SqlValue::Text("outer".into()))])
                    .await?;
                Ok::<(), WharfError>(())
            })
        })
        .await;

    outer.unwrap();
    assert_eq!(titles(&session).await, vec!["outer".to_string()]);

    // The flag is cleared once the outer transaction ends.
    let again: Result<(), WharfError> = session
        .db()
        .transaction(|_| Box::pin(async { Ok(()) }))
        .await;
    assert!(again.is_ok());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_session_statements_inside_a_transaction_fail_fast() {
    let f = factory();
    let session = f.create_internal(false);
    setup(&session).await;

    let db = session.db();
    let run = db.transaction(|tx| {
        Box::pin(async move {
            tx.insert("notes", vec![("title", SqlValue::Text("inside".into()))])
                .await?;
            let stray = tx
                .session()
                .db()
                .execute("INSERT INTO notes (title) VALUES ('stray')", vec![])
                .await;
            assert!(matches!(stray, Err(WharfError::NestedTransaction { .. })));
            Ok::<(), WharfError>(())
        })
    });
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(3), run)
        .await
        .expect("transaction must not wait on a second connection");

    outcome.unwrap();
    assert_eq!(titles(&session).await, vec!["inside".to_string()]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_update_and_delete_helpers() {
    let f = factory();
    let session = f.create_internal(false);
    setup(&session).await;
    let db = session.db();

    for title in ["a", "b", "c"] {
        db.insert("notes", vec![("title", SqlValue::Text(title.into()))])
            .await
            .unwrap();
    }
    let changed = db
        .update(
            "notes",
            vec![("title", SqlValue::Text("B".into()))],
            "title = ?2",
            vec![SqlValue::Text("b".into())],
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let removed = db
        .delete("notes", "title = ?1", vec![SqlValue::Text("a".into())])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let one: Option<String> = db
        .query_one("SELECT title FROM notes ORDER BY id", vec![], |r| r.get(0))
        .await
        .unwrap();
    assert_eq!(one.as_deref(), Some("B"));
    assert_eq!(titles(&session).await, vec!["B".to_string(), "c".to_string()]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_bad_table_name_never_reaches_sqlite() {
    let f = factory();
    let session = f.create_internal(false);
    let err = session
        .db()
        .insert("notes; DROP TABLE x", vec![("title", SqlValue::Null)])
        .await
        .unwrap_err();
    assert!(matches!(err, WharfError::Database(_)));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_no_database_is_a_configuration_error() {
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    let f = SessionFactory::new(SharedResources::builder(config).build().unwrap());
    let session = f.create_internal(false);
    let err = session.db().execute("SELECT 1", vec![]).await.unwrap_err();
    assert!(err.is_configuration());
    session.close().await.unwrap();
}
