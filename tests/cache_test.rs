// tests/cache_test.rs — Integration test: local and global cache tiers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wharf::infra::config::ServerConfig;
use wharf::resources::cache::{CacheMissHandler, MemoryDistributedCache};
use wharf::resources::messages::MemoryMessageBackend;
use wharf::session::SessionFactory;
use wharf::{SharedResources, WharfError};

fn quiet_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    config
}

fn local_only() -> SessionFactory {
    SessionFactory::new(SharedResources::builder(quiet_config()).build().unwrap())
}

#[tokio::test]
async fn test_miss_handler_runs_once_within_lifetime() {
    let f = local_only();
    let loads = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let session = f.create_internal(false);
        let l = loads.clone();
        let value: Option<String> = session
            .caches()
            .local()
            .get_or_load(
                "greeting",
                CacheMissHandler::new(move || async move {
                    l.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("hello".to_string()))
                })
                .with_lifetime(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
        session.close().await.unwrap();
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_miss_handler_returning_none_stores_nothing() {
    let f = local_only();
    let session = f.create_internal(false);
    let local = session.caches().local();
    let value: Option<u32> = local
        .get_or_load("absent", CacheMissHandler::new(|| async { Ok(None) }))
        .await
        .unwrap();
    assert!(value.is_none());
    assert!(!local.contains_key("absent").unwrap());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_expired_entry_reloads() {
    let f = local_only();
    let session = f.create_internal(false);
    let local = session.caches().local();
    local
        .put("short", &1u32, Some(Duration::from_millis(10)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(local.get::<u32>("short").unwrap(), None);

    let value: Option<u32> = local
        .get_or_load("short", CacheMissHandler::new(|| async { Ok(Some(2)) }))
        .await
        .unwrap();
    assert_eq!(value, Some(2));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_outlives_the_session_that_filled_it() {
    let f = local_only();
    let writer = f.create_internal(false);
    writer
        .caches()
        .local_prio()
        .put_in_group("user:1", &"ada", None, "users")
        .unwrap();
    writer.close().await.unwrap();

    let reader = f.create_internal(false);
    let prio = reader.caches().local_prio();
    assert_eq!(prio.get::<String>("user:1").unwrap().as_deref(), Some("ada"));
    assert!(reader.caches().local().get::<String>("user:1").unwrap().is_none());
    assert_eq!(prio.invalidate_group("users").unwrap(), 1);
    assert!(prio.get::<String>("user:1").unwrap().is_none());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_global_without_backend_fails_and_stores_nothing() {
    let f = local_only();
    let session = f.create_internal(false);
    let err = session
        .caches()
        .global()
        .put("k", &42, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WharfError::Configuration(_)));

    assert!(!session.caches().local().contains_key("k").unwrap());
    assert!(!session.caches().local_prio().contains_key("k").unwrap());
    assert!(session.caches().global().get::<i32>("k").await.is_err());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_global_tier_with_backend() {
    let mut config = quiet_config();
    config.distributed.enabled = true;
    let resources = SharedResources::builder(config)
        .distributed_cache(Arc::new(MemoryDistributedCache::new()))
        .global_messages(Arc::new(MemoryMessageBackend::new()))
        .build()
        .unwrap();
    let f = SessionFactory::new(resources);

    let a = f.create_internal(false);
    a.caches().global().put("shared", &vec![1, 2, 3], None).await.unwrap();
    a.close().await.unwrap();

    let b = f.create_internal(false);
    let global = b.caches().global();
    assert_eq!(global.get::<Vec<i32>>("shared").await.unwrap(), Some(vec![1, 2, 3]));
    assert!(global.invalidate_key("shared").await.unwrap());
    assert_eq!(global.get::<Vec<i32>>("shared").await.unwrap(), None);
    b.close().await.unwrap();
}

#[test]
fn test_distributed_mode_requires_both_backends() {
    let mut config = quiet_config();
    config.distributed.enabled = true;
    let err = SharedResources::builder(config)
        .distributed_cache(Arc::new(MemoryDistributedCache::new()))
        .build()
        .unwrap_err();
    assert!(err.is_configuration());
}
