// tests/storage_test.rs — Integration test: file storage through sessions

use wharf::db::ConnectionPool;
use wharf::infra::config::{ServerConfig, StorageConfig, StorageKind};
use wharf::session::SessionFactory;
use wharf::{SharedResources, WharfError};

fn factory_with(config: ServerConfig) -> SessionFactory {
    let resources = SharedResources::builder(config)
        .pool(ConnectionPool::in_memory().unwrap())
        .build()
        .unwrap();
    SessionFactory::new(resources)
}

fn quiet_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.logging.console_enabled = false;
    config
}

#[tokio::test]
async fn test_database_storage_round_trip_and_urls() {
    let f = factory_with(quiet_config());
    let session = f.create_internal(false);
    let storage = session.storage();

    storage
        .store_file("public", "avatars/ada.png", b"png".to_vec(), None)
        .await
        .unwrap();
    assert!(storage.file_exists("public", "avatars/ada.png").await.unwrap());
    assert_eq!(
        storage.retrieve_file("public", "avatars/ada.png").await.unwrap(),
        Some(b"png".to_vec())
    );

    let url = storage
        .public_url("public", "avatars/ada.png")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(url.as_str(), "http://localhost:8080/storage/public/avatars/ada.png");
    assert!(storage.public_url("public", "missing.png").await.unwrap().is_none());

    storage
        .store_file("private", "secret.txt", b"s".to_vec(), None)
        .await
        .unwrap();
    assert!(storage.public_url("private", "secret.txt").await.unwrap().is_none());

    assert!(storage.delete_file("public", "avatars/ada.png").await.unwrap());
    assert!(!storage.file_exists("public", "avatars/ada.png").await.unwrap());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_storage_id() {
    let f = factory_with(quiet_config());
    let session = f.create_internal(false);
    let err = session
        .storage()
        .file_exists("nope", "a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, WharfError::StorageNotFound { .. }));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_direct_upload_to_filesystem_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config();
    config.storage.push(StorageConfig {
        id: "files".into(),
        kind: StorageKind::Filesystem,
        root: Some(dir.path().to_path_buf()),
        public_host: "https://cdn.example.com".into(),
        upload_secret: Some("s3cret".into()),
        public: true,
    });
    let f = factory_with(config);

    let session = f.create_internal(false);
    let grant = session
        .storage()
        .create_upload_grant("files", "docs/report.pdf")
        .unwrap();
    assert_eq!(grant.url, "https://cdn.example.com/storage/upload");
    assert!(!session.storage().verify_upload("files", "docs/report.pdf").await.unwrap());

    f.resources()
        .storage()
        .accept_upload(&grant.token, b"%PDF".to_vec())
        .await
        .unwrap();
    assert!(session.storage().verify_upload("files", "docs/report.pdf").await.unwrap());
    assert_eq!(
        std::fs::read(dir.path().join("docs/report.pdf")).unwrap(),
        b"%PDF".to_vec()
    );
    session.close().await.unwrap();
}
