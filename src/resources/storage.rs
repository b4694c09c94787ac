// src/resources/storage.rs — File storage backends and direct uploads
//
// Direct uploads are two-phase: the server hands out a signed grant, the
// client sends bytes against it, then the server verifies the file landed.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

use crate::db::{timestamp, ConnectionPool};
use crate::infra::config::{ServerConfig, StorageConfig, StorageKind};
use crate::infra::errors::{Result, WharfError};
use crate::infra::paths;
use crate::session::Session;

/// How long an upload grant stays valid.
pub const UPLOAD_GRANT_TTL_SECS: i64 = 10 * 60;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn store(&self, path: &str, bytes: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Result<()>;
    async fn retrieve(&self, path: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, path: &str) -> Result<bool>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Reject empty paths, absolute paths, and `..` segments.
fn validate_path(storage_id: &str, path: &str) -> Result<()> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(WharfError::storage(storage_id, format!("invalid path '{path}'")))
    }
}

/// Files kept in the `cloud_storage` table.
pub struct DatabaseStorage {
    id: String,
    pool: ConnectionPool,
}

impl DatabaseStorage {
    pub fn new(id: impl Into<String>, pool: ConnectionPool) -> Self {
        Self {
            id: id.into(),
            pool,
        }
    }
}

#[async_trait]
impl StorageBackend for DatabaseStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn store(&self, path: &str, bytes: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let id = self.id.clone();
        let path = path.to_string();
        let expires = expires_at.map(timestamp);
        self.pool
            .run(move |c| {
                c.execute(
                    "INSERT INTO cloud_storage (storage_id, path, data, added_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(storage_id, path) DO UPDATE SET
                       data = excluded.data, added_at = excluded.added_at,
                       expires_at = excluded.expires_at",
                    params![id, path, bytes, timestamp(Utc::now()), expires],
                )
            })
            .await?;
        Ok(())
    }

    async fn retrieve(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let id = self.id.clone();
        let path = path.to_string();
        let now = timestamp(Utc::now());
        self.pool
            .run(move |c| {
                c.query_row(
                    "SELECT data FROM cloud_storage
                     WHERE storage_id = ?1 AND path = ?2
                       AND (expires_at IS NULL OR expires_at > ?3)",
                    params![id, path, now],
                    |r| r.get(0),
                )
                .optional()
            })
            .await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let id = self.id.clone();
        let path = path.to_string();
        let n = self
            .pool
            .run(move |c| {
                c.execute(
                    "DELETE FROM cloud_storage WHERE storage_id = ?1 AND path = ?2",
                    params![id, path],
                )
            })
            .await?;
        Ok(n > 0)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let id = self.id.clone();
        let path = path.to_string();
        let now = timestamp(Utc::now());
        self.pool
            .run(move |c| {
                c.query_row(
                    "SELECT COUNT(*) > 0 FROM cloud_storage
                     WHERE storage_id = ?1 AND path = ?2
                       AND (expires_at IS NULL OR expires_at > ?3)",
                    params![id, path, now],
                    |r| r.get(0),
                )
            })
            .await
    }
}

/// Files kept under a directory. Expiration is not tracked.
pub struct FileSystemStorage {
    id: String,
    root: PathBuf,
}

impl FileSystemStorage {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(&self.id, path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn store(&self, path: &str, bytes: Vec<u8>, _expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn retrieve(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }
}

/// Everything a client needs to upload one file directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadGrant {
    pub storage_id: String,
    pub path: String,
    pub url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub max_size: usize,
}

struct StorageEntry {
    backend: Arc<dyn StorageBackend>,
    public_host: Url,
    public: bool,
    secret: Vec<u8>,
}

/// Configured storages by id.
pub struct StorageRegistry {
    entries: HashMap<String, StorageEntry>,
    max_upload_size: usize,
}

impl StorageRegistry {
    pub fn new(max_upload_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_upload_size,
        }
    }

    /// Build the backends listed in config. Database storages need `pool`.
    pub fn from_config(config: &ServerConfig, pool: Option<&ConnectionPool>) -> Result<Self> {
        let mut registry = Self::new(config.max_request_size);
        for storage in &config.storage {
            let backend: Arc<dyn StorageBackend> = match storage.kind {
                StorageKind::Database => match pool {
                    Some(pool) => Arc::new(DatabaseStorage::new(&storage.id, pool.clone())),
                    None => {
                        debug!("Skipping database storage '{}': no database", storage.id);
                        continue;
                    }
                },
                StorageKind::Filesystem => {
                    let root = storage
                        .root
                        .clone()
                        .unwrap_or_else(|| paths::storage_dir().join(&storage.id));
                    Arc::new(FileSystemStorage::new(&storage.id, root))
                }
            };
            registry.register(backend, storage)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>, config: &StorageConfig) -> Result<()> {
        let public_host = Url::parse(&config.public_host).map_err(|e| {
            WharfError::config(format!(
                "storage '{}': invalid public_host '{}': {e}",
                config.id, config.public_host
            ))
        })?;
        let secret = match &config.upload_secret {
            Some(s) => s.as_bytes().to_vec(),
            None => {
                let mut buf = vec![0u8; 32];
                getrandom::getrandom(&mut buf)
                    .map_err(|e| WharfError::config(format!("cannot generate upload secret: {e}")))?;
                buf
            }
        };
        info!("Registered storage '{}' (public: {})", config.id, config.public);
        self.entries.insert(
            backend.id().to_string(),
            StorageEntry {
                backend,
                public_host,
                public: config.public,
                secret,
            },
        );
        Ok(())
    }

    fn entry(&self, storage_id: &str) -> Result<&StorageEntry> {
        self.entries
            .get(storage_id)
            .ok_or_else(|| WharfError::StorageNotFound {
                storage_id: storage_id.to_string(),
            })
    }

    pub fn backend(&self, storage_id: &str) -> Result<&Arc<dyn StorageBackend>> {
        Ok(&self.entry(storage_id)?.backend)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// URL a public file is served from. `None` for private storages.
    pub fn public_url(&self, storage_id: &str, path: &str) -> Result<Option<Url>> {
        let entry = self.entry(storage_id)?;
        if !entry.public {
            return Ok(None);
        }
        validate_path(storage_id, path)?;
        let url = entry
            .public_host
            .join(&format!("storage/{storage_id}/{path}"))
            .map_err(|e| WharfError::storage(storage_id, e))?;
        Ok(Some(url))
    }

    pub fn create_upload_grant(&self, storage_id: &str, path: &str) -> Result<UploadGrant> {
        let entry = self.entry(storage_id)?;
        validate_path(storage_id, path)?;
        let expires_at = Utc::now() + ChronoDuration::seconds(UPLOAD_GRANT_TTL_SECS);
        let payload = format!("{storage_id}\n{path}\n{}", expires_at.timestamp());
        let token = format!("{}.{}", hex::encode(&payload), sign(&entry.secret, &payload)?);
        let url = entry
            .public_host
            .join("storage/upload")
            .map_err(|e| WharfError::storage(storage_id, e))?;

        Ok(UploadGrant {
            storage_id: storage_id.to_string(),
            path: path.to_string(),
            url: url.to_string(),
            token,
            expires_at,
            max_size: self.max_upload_size,
        })
    }

    /// Transport side of a direct upload: check the grant, then store.
    pub async fn accept_upload(&self, token: &str, bytes: Vec<u8>) -> Result<()> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| WharfError::UploadRejected("malformed token".into()))?;
        let payload = hex::decode(encoded)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| WharfError::UploadRejected("malformed token".into()))?;

        let mut parts = payload.splitn(3, '\n');
        let (Some(storage_id), Some(path), Some(expires)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(WharfError::UploadRejected("malformed token".into()));
        };

        let entry = self.entry(storage_id)?;
        if !verify(&entry.secret, &payload, signature)? {
            return Err(WharfError::UploadRejected("bad signature".into()));
        }
        let expires: i64 = expires
            .parse()
            .map_err(|_| WharfError::UploadRejected("malformed token".into()))?;
        if Utc::now().timestamp() > expires {
            return Err(WharfError::UploadRejected("grant expired".into()));
        }
        if bytes.len() > self.max_upload_size {
            return Err(WharfError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_upload_size,
            });
        }

        debug!("Accepted direct upload to {}/{}", storage_id, path);
        entry.backend.store(path, bytes, None).await
    }

    pub async fn verify_upload(&self, storage_id: &str, path: &str) -> Result<bool> {
        self.backend(storage_id)?.exists(path).await
    }
}

type HmacSha256 = Hmac<Sha256>;

fn grant_mac(secret: &[u8], payload: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WharfError::Other(anyhow::anyhow!("invalid upload secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

fn sign(secret: &[u8], payload: &str) -> Result<String> {
    Ok(hex::encode(grant_mac(secret, payload)?.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
fn verify(secret: &[u8], payload: &str, signature: &str) -> Result<bool> {
    let Ok(expected) = hex::decode(signature) else {
        return Ok(false);
    };
    Ok(grant_mac(secret, payload)?.verify_slice(&expected).is_ok())
}

/// Session-scoped view of the configured storages.
pub struct Storage<'s> {
    session: &'s Session,
    registry: &'s StorageRegistry,
}

impl<'s> Storage<'s> {
    pub(crate) fn new(session: &'s Session, registry: &'s StorageRegistry) -> Self {
        Self { session, registry }
    }

    fn backend(&self, storage_id: &str) -> Result<&'s Arc<dyn StorageBackend>> {
        self.session.ensure_open()?;
        self.registry.backend(storage_id)
    }

    pub async fn store_file(
        &self,
        storage_id: &str,
        path: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let backend = self.backend(storage_id)?;
        validate_path(storage_id, path)?;
        backend.store(path, bytes, expires_at).await
    }

    pub async fn retrieve_file(&self, storage_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        self.backend(storage_id)?.retrieve(path).await
    }

    pub async fn delete_file(&self, storage_id: &str, path: &str) -> Result<bool> {
        self.backend(storage_id)?.delete(path).await
    }

    pub async fn file_exists(&self, storage_id: &str, path: &str) -> Result<bool> {
        self.backend(storage_id)?.exists(path).await
    }

    /// Public URL of an existing file; `None` when the storage is private or
    /// the file is missing.
    pub async fn public_url(&self, storage_id: &str, path: &str) -> Result<Option<Url>> {
        self.session.ensure_open()?;
        let Some(url) = self.registry.public_url(storage_id, path)? else {
            return Ok(None);
        };
        if !self.file_exists(storage_id, path).await? {
            return Ok(None);
        }
        Ok(Some(url))
    }

    pub fn create_upload_grant(&self, storage_id: &str, path: &str) -> Result<UploadGrant> {
        self.session.ensure_open()?;
        self.registry.create_upload_grant(storage_id, path)
    }

    pub async fn verify_upload(&self, storage_id: &str, path: &str) -> Result<bool> {
        self.session.ensure_open()?;
        self.registry.verify_upload(storage_id, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_registry(root: &Path, max: usize) -> StorageRegistry {
        let mut config = StorageConfig::database("files", true);
        config.kind = StorageKind::Filesystem;
        config.upload_secret = Some("test-secret".into());
        let mut registry = StorageRegistry::new(max);
        registry
            .register(Arc::new(FileSystemStorage::new("files", root)), &config)
            .unwrap();
        registry
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("s", "a/b.png").is_ok());
        assert!(validate_path("s", "").is_err());
        assert!(validate_path("s", "../etc/passwd").is_err());
        assert!(validate_path("s", "/abs").is_err());
    }

    #[test]
    fn test_grant_signature_is_hmac_sha256() {
        let sig = sign(b"Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(verify(b"Jefe", "what do ya want for nothing?", &sig).unwrap());
        assert!(!verify(b"other", "what do ya want for nothing?", &sig).unwrap());
        assert!(!verify(b"Jefe", "what do ya want for nothing?", "zz").unwrap());
    }

    #[tokio::test]
    async fn test_database_storage_expiry() {
        let pool = ConnectionPool::in_memory().unwrap();
        let storage = DatabaseStorage::new("private", pool);
        storage.store("a.txt", b"hi".to_vec(), None).await.unwrap();
        let past = Utc::now() - ChronoDuration::seconds(5);
        storage.store("old.txt", b"x".to_vec(), Some(past)).await.unwrap();

        assert_eq!(storage.retrieve("a.txt").await.unwrap(), Some(b"hi".to_vec()));
        assert!(!storage.exists("old.txt").await.unwrap());
        assert_eq!(storage.retrieve("old.txt").await.unwrap(), None);
        assert!(storage.delete("a.txt").await.unwrap());
        assert!(!storage.exists("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_grant_flow() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fs_registry(dir.path(), 1024);

        let grant = registry.create_upload_grant("files", "img/cat.png").unwrap();
        assert!(grant.url.ends_with("/storage/upload"));
        assert!(!registry.verify_upload("files", "img/cat.png").await.unwrap());

        registry.accept_upload(&grant.token, b"png".to_vec()).await.unwrap();
        assert!(registry.verify_upload("files", "img/cat.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_rejects_tampered_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fs_registry(dir.path(), 4);
        let grant = registry.create_upload_grant("files", "a.bin").unwrap();

        let mut tampered = grant.token.clone();
        tampered.push('0');
        assert!(matches!(
            registry.accept_upload(&tampered, vec![1]).await,
            Err(WharfError::UploadRejected(_))
        ));
        assert!(matches!(
            registry.accept_upload(&grant.token, vec![0; 5]).await,
            Err(WharfError::PayloadTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_public_url_only_for_public() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = fs_registry(dir.path(), 10);
        let url = registry.public_url("files", "a.png").unwrap().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/storage/files/a.png"
        );

        let private = StorageConfig::database("secret", false);
        registry
            .register(Arc::new(FileSystemStorage::new("secret", dir.path())), &private)
            .unwrap();
        assert!(registry.public_url("secret", "a.png").unwrap().is_none());
        assert!(matches!(
            registry.public_url("nope", "a.png"),
            Err(WharfError::StorageNotFound { .. })
        ));
    }
}
