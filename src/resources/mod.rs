// src/resources/mod.rs — Process-wide resources every session borrows

pub mod cache;
pub mod db;
pub mod messages;
pub mod storage;

use std::sync::Arc;

use tracing::info;

use crate::db::ConnectionPool;
use crate::infra::config::{ConsoleFormat, ServerConfig};
use crate::infra::errors::{Result, WharfError};
use crate::session::log::LogWriter;
use crate::session::AuthenticationHandler;

use cache::{CacheSet, DistributedCache};
use messages::{GlobalMessageBackend, MessageBus};
use storage::StorageRegistry;

/// Shared by every session of a server. Cloning is cheap; all parts are
/// reference-counted and outlive any single session.
#[derive(Clone)]
pub struct SharedResources {
    config: Arc<ServerConfig>,
    pool: Option<ConnectionPool>,
    caches: Arc<CacheSet>,
    storage: Arc<StorageRegistry>,
    messages: MessageBus,
    auth: Option<Arc<dyn AuthenticationHandler>>,
    log_writer: LogWriter,
}

impl std::fmt::Debug for SharedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResources")
            .field("pool", &self.pool)
            .field("storages", &self.storage.ids())
            .field("messages", &self.messages)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl SharedResources {
    pub fn builder(config: ServerConfig) -> SharedResourcesBuilder {
        SharedResourcesBuilder {
            config,
            pool: None,
            distributed_cache: None,
            global_messages: None,
            auth: None,
            storage: None,
        }
    }

    /// Open the configured database (if any) and build everything else
    /// from config alone.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let pool = match &config.database {
            Some(db) => Some(ConnectionPool::open(
                &db.resolved_path(),
                db.pool_size,
                db.busy_timeout(),
            )?),
            None => None,
        };
        let mut builder = Self::builder(config);
        builder.pool = pool;
        builder.build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    pub fn messages(&self) -> &MessageBus {
        &self.messages
    }

    pub fn auth_handler(&self) -> Option<&Arc<dyn AuthenticationHandler>> {
        self.auth.as_ref()
    }

    pub fn log_writer(&self) -> &LogWriter {
        &self.log_writer
    }
}

pub struct SharedResourcesBuilder {
    config: ServerConfig,
    pool: Option<ConnectionPool>,
    distributed_cache: Option<Arc<dyn DistributedCache>>,
    global_messages: Option<Arc<dyn GlobalMessageBackend>>,
    auth: Option<Arc<dyn AuthenticationHandler>>,
    storage: Option<StorageRegistry>,
}

impl SharedResourcesBuilder {
    pub fn pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn distributed_cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.distributed_cache = Some(cache);
        self
    }

    pub fn global_messages(mut self, backend: Arc<dyn GlobalMessageBackend>) -> Self {
        self.global_messages = Some(backend);
        self
    }

    pub fn auth_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.auth = Some(handler);
        self
    }

    /// Use a prepared registry instead of building one from config.
    pub fn storage(mut self, registry: StorageRegistry) -> Self {
        self.storage = Some(registry);
        self
    }

    /// Check the parts against the config and assemble them.
    pub fn build(self) -> Result<SharedResources> {
        let config = self.config;

        if config.logging.persistent_enabled && self.pool.is_none() {
            return Err(WharfError::config(
                "persistent logging is enabled but no database is configured",
            ));
        }

        let (distributed_cache, global_messages) = if config.distributed.enabled {
            match (self.distributed_cache, self.global_messages) {
                (Some(cache), Some(messages)) => (Some(cache), Some(messages)),
                _ => {
                    return Err(WharfError::config(
                        "distributed mode needs both a distributed cache and a global message backend",
                    ))
                }
            }
        } else {
            (None, None)
        };

        let storage = match self.storage {
            Some(registry) => registry,
            None => StorageRegistry::from_config(&config, self.pool.as_ref())?,
        };

        let messages = match global_messages {
            Some(backend) => MessageBus::with_global(backend),
            None => MessageBus::new(),
        };

        let persistent = if config.logging.persistent_enabled {
            self.pool.clone()
        } else {
            None
        };
        let console: Option<ConsoleFormat> = config
            .logging
            .console_enabled
            .then_some(config.logging.console_format);

        info!(
            "Shared resources ready (database: {}, distributed: {}, persistent logs: {})",
            self.pool.is_some(),
            config.distributed.enabled,
            persistent.is_some()
        );

        Ok(SharedResources {
            caches: Arc::new(CacheSet::new(&config.caches, distributed_cache)),
            storage: Arc::new(storage),
            messages,
            auth: self.auth,
            log_writer: LogWriter::new(persistent, console),
            pool: self.pool,
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::cache::MemoryDistributedCache;
    use crate::resources::messages::MemoryMessageBackend;

    #[test]
    fn test_persistent_logging_without_db_fails() {
        let mut config = ServerConfig::default();
        config.logging.persistent_enabled = true;
        let err = SharedResources::builder(config).build().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_distributed_needs_both_backends() {
        let mut config = ServerConfig::default();
        config.distributed.enabled = true;
        let err = SharedResources::builder(config.clone())
            .distributed_cache(Arc::new(MemoryDistributedCache::new()))
            .build()
            .unwrap_err();
        assert!(err.is_configuration());

        let ok = SharedResources::builder(config)
            .distributed_cache(Arc::new(MemoryDistributedCache::new()))
            .global_messages(Arc::new(MemoryMessageBackend::new()))
            .build()
            .unwrap();
        assert!(ok.caches().has_global());
        assert!(ok.messages().has_global());
    }

    #[test]
    fn test_backends_ignored_when_not_distributed() {
        let ok = SharedResources::builder(ServerConfig::default())
            .distributed_cache(Arc::new(MemoryDistributedCache::new()))
            .build()
            .unwrap();
        assert!(!ok.caches().has_global());
    }

    #[test]
    fn test_database_storages_need_pool() {
        let bare = SharedResources::builder(ServerConfig::default())
            .build()
            .unwrap();
        assert!(bare.storage().ids().is_empty());

        let with_db = SharedResources::builder(ServerConfig::default())
            .pool(ConnectionPool::in_memory().unwrap())
            .build()
            .unwrap();
        assert_eq!(with_db.storage().ids(), vec!["private", "public"]);
    }
}
