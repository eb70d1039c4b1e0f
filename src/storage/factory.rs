//! Child store construction.
//!
//! The router never builds stores itself; it describes the partition it
//! needs and a [`StoreFactory`] returns the store plus the callback that tears
//! it down. Construction is synchronous and does no network I/O.

use super::object::{Codec, JsonCodec};
use super::partition::PartitionStore;
use super::union::UnionStore;
use super::Storage;
use crate::backend::{BackendConnector, MemoryBackend};
use crate::core::config::{BackendMode, Config, WatchConfig};
use crate::core::error::{StorageError, StorageResult};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Teardown callback of a child store. Runs exactly once.
pub type DestroyFn = Box<dyn FnOnce() + Send + Sync>;

/// Which partition a child serves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKind {
    /// The root partition (no tenant).
    Root,
    /// A partition dedicated to one tenant.
    Dedicated(String),
    /// The shared partition serving every tenant.
    Union,
}

impl PartitionKind {
    /// Tenant label used in metrics: empty for root, `*` for the union.
    pub fn tenant_label(&self) -> &str {
        match self {
            Self::Root => "",
            Self::Dedicated(tenant) => tenant,
            Self::Union => "*",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Dedicated(tenant) => write!(f, "tenant:{}", tenant),
            Self::Union => write!(f, "union"),
        }
    }
}

/// Description of the child store the router needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    pub kind: PartitionKind,
    /// Resource served (e.g. `widgets`).
    pub resource: String,
    /// Physical key prefix of the partition.
    pub prefix: String,
}

/// A built child store and its teardown.
pub struct BuiltStore {
    pub store: Arc<dyn Storage>,
    pub destroy: DestroyFn,
}

impl fmt::Debug for BuiltStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltStore").finish_non_exhaustive()
    }
}

/// Builds child stores for the router.
pub trait StoreFactory: Send + Sync {
    /// Build the store described by `config`. Errors are construction
    /// errors and are not cached by the caller.
    fn build(&self, config: &PartitionConfig) -> StorageResult<BuiltStore>;
}

/// Factory opening one backend client per child.
pub struct BackendStoreFactory {
    connector: Arc<dyn BackendConnector>,
    codec: Arc<dyn Codec>,
    watch: WatchConfig,
}

impl BackendStoreFactory {
    /// Create a factory over `connector` with the JSON codec.
    pub fn new(connector: Arc<dyn BackendConnector>, watch: WatchConfig) -> Self {
        Self {
            connector,
            codec: Arc::new(JsonCodec),
            watch,
        }
    }

    /// Replace the codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build a factory for the configured backend mode.
    pub fn from_config(config: &Config) -> StorageResult<Self> {
        let connector: Arc<dyn BackendConnector> = match config.backend.mode {
            BackendMode::Memory => Arc::new(MemoryBackend::new()),
            BackendMode::Etcd => etcd_connector(config)?,
        };
        Ok(Self::new(connector, config.watch.clone()))
    }
}

#[cfg(feature = "etcd")]
fn etcd_connector(config: &Config) -> StorageResult<Arc<dyn BackendConnector>> {
    Ok(Arc::new(crate::backend::etcd::EtcdConnector::from_config(
        &config.backend,
    )?))
}

#[cfg(not(feature = "etcd"))]
fn etcd_connector(_config: &Config) -> StorageResult<Arc<dyn BackendConnector>> {
    Err(StorageError::construction(
        "backend mode \"etcd\" requires the etcd feature",
    ))
}

impl StoreFactory for BackendStoreFactory {
    fn build(&self, config: &PartitionConfig) -> StorageResult<BuiltStore> {
        if config.prefix.is_empty() {
            return Err(StorageError::construction(format!(
                "empty key prefix for {} partition",
                config.kind
            )));
        }
        let backend = self.connector.connect()?;
        debug!(
            partition = %config.kind,
            resource = %config.resource,
            prefix = %config.prefix,
            backend = backend.name(),
            "building child store"
        );
        let partition = Arc::new(PartitionStore::new(
            Arc::clone(&backend),
            Arc::clone(&self.codec),
            config.prefix.clone(),
            self.watch.channel_capacity,
        ));

        match config.kind {
            PartitionKind::Union => {
                let union = UnionStore::new(partition, &config.resource, &self.watch)
                    .with_decoder(Arc::clone(&self.codec));
                let handle = union.clone();
                Ok(BuiltStore {
                    store: Arc::new(union),
                    destroy: Box::new(move || handle.stop()),
                })
            }
            PartitionKind::Root | PartitionKind::Dedicated(_) => Ok(BuiltStore {
                store: partition,
                destroy: Box::new(move || backend.close()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::RequestContext;
    use crate::storage::object::Resource;
    use serde_json::json;

    fn factory(backend: &MemoryBackend) -> BackendStoreFactory {
        BackendStoreFactory::new(Arc::new(backend.clone()), WatchConfig::default())
    }

    #[test]
    fn test_tenant_label() {
        assert_eq!(PartitionKind::Root.tenant_label(), "");
        assert_eq!(PartitionKind::Dedicated("acme".into()).tenant_label(), "acme");
        assert_eq!(PartitionKind::Union.tenant_label(), "*");
    }

    #[tokio::test]
    async fn test_destroy_closes_client() {
        let backend = MemoryBackend::new();
        let built = factory(&backend)
            .build(&PartitionConfig {
                kind: PartitionKind::Root,
                resource: "widgets".into(),
                prefix: "/registry".into(),
            })
            .unwrap();
        assert_eq!(backend.open_clients(), 1);

        let ctx = RequestContext::new();
        built
            .store
            .create(&ctx, "widgets/a", Resource::new("a", json!({})), None)
            .await
            .unwrap();

        (built.destroy)();
        assert_eq!(backend.open_clients(), 0);
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let backend = MemoryBackend::new();
        let err = factory(&backend)
            .build(&PartitionConfig {
                kind: PartitionKind::Union,
                resource: "widgets".into(),
                prefix: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Construction { .. }));
        assert_eq!(backend.open_clients(), 0);
    }
}
