//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use trellis::backend::MemoryBackend;
use trellis::core::config::{StorageConfig, Strategy, WatchConfig};
use trellis::core::error::{StorageError, StorageResult};
use trellis::ops::StoreMetrics;
use trellis::storage::factory::BackendStoreFactory;
use trellis::storage::object::Resource;
use trellis::storage::watch::{WatchEvent, WatchStream};
use trellis::storage::{BuiltStore, PartitionConfig, StorageRouter, StoreFactory};

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    create_config("[storage]\nresource = \"widgets\"\n")
}

/// Create a configuration file with the given content.
pub fn create_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Storage configuration for `widgets` with the default prefixes.
pub fn storage_config(strategy: Strategy) -> StorageConfig {
    StorageConfig {
        resource: "widgets".to_string(),
        group: "example.dev".to_string(),
        root_prefix: "/registry".to_string(),
        tenant_prefix: "/tenants".to_string(),
        strategy,
    }
}

/// Watch configuration with a short reconnect backoff.
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        transient_backoff_ms: 10,
        channel_capacity: 64,
        progress_notify: false,
    }
}

/// Factory that records every build and every teardown.
pub struct RecordingFactory {
    inner: BackendStoreFactory,
    builds: Mutex<Vec<PartitionConfig>>,
    destroyed: Arc<AtomicUsize>,
    fail_next: AtomicBool,
    build_delay: Option<Duration>,
}

impl RecordingFactory {
    pub fn new(backend: &MemoryBackend) -> Self {
        Self {
            inner: BackendStoreFactory::new(Arc::new(backend.clone()), fast_watch_config()),
            builds: Mutex::new(Vec::new()),
            destroyed: Arc::new(AtomicUsize::new(0)),
            fail_next: AtomicBool::new(false),
            build_delay: None,
        }
    }

    /// Sleep inside every build to widen construction races.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Fail the next build with a construction error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every partition built so far, in order.
    pub fn builds(&self) -> Vec<PartitionConfig> {
        self.builds.lock().clone()
    }

    /// Number of teardown callbacks that ran.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl StoreFactory for RecordingFactory {
    fn build(&self, config: &PartitionConfig) -> StorageResult<BuiltStore> {
        if let Some(delay) = self.build_delay {
            std::thread::sleep(delay);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StorageError::construction("injected build failure"));
        }
        let built = self.inner.build(config)?;
        self.builds.lock().push(config.clone());
        let destroyed = Arc::clone(&self.destroyed);
        let destroy = built.destroy;
        Ok(BuiltStore {
            store: built.store,
            destroy: Box::new(move || {
                destroyed.fetch_add(1, Ordering::SeqCst);
                destroy();
            }),
        })
    }
}

/// A router over a fresh memory backend with a recording factory.
pub struct Harness {
    pub backend: MemoryBackend,
    pub factory: Arc<RecordingFactory>,
    pub metrics: Arc<StoreMetrics>,
    pub router: StorageRouter,
}

impl Harness {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_factory(strategy, |backend| RecordingFactory::new(backend))
    }

    pub fn with_factory(
        strategy: Strategy,
        make: impl FnOnce(&MemoryBackend) -> RecordingFactory,
    ) -> Self {
        let backend = MemoryBackend::new();
        let factory = Arc::new(make(&backend));
        let metrics = Arc::new(StoreMetrics::new());
        let router = StorageRouter::new(
            Arc::clone(&factory) as Arc<dyn StoreFactory>,
            Arc::clone(&metrics),
            storage_config(strategy),
        );
        Self {
            backend,
            factory,
            metrics,
            router,
        }
    }

    /// Physical keys currently stored under `prefix`.
    pub async fn physical_keys(&self, prefix: &str) -> Vec<String> {
        use trellis::backend::{KvBackend, RangeRequest};
        let client = self.backend.client();
        let res = client
            .range(RangeRequest::prefix(prefix))
            .await
            .expect("range");
        client.close();
        res.kvs.into_iter().map(|kv| kv.key).collect()
    }
}

/// A cluster-scoped widget.
pub fn widget(name: &str) -> Resource {
    Resource::new(name, json!({"size": 1}))
}

/// Next event, failing the test after two seconds.
pub async fn next_event(stream: &mut WatchStream) -> Option<WatchEvent> {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for watch event")
}

/// Assert that no event arrives within `wait`.
pub async fn assert_quiet(stream: &mut WatchStream, wait: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(wait, stream.next()).await {
        panic!("unexpected watch event: {:?}", event.kind);
    }
}
