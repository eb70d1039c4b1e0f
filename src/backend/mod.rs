//! Backing store clients.
//!
//! A [`KvBackend`] is one client connection to a revisioned key-value store:
//! every mutation advances a single global revision, reads may target a past
//! revision until it is compacted, and prefix watches replay history from a
//! start revision. Two implementations exist:
//!
//! - [`memory`] - in-process MVCC engine, used by `mode = "memory"` and tests
//! - [`etcd`] - etcd v3 over gRPC (feature `etcd`)
//!
//! Each partition child owns its own client, obtained from a
//! [`BackendConnector`], and closes it when destroyed.

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
#[cfg(feature = "etcd")]
pub mod tls;

use crate::core::error::StorageResult;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::{FaultKind, MemoryBackend, MemoryClient};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// A stored key-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Physical key.
    pub key: String,
    /// Stored bytes.
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
    /// Number of modifications since creation.
    pub version: u64,
}

/// Range read.
#[derive(Debug, Clone, Default)]
pub struct RangeRequest {
    /// Key, or key prefix when `prefix` is set.
    pub key: String,
    /// Select every key starting with `key`.
    pub prefix: bool,
    /// Read at this revision; 0 reads the latest.
    pub revision: u64,
    /// Return only the count.
    pub count_only: bool,
}

impl RangeRequest {
    /// Point read of one key at the latest revision.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Prefix scan at the latest revision.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            key: prefix.into(),
            prefix: true,
            ..Default::default()
        }
    }

    /// Read at an exact revision.
    pub fn at_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Count instead of returning records.
    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }
}

/// Result of a range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Matching records, in key order. Empty for count-only reads.
    pub kvs: Vec<KeyValue>,
    /// Number of matching keys.
    pub count: u64,
    /// Store revision the read was served at.
    pub revision: u64,
}

/// Compare guard on a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Guard {
    /// Unconditional.
    #[default]
    None,
    /// Key must not exist.
    NotExists,
    /// Key must exist with exactly this mod revision.
    ModRevision(u64),
}

/// Put request.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    pub value: Bytes,
    pub guard: Guard,
    /// Expire the key after this long.
    pub ttl: Option<Duration>,
}

/// Outcome of a guarded write.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    /// Whether the guard held and the write was applied.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: u64,
    /// On success: the written record (put) or the removed record (delete).
    /// On failure: the current record, if any.
    pub kv: Option<KeyValue>,
}

/// Watch request over a key prefix.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub prefix: String,
    /// First revision to deliver; 0 starts after the current revision.
    pub start_revision: u64,
    /// Emit empty batches as progress notifications.
    pub progress_notify: bool,
    /// Include the previous record on events.
    pub prev_kv: bool,
}

/// Raw event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// One raw change observed by a backend watch.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// Record after the change. For deletes only the key and mod revision
    /// are meaningful.
    pub kv: KeyValue,
    /// Record before the change, when requested and available.
    pub prev_kv: Option<KeyValue>,
}

/// Batch of events sharing one response header.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    /// Header revision.
    pub revision: u64,
    pub events: Vec<RawEvent>,
}

impl WatchBatch {
    /// Whether this is a progress notification.
    pub fn is_progress(&self) -> bool {
        self.events.is_empty()
    }
}

/// Live backend watch.
///
/// Delivers batches in revision order. An `Err` item is terminal; the
/// channel closes after it. Dropping the handle cancels the watch.
pub struct BackendWatch {
    events: mpsc::Receiver<StorageResult<WatchBatch>>,
    cancel: CancellationToken,
}

impl BackendWatch {
    /// Wrap a receiver and the token that stops its producer.
    pub fn new(
        events: mpsc::Receiver<StorageResult<WatchBatch>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { events, cancel }
    }

    /// Receive the next batch. `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<StorageResult<WatchBatch>> {
        self.events.recv().await
    }
}

impl Drop for BackendWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Client of a revisioned key-value store.
pub trait KvBackend: Send + Sync {
    /// Read one key or a prefix.
    fn range(&self, req: RangeRequest) -> BackendFuture<'_, RangeResult>;

    /// Guarded put.
    fn put(&self, req: PutRequest) -> BackendFuture<'_, TxnOutcome>;

    /// Guarded delete of one key.
    fn delete(&self, key: String, guard: Guard) -> BackendFuture<'_, TxnOutcome>;

    /// Open a prefix watch.
    fn watch(&self, req: WatchRequest) -> BackendFuture<'_, BackendWatch>;

    /// Ask every open watch of this client to emit a progress notification.
    fn request_progress(&self) -> BackendFuture<'_, ()>;

    /// Probe that the store is reachable and serving.
    fn readiness(&self) -> BackendFuture<'_, ()>;

    /// Close the client. Idempotent.
    fn close(&self);

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Builds client connections. Construction does no network I/O.
pub trait BackendConnector: Send + Sync {
    /// Open a new client handle.
    fn connect(&self) -> StorageResult<Arc<dyn KvBackend>>;
}
