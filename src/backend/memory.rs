//! In-process revisioned key-value engine.
//!
//! Keeps per-key version chains for exact-revision reads, a per-revision
//! event log for watch replay, and a compaction floor below which history is
//! discarded (the newest version of every live key survives compaction).
//! Every [`MemoryBackend::connect`] yields a [`MemoryClient`] with its own
//! close flag and its own set of watches, mirroring one client connection per
//! partition child.

use super::{
    BackendConnector, BackendFuture, BackendWatch, Guard, KeyValue, KvBackend, PutRequest,
    RangeRequest, RangeResult, RawEvent, RawEventKind, TxnOutcome, WatchBatch, WatchRequest,
};
use crate::core::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Buffer between the engine and a watch consumer.
const WATCH_BUFFER: usize = 256;

/// Watch failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection-level failure; the consumer may reconnect.
    Transient,
    /// The watch fell behind the compaction floor.
    Compaction,
}

/// One entry in a key's version chain. `kv == None` is a tombstone.
#[derive(Debug, Clone)]
struct Version {
    revision: u64,
    kv: Option<KeyValue>,
}

struct Watcher {
    client: u64,
    prefix: String,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<StorageResult<WatchBatch>>,
}

impl Watcher {
    /// Deliver the events this watcher selects. Returns `false` once the
    /// consumer has gone away.
    fn deliver(&self, revision: u64, events: &[RawEvent]) -> bool {
        let selected: Vec<RawEvent> = events
            .iter()
            .filter(|e| e.kv.key.starts_with(&self.prefix))
            .map(|e| {
                let mut e = e.clone();
                if !self.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect();
        if selected.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(Ok(WatchBatch {
                revision,
                events: selected,
            }))
            .is_ok()
    }
}

#[derive(Default)]
struct State {
    revision: u64,
    compaction_floor: u64,
    versions: BTreeMap<String, Vec<Version>>,
    log: BTreeMap<u64, Vec<RawEvent>>,
    expiries: HashMap<String, Instant>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    reinitializing: bool,
}

impl State {
    fn current(&self, key: &str) -> Option<&KeyValue> {
        self.versions.get(key)?.last()?.kv.as_ref()
    }

    fn at(&self, key: &str, revision: u64) -> Option<&KeyValue> {
        self.versions
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.revision <= revision)?
            .kv
            .as_ref()
    }

    fn guard_holds(&self, key: &str, guard: Guard) -> bool {
        match guard {
            Guard::None => true,
            Guard::NotExists => self.current(key).is_none(),
            Guard::ModRevision(rev) => self.current(key).is_some_and(|kv| kv.mod_revision == rev),
        }
    }

    fn apply_put(&mut self, key: &str, value: Bytes) -> KeyValue {
        self.revision += 1;
        let revision = self.revision;
        let prev = self.current(key).cloned();
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
        };
        self.versions.entry(key.to_string()).or_default().push(Version {
            revision,
            kv: Some(kv.clone()),
        });
        self.record(
            revision,
            RawEvent {
                kind: RawEventKind::Put,
                kv: kv.clone(),
                prev_kv: prev,
            },
        );
        kv
    }

    fn apply_delete(&mut self, key: &str) -> Option<KeyValue> {
        let prev = self.current(key).cloned()?;
        self.revision += 1;
        let revision = self.revision;
        self.expiries.remove(key);
        self.versions.entry(key.to_string()).or_default().push(Version {
            revision,
            kv: None,
        });
        self.record(
            revision,
            RawEvent {
                kind: RawEventKind::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: Bytes::new(),
                    create_revision: 0,
                    mod_revision: revision,
                    version: 0,
                },
                prev_kv: Some(prev.clone()),
            },
        );
        Some(prev)
    }

    fn record(&mut self, revision: u64, event: RawEvent) {
        let events = vec![event];
        self.watchers
            .retain(|_, w| w.deliver(revision, &events));
        self.log.insert(revision, events);
    }

    fn expire_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            trace!(key = %key, "ttl expired");
            self.apply_delete(&key);
        }
    }

    fn compact(&mut self, revision: u64) {
        let revision = revision.min(self.revision);
        if revision <= self.compaction_floor {
            return;
        }
        self.compaction_floor = revision;
        self.log = self.log.split_off(&revision);
        for chain in self.versions.values_mut() {
            // Keep the newest version below the floor so reads at the floor
            // still see it, unless it is a tombstone.
            let below = chain.iter().filter(|v| v.revision < revision).count();
            if below > 0 {
                chain.drain(..below - 1);
                if chain.first().is_some_and(|v| v.revision < revision && v.kv.is_none()) {
                    chain.remove(0);
                }
            }
        }
        self.versions.retain(|_, chain| !chain.is_empty());
    }
}

struct Shared {
    state: Mutex<State>,
    next_client: AtomicU64,
    open_clients: AtomicU64,
    range_calls: AtomicU64,
    watch_calls: AtomicU64,
}

/// Shared in-memory store. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store at revision 0.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                next_client: AtomicU64::new(1),
                open_clients: AtomicU64::new(0),
                range_calls: AtomicU64::new(0),
                watch_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Open a client handle.
    pub fn client(&self) -> Arc<MemoryClient> {
        let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed);
        self.shared.open_clients.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryClient {
            id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.shared.state.lock().revision
    }

    /// Current compaction floor.
    pub fn compaction_floor(&self) -> u64 {
        self.shared.state.lock().compaction_floor
    }

    /// Discard history below `revision`.
    pub fn compact(&self, revision: u64) {
        debug!(revision, "compacting memory backend");
        self.shared.state.lock().compact(revision);
    }

    /// Terminate every open watch with an injected error.
    pub fn inject_watch_fault(&self, kind: FaultKind) {
        let mut state = self.shared.state.lock();
        let err = match kind {
            FaultKind::Transient => StorageError::unavailable("injected watch failure"),
            FaultKind::Compaction => StorageError::compacted(state.revision, state.compaction_floor),
        };
        debug!(?kind, watchers = state.watchers.len(), "injecting watch fault");
        for (_, w) in state.watchers.drain() {
            let _ = w.tx.send(Err(err.clone()));
        }
    }

    /// Make reads fail with the "(re)initializing" error while set.
    pub fn set_reinitializing(&self, on: bool) {
        self.shared.state.lock().reinitializing = on;
    }

    /// Delete every key whose TTL has passed.
    pub fn expire_due(&self) {
        self.shared.state.lock().expire_due(Instant::now());
    }

    /// Number of client handles that have not been closed.
    pub fn open_clients(&self) -> u64 {
        self.shared.open_clients.load(Ordering::Relaxed)
    }

    /// Number of watches currently registered.
    pub fn open_watches(&self) -> usize {
        self.shared.state.lock().watchers.len()
    }

    /// Total range calls served.
    pub fn range_calls(&self) -> u64 {
        self.shared.range_calls.load(Ordering::Relaxed)
    }

    /// Total watches opened.
    pub fn watch_calls(&self) -> u64 {
        self.shared.watch_calls.load(Ordering::Relaxed)
    }
}

impl BackendConnector for MemoryBackend {
    fn connect(&self) -> StorageResult<Arc<dyn KvBackend>> {
        let client: Arc<dyn KvBackend> = self.client();
        Ok(client)
    }
}

/// One client connection to a [`MemoryBackend`].
pub struct MemoryClient {
    id: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::unavailable("memory client is closed"));
        }
        Ok(())
    }

    /// Whether [`KvBackend::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn range_sync(&self, req: &RangeRequest) -> StorageResult<RangeResult> {
        self.ensure_open()?;
        self.shared.range_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if state.reinitializing {
            return Err(StorageError::reinitializing("memory backend is loading"));
        }
        state.expire_due(Instant::now());

        let revision = match req.revision {
            0 => state.revision,
            r if r < state.compaction_floor => {
                return Err(StorageError::compacted(r, state.compaction_floor))
            }
            r if r > state.revision => {
                return Err(StorageError::invalid(format!(
                    "revision {} is in the future (current {})",
                    r, state.revision
                )))
            }
            r => r,
        };

        let mut kvs = Vec::new();
        if req.prefix {
            for (key, _) in state
                .versions
                .range(req.key.clone()..)
                .take_while(|(k, _)| k.starts_with(&req.key))
            {
                if let Some(kv) = state.at(key, revision) {
                    kvs.push(kv.clone());
                }
            }
        } else if let Some(kv) = state.at(&req.key, revision) {
            kvs.push(kv.clone());
        }

        let count = kvs.len() as u64;
        if req.count_only {
            kvs.clear();
        }
        Ok(RangeResult {
            kvs,
            count,
            revision: state.revision,
        })
    }

    fn put_sync(&self, req: PutRequest) -> StorageResult<TxnOutcome> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        state.expire_due(Instant::now());
        if !state.guard_holds(&req.key, req.guard) {
            return Ok(TxnOutcome {
                succeeded: false,
                revision: state.revision,
                kv: state.current(&req.key).cloned(),
            });
        }
        let kv = state.apply_put(&req.key, req.value);
        match req.ttl {
            Some(ttl) => {
                state.expiries.insert(req.key, Instant::now() + ttl);
            }
            None => {
                state.expiries.remove(&req.key);
            }
        }
        Ok(TxnOutcome {
            succeeded: true,
            revision: state.revision,
            kv: Some(kv),
        })
    }

    fn delete_sync(&self, key: &str, guard: Guard) -> StorageResult<TxnOutcome> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        state.expire_due(Instant::now());
        if !state.guard_holds(key, guard) {
            return Ok(TxnOutcome {
                succeeded: false,
                revision: state.revision,
                kv: state.current(key).cloned(),
            });
        }
        let prev = state.apply_delete(key);
        Ok(TxnOutcome {
            succeeded: prev.is_some(),
            revision: state.revision,
            kv: prev,
        })
    }

    fn watch_sync(&self, req: WatchRequest) -> StorageResult<BackendWatch> {
        self.ensure_open()?;
        self.shared.watch_calls.fetch_add(1, Ordering::Relaxed);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        {
            let mut state = self.shared.state.lock();
            let watcher = Watcher {
                client: self.id,
                prefix: req.prefix.clone(),
                prev_kv: req.prev_kv,
                tx: raw_tx,
            };

            let compacted = req.start_revision > 0 && req.start_revision < state.compaction_floor;
            if compacted {
                let _ = watcher.tx.send(Err(StorageError::compacted(
                    req.start_revision,
                    state.compaction_floor,
                )));
            } else {
                if req.start_revision > 0 {
                    for (rev, events) in state.log.range(req.start_revision..) {
                        watcher.deliver(*rev, events);
                    }
                }
                let id = state.next_watcher;
                state.next_watcher += 1;
                trace!(id, prefix = %req.prefix, start = req.start_revision, "memory watch registered");
                state.watchers.insert(id, watcher);
            }
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(forward(raw_rx, tx, cancel.clone()));
        Ok(BackendWatch::new(rx, cancel))
    }
}

/// Move items from the engine's unbounded queue to the consumer's bounded
/// channel until either side goes away or an error has been delivered.
async fn forward(
    mut raw: mpsc::UnboundedReceiver<StorageResult<WatchBatch>>,
    tx: mpsc::Sender<StorageResult<WatchBatch>>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = raw.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let terminal = item.is_err();
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() || terminal {
                    return;
                }
            }
        }
    }
}

impl KvBackend for MemoryClient {
    fn range(&self, req: RangeRequest) -> BackendFuture<'_, RangeResult> {
        Box::pin(async move { self.range_sync(&req) })
    }

    fn put(&self, req: PutRequest) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(async move { self.put_sync(req) })
    }

    fn delete(&self, key: String, guard: Guard) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(async move { self.delete_sync(&key, guard) })
    }

    fn watch(&self, req: WatchRequest) -> BackendFuture<'_, BackendWatch> {
        Box::pin(async move { self.watch_sync(req) })
    }

    fn request_progress(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.shared.state.lock();
            let revision = state.revision;
            let client = self.id;
            state.watchers.retain(|_, w| {
                if w.client != client {
                    return true;
                }
                w.tx
                    .send(Ok(WatchBatch {
                        revision,
                        events: Vec::new(),
                    }))
                    .is_ok()
            });
            Ok(())
        })
    }

    fn readiness(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.shared.state.lock().reinitializing {
                return Err(StorageError::reinitializing("memory backend is loading"));
            }
            Ok(())
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.open_clients.fetch_sub(1, Ordering::Relaxed);
        let client = self.id;
        self.shared
            .state
            .lock()
            .watchers
            .retain(|_, w| w.client != client);
        debug!(client, "memory client closed");
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn put(key: &str, value: &str) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            value: Bytes::from(value.to_string()),
            guard: Guard::None,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_and_history() {
        let backend = MemoryBackend::new();
        let client = backend.client();

        let first = client.put(put("/a/x", "1")).await.unwrap();
        assert!(first.succeeded);
        let second = client.put(put("/a/x", "2")).await.unwrap();
        let kv = second.kv.unwrap();
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(kv.version, 2);

        let old = client
            .range(RangeRequest::key("/a/x").at_revision(1))
            .await
            .unwrap();
        assert_eq!(old.kvs[0].value, Bytes::from("1"));
        assert_eq!(old.revision, 2);
    }

    #[tokio::test]
    async fn test_guards() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        client.put(put("/k", "v")).await.unwrap();

        let mut req = put("/k", "again");
        req.guard = Guard::NotExists;
        let outcome = client.put(req).await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.kv.unwrap().mod_revision, 1);

        let stale = client.delete("/k".into(), Guard::ModRevision(7)).await.unwrap();
        assert!(!stale.succeeded);
        let ok = client.delete("/k".into(), Guard::ModRevision(1)).await.unwrap();
        assert!(ok.succeeded);
        assert_eq!(ok.revision, 2);
    }

    #[tokio::test]
    async fn test_prefix_range_stays_inside_prefix() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        client.put(put("/p/a", "1")).await.unwrap();
        client.put(put("/p/b", "2")).await.unwrap();
        client.put(put("/q/a", "3")).await.unwrap();

        let res = client.range(RangeRequest::prefix("/p/")).await.unwrap();
        assert_eq!(res.count, 2);
        let counted = client
            .range(RangeRequest::prefix("/p/").count_only())
            .await
            .unwrap();
        assert_eq!(counted.count, 2);
        assert!(counted.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_and_rejects_old_reads() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        client.put(put("/k", "1")).await.unwrap();
        client.put(put("/k", "2")).await.unwrap();
        client.put(put("/other", "x")).await.unwrap();
        backend.compact(3);

        let err = client
            .range(RangeRequest::key("/k").at_revision(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Compacted { .. }));

        let at_floor = client
            .range(RangeRequest::key("/k").at_revision(3))
            .await
            .unwrap();
        assert_eq!(at_floor.kvs[0].value, Bytes::from("2"));
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        client.put(put("/w/a", "1")).await.unwrap();
        client.put(put("/w/b", "2")).await.unwrap();

        let mut watch = client
            .watch(WatchRequest {
                prefix: "/w/".into(),
                start_revision: 2,
                progress_notify: false,
                prev_kv: true,
            })
            .await
            .unwrap();
        let batch = watch.recv().await.unwrap().unwrap();
        assert_eq!(batch.revision, 2);
        assert_eq!(batch.events[0].kv.key, "/w/b");

        client.delete("/w/a".into(), Guard::None).await.unwrap();
        let batch = watch.recv().await.unwrap().unwrap();
        assert_eq!(batch.events[0].kind, RawEventKind::Delete);
        assert_eq!(batch.events[0].prev_kv.as_ref().unwrap().value, Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        for i in 0..4 {
            client.put(put("/w/a", &i.to_string())).await.unwrap();
        }
        backend.compact(3);
        let mut watch = client
            .watch(WatchRequest {
                prefix: "/w/".into(),
                start_revision: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let err = watch.recv().await.unwrap().unwrap_err();
        assert!(err.is_stream_invalidating());
        assert!(watch.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        let mut req = put("/ttl", "v");
        req.ttl = Some(Duration::from_millis(10));
        client.put(req).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let res = client.range(RangeRequest::key("/ttl")).await.unwrap();
        assert!(res.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_watches_and_rejects_calls() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        let mut watch = client
            .watch(WatchRequest {
                prefix: "/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(backend.open_clients(), 1);
        client.close();
        client.close();
        assert_eq!(backend.open_clients(), 0);
        assert!(watch.recv().await.is_none());
        assert!(client.readiness().await.is_err());
    }

    #[tokio::test]
    async fn test_reinitializing_toggle() {
        let backend = MemoryBackend::new();
        let client = backend.client();
        backend.set_reinitializing(true);
        let err = client.range(RangeRequest::prefix("/")).await.unwrap_err();
        assert!(err.is_reinitializing());
        backend.set_reinitializing(false);
        assert!(client.readiness().await.is_ok());
    }
}
