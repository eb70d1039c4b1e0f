//! Union store: many tenants over one shared prefix.
//!
//! CRUD goes to a delegate [`PartitionStore`] rooted at the shared prefix with
//! tenant-qualified keys. Lists and watches do one backend range or one
//! backend watch over the whole prefix, recognise the wanted resource by key
//! shape, and attribute each object to the tenant named in its key. That
//! tenant is exposed to predicates as the virtual field `tenant`.
//!
//! ```text
//!   get_list("widgets", tenant=acme)
//!        │
//!        ▼
//!   range /tenants/ ──► shape filter ──► decode ──► attrs + tenant ──► predicate
//!                                          │
//!                                          └──► uid table (uid → tenant)
//! ```

use super::keys::{KeyMatch, KeyShape, ListScope};
use super::object::{Codec, Resource, ResourceList, Versioner};
use super::partition::PartitionStore;
use super::predicate::{default_attrs, Fields, Labels, SelectionPredicate, TENANT_FIELD};
use super::watch::{EventKind, WatchEvent, WatchSink, WatchStream};
use super::{
    ensure_live, GetOptions, ListOptions, Preconditions, Storage, StorageFuture, UpdateFn,
    ValidateObjectFn,
};
use crate::backend::{BackendWatch, KeyValue, KvBackend, RangeRequest, RawEvent, RawEventKind, WatchBatch, WatchRequest};
use crate::core::config::WatchConfig;
use crate::core::context::RequestContext;
use crate::core::error::StorageResult;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Last observed owner of a UID.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UidOwner {
    tenant: String,
    revision: u64,
}

struct UnionInner {
    delegate: Arc<PartitionStore>,
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec>,
    decoder: Option<Arc<dyn Codec>>,
    shape: KeyShape,
    uids: DashMap<String, UidOwner>,
    stop: CancellationToken,
    stopped: AtomicBool,
    backoff: Duration,
    capacity: usize,
    progress_notify: bool,
}

/// Store multiplexing every tenant of one resource over a shared prefix.
#[derive(Clone)]
pub struct UnionStore {
    inner: Arc<UnionInner>,
}

impl UnionStore {
    /// Create a union store for `resource` over the delegate's prefix.
    pub fn new(delegate: Arc<PartitionStore>, resource: &str, watch: &WatchConfig) -> Self {
        let shape = KeyShape::new(delegate.prefix(), resource);
        Self {
            inner: Arc::new(UnionInner {
                backend: delegate.backend(),
                codec: delegate.codec(),
                delegate,
                decoder: None,
                shape,
                uids: DashMap::new(),
                stop: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                backoff: watch.transient_backoff(),
                capacity: watch.channel_capacity,
                progress_notify: watch.progress_notify,
            }),
        }
    }

    /// Decode watch payloads directly instead of re-reading each object at
    /// its revision.
    ///
    /// Must be called before the store is cloned.
    pub fn with_decoder(mut self, decoder: Arc<dyn Codec>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.decoder = Some(decoder),
            None => warn!("union store already shared, decoder ignored"),
        }
        self
    }

    /// Key shape matched by lists and watches.
    pub fn shape(&self) -> &KeyShape {
        &self.inner.shape
    }

    /// Labels and fields of `obj`, including `tenant` when its UID has been
    /// observed by a list or watch.
    pub fn get_attrs(&self, obj: &Resource) -> (Labels, Fields) {
        let (labels, mut fields) = default_attrs(obj);
        if let Some(tenant) = self.tenant_of_uid(obj.uid()) {
            fields.insert(TENANT_FIELD.to_string(), tenant);
        }
        (labels, fields)
    }

    /// Tenant last observed for `uid`.
    pub fn tenant_of_uid(&self, uid: &str) -> Option<String> {
        if uid.is_empty() {
            return None;
        }
        self.inner.uids.get(uid).map(|owner| owner.tenant.clone())
    }

    /// Number of UIDs in the side table.
    pub fn tracked_uids(&self) -> usize {
        self.inner.uids.len()
    }

    /// Stop every watch and close the backend client. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.cancel();
        self.inner.backend.close();
        info!(prefix = %self.inner.shape.prefix(), resource = %self.inner.shape.resource(), "union store stopped");
    }

    /// Whether [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    async fn list_inner(&self, key: &str, opts: ListOptions) -> StorageResult<ResourceList> {
        let inner = &self.inner;
        let versioner = inner.delegate.versioner();
        let revision = versioner.parse_resource_version(&opts.resource_version)?;
        let scope = ListScope::from_key(inner.shape.resource(), key);
        let res = inner
            .backend
            .range(RangeRequest::prefix(inner.shape.scan_prefix()).at_revision(revision))
            .await?;

        let mut list = ResourceList::default();
        for kv in &res.kvs {
            let Some(m) = inner.shape.matches(&kv.key) else {
                continue;
            };
            if !scope.contains(&m) {
                continue;
            }
            let mut obj = match inner.list_codec().decode(&kv.key, &kv.value) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping undecodable object");
                    continue;
                }
            };
            versioner.update_object(&mut obj, kv.mod_revision);
            inner.remember(obj.uid(), m.tenant, kv.mod_revision);
            if matches_in_tenant(&opts.predicate, &obj, m.tenant) {
                list.items.push(obj);
            }
        }

        let list_revision = if revision > 0 { revision } else { res.revision };
        versioner.update_list(&mut list, list_revision);
        debug!(
            resource = %inner.shape.resource(),
            scanned = res.kvs.len(),
            items = list.items.len(),
            revision = list_revision,
            "union list"
        );
        Ok(list)
    }

    async fn watch_inner(
        &self,
        ctx: &RequestContext,
        key: &str,
        opts: ListOptions,
    ) -> StorageResult<WatchStream> {
        ensure_live(ctx)?;
        let inner = &self.inner;
        let revision = inner
            .delegate
            .versioner()
            .parse_resource_version(&opts.resource_version)?;
        // Without a caller revision, anchor at the store's current revision
        // so a reconnect replays everything written after the watch opened.
        let revision = if revision > 0 {
            revision
        } else {
            inner
                .backend
                .range(RangeRequest::prefix(inner.shape.scan_prefix()).count_only())
                .await?
                .revision
        };
        let progress = opts.progress_notify || inner.progress_notify;
        let worker = UnionWatch {
            inner: Arc::clone(inner),
            ctx: ctx.clone(),
            scope: ListScope::from_key(inner.shape.resource(), key),
            predicate: opts.predicate,
            progress,
            last_revision: revision,
        };
        let backend_watch = inner.backend.watch(worker.request()).await?;

        let (sink, stream) = WatchStream::channel(inner.capacity, ctx.cancellation().child_token());
        tokio::spawn(worker.run(backend_watch, sink));
        Ok(stream)
    }
}

impl UnionInner {
    fn list_codec(&self) -> &dyn Codec {
        self.decoder.as_deref().unwrap_or(self.codec.as_ref())
    }

    /// Record `uid → tenant` unless a newer observation exists.
    fn remember(&self, uid: &str, tenant: &str, revision: u64) {
        if uid.is_empty() {
            return;
        }
        let mut entry = self.uids.entry(uid.to_string()).or_insert_with(|| UidOwner {
            tenant: tenant.to_string(),
            revision,
        });
        if revision >= entry.revision {
            entry.tenant = tenant.to_string();
            entry.revision = revision;
        }
    }

    /// Drop `uid` unless it was re-observed after `revision`.
    fn forget(&self, uid: &str, revision: u64) {
        if uid.is_empty() {
            return;
        }
        self.uids.remove_if(uid, |_, owner| owner.revision <= revision);
    }

    /// Decode a watched value: the injected decoder if any, otherwise an
    /// exact-revision read through the delegate.
    async fn decode_watched(&self, ctx: &RequestContext, kv: &KeyValue, relative: &str) -> Option<Resource> {
        match &self.decoder {
            Some(decoder) => match decoder.decode(&kv.key, &kv.value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping undecodable watch event");
                    None
                }
            },
            None => {
                let opts = GetOptions {
                    ignore_not_found: false,
                    resource_version: kv.mod_revision.to_string(),
                };
                match self.delegate.get(ctx, relative, opts).await {
                    Ok(obj) => Some(obj),
                    Err(e) => {
                        warn!(key = %kv.key, revision = kv.mod_revision, error = %e, "watch re-read failed");
                        None
                    }
                }
            }
        }
    }
}

/// Evaluate `predicate` against `obj` owned by `tenant`.
fn matches_in_tenant(predicate: &SelectionPredicate, obj: &Resource, tenant: &str) -> bool {
    if predicate.is_empty() {
        return true;
    }
    let (labels, mut fields) = default_attrs(obj);
    fields.insert(TENANT_FIELD.to_string(), tenant.to_string());
    predicate.matches_attrs(&labels, &fields)
}

/// Background task driving one union watch.
struct UnionWatch {
    inner: Arc<UnionInner>,
    ctx: RequestContext,
    scope: ListScope,
    predicate: SelectionPredicate,
    progress: bool,
    /// Last revision delivered or acknowledged by a progress notification;
    /// the store revision at open time until then.
    last_revision: u64,
}

impl UnionWatch {
    fn request(&self) -> WatchRequest {
        WatchRequest {
            prefix: self.inner.shape.scan_prefix(),
            start_revision: self.last_revision + 1,
            progress_notify: self.progress,
            prev_kv: true,
        }
    }

    async fn run(mut self, mut watch: BackendWatch, sink: WatchSink) {
        let stop = self.inner.stop.clone();
        loop {
            let item = tokio::select! {
                _ = sink.cancelled() => return,
                _ = stop.cancelled() => return,
                item = watch.recv() => item,
            };
            match item {
                Some(Ok(batch)) => {
                    if !self.deliver(&sink, batch).await {
                        return;
                    }
                }
                Some(Err(e)) if e.is_stream_invalidating() => {
                    debug!(resource = %self.inner.shape.resource(), error = %e, "union watch closed");
                    sink.fail(e).await;
                    return;
                }
                Some(Err(e)) => {
                    debug!(resource = %self.inner.shape.resource(), error = %e, "union watch transient error");
                    drop(watch);
                    match self.reopen(&sink, &stop).await {
                        Some(reopened) => watch = reopened,
                        None => return,
                    }
                }
                None => return,
            }
        }
    }

    /// Sleep the fixed backoff and reopen the backend watch after the last
    /// delivered revision. `None` once the watch must end.
    async fn reopen(&self, sink: &WatchSink, stop: &CancellationToken) -> Option<BackendWatch> {
        loop {
            tokio::select! {
                _ = sink.cancelled() => return None,
                _ = stop.cancelled() => return None,
                _ = tokio::time::sleep(self.inner.backoff) => {}
            }
            match self.inner.backend.watch(self.request()).await {
                Ok(watch) => {
                    debug!(resource = %self.inner.shape.resource(), from = self.last_revision, "union watch reopened");
                    return Some(watch);
                }
                Err(e) if e.is_stream_invalidating() => {
                    sink.fail(e).await;
                    return None;
                }
                Err(e) => {
                    debug!(resource = %self.inner.shape.resource(), error = %e, "union watch reopen failed");
                }
            }
        }
    }

    async fn deliver(&mut self, sink: &WatchSink, batch: WatchBatch) -> bool {
        if batch.is_progress() {
            self.last_revision = self.last_revision.max(batch.revision);
            return !self.progress || sink.send(WatchEvent::bookmark(batch.revision)).await;
        }
        for raw in &batch.events {
            let revision = raw.kv.mod_revision;
            if let Some(event) = self.translate(raw).await {
                if !sink.send(event).await {
                    return false;
                }
            }
            self.last_revision = self.last_revision.max(revision);
        }
        true
    }

    async fn translate(&self, raw: &RawEvent) -> Option<WatchEvent> {
        let m: KeyMatch<'_> = self.inner.shape.matches(&raw.kv.key)?;
        if !self.scope.contains(&m) {
            return None;
        }
        let versioner: Versioner = self.inner.delegate.versioner();
        let revision = raw.kv.mod_revision;

        let object = match raw.kind {
            RawEventKind::Put => {
                let mut obj = self.inner.decode_watched(&self.ctx, &raw.kv, m.relative).await?;
                versioner.update_object(&mut obj, revision);
                self.inner.remember(obj.uid(), m.tenant, revision);
                obj
            }
            RawEventKind::Delete => {
                let prev = match &raw.prev_kv {
                    Some(prev) => self.inner.decode_watched(&self.ctx, prev, m.relative).await,
                    None => None,
                };
                match prev {
                    Some(mut obj) => {
                        versioner.update_object(&mut obj, revision);
                        self.inner.forget(obj.uid(), revision);
                        obj
                    }
                    None => Resource::default(),
                }
            }
        };

        if !matches_in_tenant(&self.predicate, &object, m.tenant) {
            return None;
        }
        let kind = EventKind::from_raw(raw);
        trace!(key = %raw.kv.key, tenant = %m.tenant, kind = kind.as_str(), revision, "union watch event");
        Some(WatchEvent {
            kind,
            object,
            revision,
        })
    }
}

impl Storage for UnionStore {
    fn versioner(&self) -> Versioner {
        self.inner.delegate.versioner()
    }

    fn create<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageFuture<'a, Resource> {
        self.inner.delegate.create(ctx, key, obj, ttl)
    }

    fn get<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: GetOptions,
    ) -> StorageFuture<'a, Resource> {
        self.inner.delegate.get(ctx, key, opts)
    }

    fn get_list<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, ResourceList> {
        Box::pin(async move {
            ensure_live(ctx)?;
            self.list_inner(key, opts).await
        })
    }

    fn watch<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, WatchStream> {
        Box::pin(self.watch_inner(ctx, key, opts))
    }

    fn delete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageFuture<'a, Resource> {
        self.inner.delegate.delete(ctx, key, preconditions, validate)
    }

    fn guaranteed_update<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        update: UpdateFn,
    ) -> StorageFuture<'a, Resource> {
        self.inner
            .delegate
            .guaranteed_update(ctx, key, ignore_not_found, preconditions, update)
    }

    fn count<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        self.inner.delegate.count(key)
    }

    fn readiness_check(&self) -> StorageFuture<'_, ()> {
        self.inner.delegate.readiness_check()
    }

    fn request_watch_progress<'a>(&'a self, ctx: &'a RequestContext) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            ensure_live(ctx)?;
            self.inner.backend.request_progress().await
        })
    }
}
