//! Store over one key prefix of a backend.
//!
//! Every relative key `k` is stored at `<prefix>/k`. Lists select every key
//! strictly below `<prefix>/k/`; watches select `<prefix>/k` and everything
//! below it. Writes are compare-and-swap on the key's mod revision.

use super::keys::{children_prefix, join_key};
use super::object::{Codec, Resource, ResourceList, Versioner};
use super::predicate::default_attrs;
use super::watch::{EventKind, WatchEvent, WatchSink, WatchStream};
use super::{
    ensure_live, GetOptions, ListOptions, Preconditions, Storage, StorageFuture, UpdateFn,
    ValidateObjectFn,
};
use crate::backend::{
    Guard, KeyValue, KvBackend, PutRequest, RangeRequest, RawEventKind, WatchRequest,
};
use crate::core::context::RequestContext;
use crate::core::error::{StorageError, StorageResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Storage over `<prefix>/...` of one backend client.
pub struct PartitionStore {
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec>,
    prefix: String,
    versioner: Versioner,
    watch_capacity: usize,
}

impl PartitionStore {
    /// Create a store rooted at `prefix`.
    pub fn new(
        backend: Arc<dyn KvBackend>,
        codec: Arc<dyn Codec>,
        prefix: impl Into<String>,
        watch_capacity: usize,
    ) -> Self {
        Self {
            backend,
            codec,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            versioner: Versioner,
            watch_capacity,
        }
    }

    /// Physical prefix of this store.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Codec used for every read and write.
    pub fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    /// Backend client of this store.
    pub fn backend(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.backend)
    }

    fn decode(&self, kv: &KeyValue) -> StorageResult<Resource> {
        let mut obj = self.codec.decode(&kv.key, &kv.value)?;
        self.versioner.update_object(&mut obj, kv.mod_revision);
        Ok(obj)
    }

    fn encode(&self, obj: &Resource) -> StorageResult<Bytes> {
        let mut stored = obj.clone();
        self.versioner.prepare_for_storage(&mut stored);
        Ok(Bytes::from(self.codec.encode(&stored)?))
    }

    async fn current(&self, full: &str) -> StorageResult<Option<(KeyValue, Resource)>> {
        let res = self.backend.range(RangeRequest::key(full)).await?;
        match res.kvs.into_iter().next() {
            Some(kv) => {
                let obj = self.decode(&kv)?;
                Ok(Some((kv, obj)))
            }
            None => Ok(None),
        }
    }

    async fn create_inner(
        &self,
        key: &str,
        mut obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageResult<Resource> {
        let full = join_key(&self.prefix, key);
        if obj.metadata.uid.is_empty() {
            obj.metadata.uid = uuid::Uuid::new_v4().to_string();
        }
        let outcome = self
            .backend
            .put(PutRequest {
                key: full.clone(),
                value: self.encode(&obj)?,
                guard: Guard::NotExists,
                ttl,
            })
            .await?;
        if !outcome.succeeded {
            return Err(StorageError::key_exists(key));
        }
        self.versioner.update_object(&mut obj, outcome.revision);
        trace!(key = %full, revision = outcome.revision, "created");
        Ok(obj)
    }

    async fn get_inner(&self, key: &str, opts: GetOptions) -> StorageResult<Resource> {
        let full = join_key(&self.prefix, key);
        let revision = self.versioner.parse_resource_version(&opts.resource_version)?;
        let res = self
            .backend
            .range(RangeRequest::key(full).at_revision(revision))
            .await?;
        match res.kvs.first() {
            Some(kv) => self.decode(kv),
            None if opts.ignore_not_found => Ok(Resource::default()),
            None => Err(StorageError::not_found(key)),
        }
    }

    async fn list_inner(&self, key: &str, opts: ListOptions) -> StorageResult<ResourceList> {
        let revision = self.versioner.parse_resource_version(&opts.resource_version)?;
        let res = self
            .backend
            .range(RangeRequest::prefix(children_prefix(&self.prefix, key)).at_revision(revision))
            .await?;

        let mut list = ResourceList::default();
        for kv in &res.kvs {
            let obj = match self.decode(kv) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping undecodable object");
                    continue;
                }
            };
            if opts.predicate.matches(&obj, default_attrs) {
                list.items.push(obj);
            }
        }
        let list_revision = if revision > 0 { revision } else { res.revision };
        self.versioner.update_list(&mut list, list_revision);
        Ok(list)
    }

    async fn delete_inner(
        &self,
        key: &str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageResult<Resource> {
        let full = join_key(&self.prefix, key);
        loop {
            let (kv, current) = self
                .current(&full)
                .await?
                .ok_or_else(|| StorageError::not_found(key))?;
            if let Some(p) = &preconditions {
                p.check(key, &current)?;
            }
            if let Some(validate) = &validate {
                validate(&current)?;
            }
            let outcome = self
                .backend
                .delete(full.clone(), Guard::ModRevision(kv.mod_revision))
                .await?;
            if outcome.succeeded {
                trace!(key = %full, revision = outcome.revision, "deleted");
                return Ok(current);
            }
            if outcome.kv.is_none() {
                return Err(StorageError::not_found(key));
            }
            debug!(key = %full, "delete lost a compare-and-swap race, retrying");
        }
    }

    async fn update_inner(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        mut update: UpdateFn,
    ) -> StorageResult<Resource> {
        let full = join_key(&self.prefix, key);
        loop {
            let (guard, current) = match self.current(&full).await? {
                Some((kv, obj)) => (Guard::ModRevision(kv.mod_revision), obj),
                None if ignore_not_found => (Guard::NotExists, Resource::default()),
                None => return Err(StorageError::not_found(key)),
            };
            if guard != Guard::NotExists {
                if let Some(p) = &preconditions {
                    p.check(key, &current)?;
                }
            }

            let mut desired = update(current.clone())?;
            if desired.metadata.uid.is_empty() {
                desired.metadata.uid = if current.metadata.uid.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    current.metadata.uid.clone()
                };
            } else if !current.metadata.uid.is_empty() && desired.metadata.uid != current.metadata.uid {
                return Err(StorageError::invalid(format!(
                    "metadata.uid is immutable: {} -> {}",
                    current.metadata.uid, desired.metadata.uid
                )));
            }

            desired.metadata.resource_version = current.metadata.resource_version.clone();
            if guard != Guard::NotExists && desired == current {
                return Ok(current);
            }

            let outcome = self
                .backend
                .put(PutRequest {
                    key: full.clone(),
                    value: self.encode(&desired)?,
                    guard,
                    ttl: None,
                })
                .await?;
            if outcome.succeeded {
                self.versioner.update_object(&mut desired, outcome.revision);
                trace!(key = %full, revision = outcome.revision, "updated");
                return Ok(desired);
            }
            debug!(key = %full, "update lost a compare-and-swap race, retrying");
        }
    }

    async fn watch_inner(
        &self,
        ctx: &RequestContext,
        key: &str,
        opts: ListOptions,
    ) -> StorageResult<WatchStream> {
        ensure_live(ctx)?;
        let revision = self.versioner.parse_resource_version(&opts.resource_version)?;
        let full = join_key(&self.prefix, key);
        let watch = self
            .backend
            .watch(WatchRequest {
                prefix: full.clone(),
                start_revision: if revision > 0 { revision + 1 } else { 0 },
                progress_notify: opts.progress_notify,
                prev_kv: true,
            })
            .await?;

        let (sink, stream) =
            WatchStream::channel(self.watch_capacity, ctx.cancellation().child_token());
        let worker = PartitionWatch {
            codec: Arc::clone(&self.codec),
            versioner: self.versioner,
            full,
            opts,
        };
        tokio::spawn(worker.run(watch, sink));
        Ok(stream)
    }
}

/// Translates one backend watch into watch events.
struct PartitionWatch {
    codec: Arc<dyn Codec>,
    versioner: Versioner,
    full: String,
    opts: ListOptions,
}

impl PartitionWatch {
    fn selects(&self, key: &str) -> bool {
        key == self.full
            || key
                .strip_prefix(self.full.as_str())
                .is_some_and(|rest| rest.starts_with('/') || self.full.ends_with('/'))
    }

    async fn run(self, mut watch: crate::backend::BackendWatch, sink: WatchSink) {
        loop {
            let item = tokio::select! {
                _ = sink.cancelled() => return,
                item = watch.recv() => item,
            };
            let batch = match item {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    debug!(prefix = %self.full, error = %e, "partition watch ended");
                    sink.fail(e).await;
                    return;
                }
                None => return,
            };

            if batch.is_progress() {
                if self.opts.progress_notify && !sink.send(WatchEvent::bookmark(batch.revision)).await {
                    return;
                }
                continue;
            }

            for raw in &batch.events {
                if !self.selects(&raw.kv.key) {
                    continue;
                }
                let kind = EventKind::from_raw(raw);
                let decoded = match raw.kind {
                    RawEventKind::Put => self.codec.decode(&raw.kv.key, &raw.kv.value),
                    RawEventKind::Delete => match &raw.prev_kv {
                        Some(prev) => self.codec.decode(&prev.key, &prev.value),
                        None => Ok(Resource::default()),
                    },
                };
                let mut object = match decoded {
                    Ok(obj) => obj,
                    Err(e) => {
                        warn!(key = %raw.kv.key, error = %e, "skipping undecodable watch event");
                        continue;
                    }
                };
                if !object.is_zero() {
                    self.versioner.update_object(&mut object, raw.kv.mod_revision);
                }
                if !self.opts.predicate.matches(&object, default_attrs) {
                    continue;
                }
                let event = WatchEvent {
                    kind,
                    object,
                    revision: raw.kv.mod_revision,
                };
                if !sink.send(event).await {
                    return;
                }
            }
        }
    }
}

impl Storage for PartitionStore {
    fn versioner(&self) -> Versioner {
        self.versioner
    }

    fn create<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        key: &'a str,
        obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(self.create_inner(key, obj, ttl))
    }

    fn get<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        key: &'a str,
        opts: GetOptions,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(self.get_inner(key, opts))
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
        _ctx: &'a RequestContext,
        key: &'a str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(self.delete_inner(key, preconditions, validate))
    }

    fn guaranteed_update<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        key: &'a str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        update: UpdateFn,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(self.update_inner(key, ignore_not_found, preconditions, update))
    }

    fn count<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let res = self
                .backend
                .range(RangeRequest::prefix(children_prefix(&self.prefix, key)).count_only())
                .await?;
            Ok(res.count)
        })
    }

    fn readiness_check(&self) -> StorageFuture<'_, ()> {
        self.backend.readiness()
    }

    fn request_watch_progress<'a>(&'a self, _ctx: &'a RequestContext) -> StorageFuture<'a, ()> {
        self.backend.request_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::storage::object::JsonCodec;
    use crate::storage::predicate::{LabelSelector, SelectionPredicate};
    use serde_json::json;

    fn store(backend: &MemoryBackend) -> PartitionStore {
        PartitionStore::new(backend.client(), Arc::new(JsonCodec), "/registry", 16)
    }

    #[tokio::test]
    async fn test_create_assigns_uid_and_version() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();

        let created = store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({"size": 1})), None)
            .await
            .unwrap();
        assert!(!created.uid().is_empty());
        assert_eq!(created.metadata.resource_version, "1");

        let err = store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyExists { .. }));
    }

    #[tokio::test]
    async fn test_get_ignore_not_found_and_exact_revision() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();

        let missing = store
            .get(
                &ctx,
                "widgets/nope",
                GetOptions {
                    ignore_not_found: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(missing.is_zero());

        store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({"v": 1})), None)
            .await
            .unwrap();
        store
            .guaranteed_update(
                &ctx,
                "widgets/w1",
                false,
                None,
                Box::new(|mut obj: Resource| {
                    obj.spec = json!({"v": 2});
                    Ok(obj)
                }),
            )
            .await
            .unwrap();

        let old = store
            .get(
                &ctx,
                "widgets/w1",
                GetOptions {
                    resource_version: "1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(old.spec, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix_and_predicate() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();
        for (key, app) in [("widgets/a", "web"), ("widgets/b", "db"), ("widgetsextra/c", "web")] {
            let name = key.rsplit('/').next().unwrap();
            store
                .create(&ctx, key, Resource::new(name, json!({})).with_label("app", app), None)
                .await
                .unwrap();
        }

        let list = store
            .get_list(
                &ctx,
                "widgets",
                ListOptions {
                    predicate: SelectionPredicate {
                        label: LabelSelector::parse("app=web").unwrap(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].metadata.name, "a");
        assert_eq!(list.resource_version, "3");
    }

    #[tokio::test]
    async fn test_update_keeps_uid_and_rejects_change() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();
        let created = store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({})), None)
            .await
            .unwrap();

        let updated = store
            .guaranteed_update(
                &ctx,
                "widgets/w1",
                false,
                None,
                Box::new(|mut obj: Resource| {
                    obj.metadata.uid.clear();
                    obj.spec = json!({"x": 1});
                    Ok(obj)
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.uid(), created.uid());

        let err = store
            .guaranteed_update(
                &ctx,
                "widgets/w1",
                false,
                None,
                Box::new(|obj: Resource| Ok(obj.with_uid("other"))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidObject { .. }));
    }

    #[tokio::test]
    async fn test_update_ignore_not_found_creates() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();
        let obj = store
            .guaranteed_update(
                &ctx,
                "widgets/new",
                true,
                None,
                Box::new(|_: Resource| Ok(Resource::new("new", json!({})))),
            )
            .await
            .unwrap();
        assert!(!obj.uid().is_empty());
        assert_eq!(store.count("widgets").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_checks_preconditions_and_validation() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();
        let created = store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({})), None)
            .await
            .unwrap();

        let err = store
            .delete(&ctx, "widgets/w1", Some(Preconditions::uid("wrong")), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .delete(
                &ctx,
                "widgets/w1",
                None,
                Some(Box::new(|_: &Resource| Err(StorageError::invalid("finalizers pending")))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidObject { .. }));

        let deleted = store
            .delete(&ctx, "widgets/w1", Some(Preconditions::uid(created.uid())), None)
            .await
            .unwrap();
        assert_eq!(deleted.uid(), created.uid());
        assert!(store
            .delete(&ctx, "widgets/w1", None, None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_watch_events() {
        let backend = MemoryBackend::new();
        let store = store(&backend);
        let ctx = RequestContext::new();
        let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

        store
            .create(&ctx, "widgets/w1", Resource::new("w1", json!({})), None)
            .await
            .unwrap();
        store
            .create(&ctx, "widgetsextra/w1", Resource::new("w1", json!({})), None)
            .await
            .unwrap();
        store.delete(&ctx, "widgets/w1", None, None).await.unwrap();

        let added = stream.next().await.unwrap();
        assert!(matches!(added.kind, EventKind::Added));
        assert_eq!(added.revision, 1);
        let deleted = stream.next().await.unwrap();
        assert!(matches!(deleted.kind, EventKind::Deleted));
        assert_eq!(deleted.object.metadata.name, "w1");
        assert_eq!(deleted.revision, 3);
    }
}
