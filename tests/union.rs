//! Tests for the shared-partition union store.

mod common;

use bytes::Bytes;
use common::{assert_quiet, fast_watch_config, next_event, widget};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis::backend::{
    BackendFuture, BackendWatch, FaultKind, Guard, KeyValue, KvBackend, MemoryBackend,
    PutRequest, RangeRequest, RangeResult, RawEvent, RawEventKind, TxnOutcome, WatchBatch,
    WatchRequest,
};
use trellis::core::context::RequestContext;
use trellis::core::error::{StorageError, StorageResult};
use trellis::storage::object::{Codec, JsonCodec, Resource};
use trellis::storage::partition::PartitionStore;
use trellis::storage::predicate::{SelectionPredicate, TENANT_FIELD};
use trellis::storage::union::UnionStore;
use trellis::storage::watch::EventKind;
use trellis::storage::{ListOptions, Storage};

fn union_over(backend: Arc<dyn KvBackend>, resource: &str) -> UnionStore {
    let delegate = Arc::new(PartitionStore::new(
        backend,
        Arc::new(JsonCodec),
        "/tenants",
        64,
    ));
    UnionStore::new(delegate, resource, &fast_watch_config())
}

fn union(backend: &MemoryBackend, resource: &str) -> UnionStore {
    union_over(backend.client(), resource).with_decoder(Arc::new(JsonCodec))
}

async fn put_raw(backend: &MemoryBackend, key: &str, obj: &Resource) {
    let client = backend.client();
    client
        .put(PutRequest {
            key: key.to_string(),
            value: Bytes::from(JsonCodec.encode(obj).unwrap()),
            guard: Guard::None,
            ttl: None,
        })
        .await
        .unwrap();
    client.close();
}

fn tenant_predicate(tenant: &str) -> SelectionPredicate {
    SelectionPredicate::everything().with_tenant(tenant)
}

// ============================================================================
// Scripted Backend
// ============================================================================

/// Backend whose watches are fed by the test.
#[derive(Default)]
struct ScriptedBackend {
    watches: Mutex<Vec<(WatchRequest, mpsc::Sender<StorageResult<WatchBatch>>)>>,
}

impl ScriptedBackend {
    fn requests(&self) -> Vec<WatchRequest> {
        self.watches.lock().iter().map(|(req, _)| req.clone()).collect()
    }

    fn sender(&self, index: usize) -> mpsc::Sender<StorageResult<WatchBatch>> {
        self.watches.lock()[index].1.clone()
    }

    async fn wait_for_watches(&self, count: usize) {
        for _ in 0..200 {
            if self.watches.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} backend watches", count);
    }
}

impl KvBackend for ScriptedBackend {
    fn range(&self, _req: RangeRequest) -> BackendFuture<'_, RangeResult> {
        Box::pin(async { Ok(RangeResult::default()) })
    }

    fn put(&self, _req: PutRequest) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(async { Err(StorageError::internal("scripted backend is read-only")) })
    }

    fn delete(&self, _key: String, _guard: Guard) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(async { Err(StorageError::internal("scripted backend is read-only")) })
    }

    fn watch(&self, req: WatchRequest) -> BackendFuture<'_, BackendWatch> {
        let (tx, rx) = mpsc::channel(16);
        self.watches.lock().push((req, tx));
        Box::pin(async move { Ok(BackendWatch::new(rx, CancellationToken::new())) })
    }

    fn request_progress(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn readiness(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {}

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn put_event(key: &str, obj: &Resource, create: u64, modified: u64) -> RawEvent {
    RawEvent {
        kind: RawEventKind::Put,
        kv: KeyValue {
            key: key.to_string(),
            value: Bytes::from(JsonCodec.encode(obj).unwrap()),
            create_revision: create,
            mod_revision: modified,
            version: 1,
        },
        prev_kv: None,
    }
}

fn delete_event(key: &str, revision: u64) -> RawEvent {
    RawEvent {
        kind: RawEventKind::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: Bytes::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
        },
        prev_kv: None,
    }
}

// ============================================================================
// List
// ============================================================================

#[tokio::test]
async fn list_skips_similarly_named_resources() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");

    put_raw(&backend, "/tenants/acme/widgets/w1", &widget("w1")).await;
    put_raw(&backend, "/tenants/acme/widgetsextra/x1", &widget("x1")).await;
    put_raw(&backend, "/tenants/acme/namespaces/ns1/widgets/w2", &widget("w2")).await;
    put_raw(&backend, "/tenants/acme/namespaces/ns1/widgetsextra/x2", &widget("x2")).await;
    put_raw(&backend, "/tenants/acme/gadgets/g1", &widget("g1")).await;

    let list = store
        .get_list(&RequestContext::new(), "widgets", ListOptions::default())
        .await
        .unwrap();
    let names: Vec<&str> = list.items.iter().map(|o| o.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["w2", "w1"]);
}

#[tokio::test]
async fn list_uses_one_range_scan() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    for tenant in ["alpha", "beta", "gamma"] {
        put_raw(&backend, &format!("/tenants/{}/widgets/w", tenant), &widget("w")).await;
    }

    let before = backend.range_calls();
    let list = store
        .get_list(&RequestContext::new(), "widgets", ListOptions {
            predicate: tenant_predicate("beta"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(backend.range_calls() - before, 1);
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.resource_version, "3");
}

#[tokio::test]
async fn list_records_tenants_of_scanned_objects() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let obj = widget("w1").with_uid("u-acme");
    put_raw(&backend, "/tenants/acme/widgets/w1", &obj).await;

    assert!(store.get_attrs(&obj).1.get(TENANT_FIELD).is_none());
    store
        .get_list(&RequestContext::new(), "widgets", ListOptions::default())
        .await
        .unwrap();
    let (_, fields) = store.get_attrs(&obj);
    assert_eq!(fields.get(TENANT_FIELD).map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn list_skips_undecodable_items() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    put_raw(&backend, "/tenants/acme/widgets/w1", &widget("w1")).await;
    let client = backend.client();
    client
        .put(PutRequest {
            key: "/tenants/acme/widgets/broken".into(),
            value: Bytes::from_static(b"{not json"),
            guard: Guard::None,
            ttl: None,
        })
        .await
        .unwrap();

    let list = store
        .get_list(&RequestContext::new(), "widgets", ListOptions::default())
        .await
        .unwrap();
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.items[0].metadata.name, "w1");
}

#[tokio::test]
async fn list_at_resource_version_reads_snapshot() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    put_raw(&backend, "/tenants/acme/widgets/w1", &widget("w1")).await;
    put_raw(&backend, "/tenants/acme/widgets/w2", &widget("w2")).await;

    let list = store
        .get_list(&RequestContext::new(), "widgets", ListOptions {
            resource_version: "1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.resource_version, "1");
}

#[tokio::test]
async fn namespaces_resource_matches_only_namespace_objects() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "namespaces");
    put_raw(&backend, "/tenants/acme/namespaces/ns1", &widget("ns1")).await;
    put_raw(&backend, "/tenants/acme/namespaces/ns1/widgets/w1", &widget("w1")).await;
    put_raw(&backend, "/tenants/beta/namespaces/ns2", &widget("ns2")).await;

    let list = store
        .get_list(&RequestContext::new(), "namespaces", ListOptions {
            predicate: tenant_predicate("acme"),
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<&str> = list.items.iter().map(|o| o.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["ns1"]);
}

#[tokio::test]
async fn list_honours_cancellation() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    ctx.cancel();
    let err = store
        .get_list(&ctx, "widgets", ListOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled { .. }));
}

// ============================================================================
// CRUD Delegation
// ============================================================================

#[tokio::test]
async fn crud_goes_to_qualified_keys() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    assert_eq!(store.count("acme/widgets").await.unwrap(), 1);
    let deleted = store
        .delete(&ctx, "acme/widgets/w1", None, None)
        .await
        .unwrap();
    assert_eq!(deleted.metadata.name, "w1");
    assert_eq!(store.count("acme/widgets").await.unwrap(), 0);
    store.readiness_check().await.unwrap();
}

// ============================================================================
// Watch
// ============================================================================

#[tokio::test]
async fn watch_added_records_uid_tenant() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1").with_uid("u1"), None)
        .await
        .unwrap();

    let event = next_event(&mut stream).await.unwrap();
    assert!(matches!(event.kind, EventKind::Added));
    assert_eq!(event.object.uid(), "u1");
    assert_eq!(event.object.metadata.resource_version, "1");
    assert_eq!(store.tenant_of_uid("u1").as_deref(), Some("acme"));

    let probe = Resource::new("anything", json!(null)).with_uid("u1");
    let (_, fields) = store.get_attrs(&probe);
    assert_eq!(fields.get(TENANT_FIELD).map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn watch_reports_modified_and_deleted() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1").with_uid("u1"), None)
        .await
        .unwrap();
    store
        .guaranteed_update(
            &ctx,
            "acme/widgets/w1",
            false,
            None,
            Box::new(|mut obj: Resource| {
                obj.spec = json!({"size": 2});
                Ok(obj)
            }),
        )
        .await
        .unwrap();
    store
        .delete(&ctx, "acme/widgets/w1", None, None)
        .await
        .unwrap();

    let added = next_event(&mut stream).await.unwrap();
    let modified = next_event(&mut stream).await.unwrap();
    let deleted = next_event(&mut stream).await.unwrap();
    assert!(matches!(added.kind, EventKind::Added));
    assert!(matches!(modified.kind, EventKind::Modified));
    assert_eq!(modified.object.spec, json!({"size": 2}));
    assert!(matches!(deleted.kind, EventKind::Deleted));
    assert_eq!(deleted.object.uid(), "u1");
    assert_eq!(deleted.revision, 3);
    assert_eq!(store.tenant_of_uid("u1"), None);
}

#[tokio::test]
async fn watch_filters_by_injected_tenant() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store
        .watch(&ctx, "widgets", ListOptions {
            predicate: tenant_predicate("beta"),
            ..Default::default()
        })
        .await
        .unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    store
        .create(&ctx, "beta/widgets/w2", widget("w2"), None)
        .await
        .unwrap();
    store
        .create(&ctx, "beta/widgetsextra/x", widget("x"), None)
        .await
        .unwrap();

    let event = next_event(&mut stream).await.unwrap();
    assert_eq!(event.object.metadata.name, "w2");
    assert_quiet(&mut stream, Duration::from_millis(50)).await;
    // The other tenant's object was still observed.
    assert_eq!(store.tracked_uids(), 2);
}

#[tokio::test]
async fn watch_uses_one_backend_watch() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let before = backend.watch_calls();
    let _stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();
    assert_eq!(backend.watch_calls() - before, 1);
    assert_eq!(backend.open_watches(), 1);
}

#[tokio::test]
async fn watch_resumes_after_resource_version() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    for name in ["w1", "w2", "w3"] {
        store
            .create(&ctx, &format!("acme/widgets/{}", name), widget(name), None)
            .await
            .unwrap();
    }

    let mut stream = store
        .watch(&ctx, "widgets", ListOptions {
            resource_version: "1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(next_event(&mut stream).await.unwrap().revision, 2);
    assert_eq!(next_event(&mut stream).await.unwrap().revision, 3);
}

#[tokio::test]
async fn watch_scoped_to_namespace() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store
        .watch(&ctx, "namespaces/ns2/widgets", ListOptions::default())
        .await
        .unwrap();

    store
        .create(&ctx, "acme/namespaces/ns1/widgets/a", widget("a"), None)
        .await
        .unwrap();
    store
        .create(&ctx, "acme/namespaces/ns2/widgets/b", widget("b"), None)
        .await
        .unwrap();

    let event = next_event(&mut stream).await.unwrap();
    assert_eq!(event.object.metadata.name, "b");
}

#[tokio::test]
async fn watch_without_decoder_rereads_at_revision() {
    let backend = MemoryBackend::new();
    let store = union_over(backend.client(), "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    let event = next_event(&mut stream).await.unwrap();
    assert!(matches!(event.kind, EventKind::Added));
    assert_eq!(event.object.metadata.name, "w1");
    assert_eq!(event.object.metadata.resource_version, "1");
}

#[tokio::test]
async fn delete_without_previous_value_emits_zero_object() {
    let scripted = Arc::new(ScriptedBackend::default());
    let store = union_over(scripted.clone(), "widgets").with_decoder(Arc::new(JsonCodec));
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    let obj = widget("w1").with_uid("u1");
    scripted
        .sender(0)
        .send(Ok(WatchBatch {
            revision: 5,
            events: vec![put_event("/tenants/acme/widgets/w1", &obj, 5, 5)],
        }))
        .await
        .unwrap();
    scripted
        .sender(0)
        .send(Ok(WatchBatch {
            revision: 6,
            events: vec![delete_event("/tenants/acme/widgets/w1", 6)],
        }))
        .await
        .unwrap();

    assert!(matches!(next_event(&mut stream).await.unwrap().kind, EventKind::Added));
    let deleted = next_event(&mut stream).await.unwrap();
    assert!(matches!(deleted.kind, EventKind::Deleted));
    assert!(deleted.object.is_zero());
    assert_eq!(deleted.revision, 6);
    assert_eq!(store.tenant_of_uid("u1").as_deref(), Some("acme"));
    assert_eq!(store.tracked_uids(), 1);
}

#[tokio::test]
async fn transient_error_reopens_after_last_revision() {
    let scripted = Arc::new(ScriptedBackend::default());
    let store = union_over(scripted.clone(), "widgets").with_decoder(Arc::new(JsonCodec));
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();
    assert_eq!(scripted.requests()[0].start_revision, 1);
    assert!(scripted.requests()[0].prev_kv);

    scripted
        .sender(0)
        .send(Ok(WatchBatch {
            revision: 7,
            events: vec![put_event("/tenants/acme/widgets/w1", &widget("w1"), 7, 7)],
        }))
        .await
        .unwrap();
    assert_eq!(next_event(&mut stream).await.unwrap().revision, 7);

    scripted
        .sender(0)
        .send(Err(StorageError::unavailable("connection reset")))
        .await
        .unwrap();
    scripted.wait_for_watches(2).await;
    assert_eq!(scripted.requests()[1].start_revision, 8);
    assert_eq!(scripted.requests()[1].prefix, "/tenants/");

    scripted
        .sender(1)
        .send(Ok(WatchBatch {
            revision: 8,
            events: vec![put_event("/tenants/beta/widgets/w2", &widget("w2"), 8, 8)],
        }))
        .await
        .unwrap();
    let event = next_event(&mut stream).await.unwrap();
    assert_eq!(event.revision, 8);
    assert_eq!(event.object.metadata.name, "w2");
}

#[tokio::test]
async fn transient_fault_keeps_stream_open_without_gaps() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    assert_eq!(next_event(&mut stream).await.unwrap().revision, 1);

    backend.inject_watch_fault(FaultKind::Transient);
    store
        .create(&ctx, "acme/widgets/w2", widget("w2"), None)
        .await
        .unwrap();
    store
        .create(&ctx, "acme/widgets/w3", widget("w3"), None)
        .await
        .unwrap();

    assert_eq!(next_event(&mut stream).await.unwrap().revision, 2);
    assert_eq!(next_event(&mut stream).await.unwrap().revision, 3);
    assert_quiet(&mut stream, Duration::from_millis(50)).await;
    assert_eq!(backend.watch_calls(), 2);
}

#[tokio::test]
async fn transient_fault_before_first_event_loses_nothing() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    store
        .create(&ctx, "acme/widgets/w0", widget("w0"), None)
        .await
        .unwrap();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    backend.inject_watch_fault(FaultKind::Transient);
    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();

    let event = next_event(&mut stream).await.unwrap();
    assert!(matches!(event.kind, EventKind::Added));
    assert_eq!(event.object.metadata.name, "w1");
    assert_eq!(event.revision, 2);
    assert_quiet(&mut stream, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn watch_skips_undecodable_values_and_stays_open() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    let client = backend.client();
    client
        .put(PutRequest {
            key: "/tenants/acme/widgets/broken".into(),
            value: Bytes::from_static(b"{not json"),
            guard: Guard::None,
            ttl: None,
        })
        .await
        .unwrap();
    client.close();
    store
        .create(&ctx, "acme/widgets/w2", widget("w2"), None)
        .await
        .unwrap();

    let first = next_event(&mut stream).await.unwrap();
    let second = next_event(&mut stream).await.unwrap();
    assert_eq!(first.object.metadata.name, "w1");
    assert_eq!(second.object.metadata.name, "w2");
    assert_eq!(second.revision, 3);

    store
        .create(&ctx, "beta/widgets/w3", widget("w3"), None)
        .await
        .unwrap();
    let third = next_event(&mut stream).await.unwrap();
    assert_eq!(third.object.metadata.name, "w3");
}

#[tokio::test]
async fn compaction_closes_watch_and_relist_succeeds() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    next_event(&mut stream).await.unwrap();

    backend.inject_watch_fault(FaultKind::Compaction);
    let terminal = next_event(&mut stream).await.unwrap();
    assert!(matches!(
        terminal.kind,
        EventKind::Error(StorageError::Compacted { .. })
    ));
    assert!(next_event(&mut stream).await.is_none());

    store
        .create(&ctx, "acme/widgets/w2", widget("w2"), None)
        .await
        .unwrap();
    let list = store
        .get_list(&ctx, "widgets", ListOptions::default())
        .await
        .unwrap();
    assert_eq!(list.items.len(), 2);
    assert_eq!(list.resource_version, backend.revision().to_string());
}

#[tokio::test]
async fn watch_from_compacted_revision_fails_stream() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    for name in ["w1", "w2", "w3"] {
        store
            .create(&ctx, &format!("acme/widgets/{}", name), widget(name), None)
            .await
            .unwrap();
    }
    backend.compact(3);

    let mut stream = store
        .watch(&ctx, "widgets", ListOptions {
            resource_version: "1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let event = next_event(&mut stream).await.unwrap();
    assert!(matches!(event.kind, EventKind::Error(StorageError::Compacted { .. })));
    assert!(next_event(&mut stream).await.is_none());
}

#[tokio::test]
async fn progress_notifications_become_bookmarks() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    store
        .create(&ctx, "acme/widgets/w1", widget("w1"), None)
        .await
        .unwrap();
    let mut stream = store
        .watch(&ctx, "widgets", ListOptions {
            progress_notify: true,
            ..Default::default()
        })
        .await
        .unwrap();

    store.request_watch_progress(&ctx).await.unwrap();
    let event = next_event(&mut stream).await.unwrap();
    assert!(matches!(event.kind, EventKind::Bookmark));
    assert_eq!(event.revision, 1);
    assert_eq!(event.object.metadata.resource_version, "1");
}

#[tokio::test]
async fn cancelling_request_ends_watch() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();

    ctx.cancel();
    assert!(next_event(&mut stream).await.is_none());
}

#[tokio::test]
async fn stop_ends_watches_and_closes_client_once() {
    let backend = MemoryBackend::new();
    let store = union(&backend, "widgets");
    let ctx = RequestContext::new();
    let mut stream = store.watch(&ctx, "widgets", ListOptions::default()).await.unwrap();
    assert_eq!(backend.open_clients(), 1);

    store.stop();
    store.stop();
    assert!(next_event(&mut stream).await.is_none());
    assert_eq!(backend.open_clients(), 0);
}
