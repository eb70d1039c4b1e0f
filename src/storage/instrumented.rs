//! Metrics wrapper around a child store.
//!
//! Records how long a child took to serve its first successful call and
//! counts "(re)initializing" failures per verb. Results pass through
//! unchanged.

use super::object::{Resource, ResourceList, Versioner};
use super::watch::WatchStream;
use super::{
    GetOptions, ListOptions, Preconditions, Storage, StorageFuture, UpdateFn, ValidateObjectFn,
};
use crate::core::context::RequestContext;
use crate::core::error::StorageResult;
use crate::ops::StoreMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Verb labels of `trellis_reinitializing_errors_total`.
pub mod verbs {
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
    pub const WATCH: &str = "watch";
    pub const GET: &str = "get";
    pub const LIST: &str = "list";
    pub const UPDATE: &str = "update";
    pub const WATCH_PROGRESS: &str = "watch_progress";
}

/// Child store wrapped with readiness and error metrics.
pub struct InstrumentedStore {
    inner: Arc<dyn Storage>,
    metrics: Arc<StoreMetrics>,
    tenant: String,
    resource: String,
    created_at: Instant,
    ready: AtomicBool,
}

impl InstrumentedStore {
    /// Wrap `inner`. The creation instant is taken now.
    pub fn new(
        inner: Arc<dyn Storage>,
        metrics: Arc<StoreMetrics>,
        tenant: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            metrics,
            tenant: tenant.into(),
            resource: resource.into(),
            created_at: Instant::now(),
            ready: AtomicBool::new(false),
        }
    }

    /// Whether a call has succeeded since creation.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn observe<'a, T: Send + 'a>(
        &'a self,
        verb: &'static str,
        fut: StorageFuture<'a, T>,
    ) -> StorageFuture<'a, T> {
        Box::pin(async move {
            let result = fut.await;
            self.record(verb, &result);
            result
        })
    }

    fn record<T>(&self, verb: &'static str, result: &StorageResult<T>) {
        match result {
            Ok(_) => {
                if !self.ready.swap(true, Ordering::AcqRel) {
                    let elapsed = self.created_at.elapsed();
                    debug!(
                        tenant = %self.tenant,
                        resource = %self.resource,
                        verb,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "child store ready"
                    );
                    self.metrics
                        .record_first_ready(&self.tenant, &self.resource, elapsed.as_secs_f64());
                }
            }
            Err(e) if e.is_reinitializing() => {
                self.metrics
                    .record_reinitializing_error(&self.tenant, &self.resource, verb);
            }
            Err(_) => {}
        }
    }
}

impl Storage for InstrumentedStore {
    fn versioner(&self) -> Versioner {
        self.inner.versioner()
    }

    fn create<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageFuture<'a, Resource> {
        self.observe(verbs::CREATE, self.inner.create(ctx, key, obj, ttl))
    }

    fn get<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: GetOptions,
    ) -> StorageFuture<'a, Resource> {
        self.observe(verbs::GET, self.inner.get(ctx, key, opts))
    }

    fn get_list<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, ResourceList> {
        self.observe(verbs::LIST, self.inner.get_list(ctx, key, opts))
    }

    fn watch<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, WatchStream> {
        self.observe(verbs::WATCH, self.inner.watch(ctx, key, opts))
    }

    fn delete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageFuture<'a, Resource> {
        self.observe(
            verbs::DELETE,
            self.inner.delete(ctx, key, preconditions, validate),
        )
    }

    fn guaranteed_update<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        update: UpdateFn,
    ) -> StorageFuture<'a, Resource> {
        self.observe(
            verbs::UPDATE,
            self.inner
                .guaranteed_update(ctx, key, ignore_not_found, preconditions, update),
        )
    }

    fn count<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        self.inner.count(key)
    }

    fn readiness_check(&self) -> StorageFuture<'_, ()> {
        self.inner.readiness_check()
    }

    fn request_watch_progress<'a>(&'a self, ctx: &'a RequestContext) -> StorageFuture<'a, ()> {
        self.observe(verbs::WATCH_PROGRESS, self.inner.request_watch_progress(ctx))
    }
}
