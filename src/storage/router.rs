//! Tenant-aware storage router.
//!
//! The router owns one child store per partition identity and forwards every
//! call to the child selected by the caller's tenant:
//!
//! ```text
//!                        ┌──────────────┐
//!   ctx.tenant() = ""    │              │──► root child      (key unchanged)
//!   ─────────────────────►  Storage     │
//!   ctx.tenant() = acme  │  Router      │──► dedicated child (key acme/...)
//!                        │              │     or
//!                        └──────────────┘──► union child     (CRUD key acme/...,
//!                                                              list/watch tenant==acme)
//! ```
//!
//! Children are built lazily through a [`StoreFactory`] under a double-checked
//! write lock, wrapped in an [`InstrumentedStore`], and destroyed exactly once
//! by [`StorageRouter::destroy_all`] or [`StorageRouter::remove_tenant`].

use super::factory::{BackendStoreFactory, DestroyFn, PartitionConfig, PartitionKind, StoreFactory};
use super::instrumented::InstrumentedStore;
use super::keys::qualify_key;
use super::object::{Resource, ResourceList, Versioner};
use super::watch::WatchStream;
use super::{
    GetOptions, ListOptions, Preconditions, Storage, StorageFuture, UpdateFn, ValidateObjectFn,
};
use crate::core::config::{Config, StorageConfig, Strategy};
use crate::core::context::RequestContext;
use crate::core::error::{StorageError, StorageResult};
use crate::ops::StoreMetrics;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// API group of custom resource definitions.
pub const CRD_GROUP: &str = "apiextensions.k8s.io";

/// Resource name of custom resource definitions.
pub const CRD_RESOURCE: &str = "customresourcedefinitions";

/// Per-resource routing options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterOptions {
    /// Serve every tenant from the root partition.
    pub bypass: bool,
}

impl RouterOptions {
    /// Options for a resource: definitions of custom resources stay global.
    pub fn for_resource(group: &str, resource: &str) -> Self {
        Self {
            bypass: group == CRD_GROUP && resource == CRD_RESOURCE,
        }
    }
}

/// One live child store.
struct ChildStore {
    store: Arc<dyn Storage>,
    destroy: Mutex<Option<DestroyFn>>,
    created_at: Instant,
}

impl ChildStore {
    fn destroy(&self) -> bool {
        match self.destroy.lock().take() {
            Some(destroy) => {
                destroy();
                true
            }
            None => false,
        }
    }
}

/// Where one call goes.
struct Route<'k> {
    store: Arc<dyn Storage>,
    key: Cow<'k, str>,
    /// Tenant to inject into list/watch predicates (union strategy only).
    inject: Option<String>,
}

impl Route<'_> {
    fn list_options(&self, mut opts: ListOptions) -> ListOptions {
        if let Some(tenant) = &self.inject {
            opts.predicate = opts.predicate.with_tenant(tenant);
        }
        opts
    }
}

/// Routes storage calls to per-tenant child stores.
pub struct StorageRouter {
    factory: Arc<dyn StoreFactory>,
    metrics: Arc<StoreMetrics>,
    config: StorageConfig,
    options: RouterOptions,
    children: RwLock<HashMap<PartitionKind, Arc<ChildStore>>>,
    closed: AtomicBool,
}

impl StorageRouter {
    /// Create a router. No child is built until the first call.
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        metrics: Arc<StoreMetrics>,
        config: StorageConfig,
    ) -> Self {
        let options = RouterOptions::for_resource(&config.group, &config.resource);
        Self {
            factory,
            metrics,
            config,
            options,
            children: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a router over the backend named in `config`.
    pub fn from_config(config: &Config, metrics: Arc<StoreMetrics>) -> StorageResult<Self> {
        let factory = BackendStoreFactory::from_config(config)?;
        Ok(Self::new(Arc::new(factory), metrics, config.storage.clone()))
    }

    /// Override the routing options.
    pub fn with_options(mut self, options: RouterOptions) -> Self {
        self.options = options;
        self
    }

    /// Routing options in effect.
    pub fn options(&self) -> RouterOptions {
        self.options
    }

    /// Tenancy strategy in effect.
    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// Metrics shared with the children.
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// Identities of the live children, sorted.
    pub fn tenants(&self) -> Vec<PartitionKind> {
        let mut kinds: Vec<PartitionKind> = self.children.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Age of a live child.
    pub fn child_age(&self, kind: &PartitionKind) -> Option<Duration> {
        self.children
            .read()
            .get(kind)
            .map(|child| child.created_at.elapsed())
    }

    /// Destroy the child serving `tenant`. Returns whether one was destroyed.
    ///
    /// The shared union child is never removed for a single tenant.
    pub fn remove_tenant(&self, tenant: &str) -> bool {
        let kind = if tenant.is_empty() {
            PartitionKind::Root
        } else {
            PartitionKind::Dedicated(tenant.to_string())
        };
        let removed = self.children.write().remove(&kind);
        match removed {
            Some(child) => {
                let destroyed = child.destroy();
                info!(partition = %kind, resource = %self.config.resource, "child store removed");
                destroyed
            }
            None => false,
        }
    }

    /// Destroy every child and refuse further calls.
    pub fn destroy_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<(PartitionKind, Arc<ChildStore>)> =
            self.children.write().drain().collect();
        for (kind, child) in drained {
            if child.destroy() {
                debug!(partition = %kind, resource = %self.config.resource, "child store destroyed");
            }
        }
        info!(resource = %self.config.resource, "storage router destroyed");
    }

    /// Whether [`destroy_all`](Self::destroy_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn partition_for(&self, kind: PartitionKind) -> PartitionConfig {
        let prefix = match kind {
            PartitionKind::Root => self.config.root_prefix.clone(),
            PartitionKind::Dedicated(_) | PartitionKind::Union => self.config.tenant_prefix.clone(),
        };
        PartitionConfig {
            kind,
            resource: self.config.resource.clone(),
            prefix,
        }
    }

    /// Cached child for `kind`, building it on first use.
    fn child(&self, kind: PartitionKind) -> StorageResult<Arc<dyn Storage>> {
        if let Some(child) = self.children.read().get(&kind) {
            return Ok(Arc::clone(&child.store));
        }

        let mut children = self.children.write();
        if let Some(child) = children.get(&kind) {
            return Ok(Arc::clone(&child.store));
        }
        if self.is_closed() {
            return Err(StorageError::construction("storage router has been destroyed"));
        }

        let partition = self.partition_for(kind.clone());
        let built = self.factory.build(&partition)?;
        let tenant = kind.tenant_label().to_string();
        let store: Arc<dyn Storage> = Arc::new(InstrumentedStore::new(
            built.store,
            Arc::clone(&self.metrics),
            tenant.clone(),
            self.config.resource.clone(),
        ));
        children.insert(
            kind.clone(),
            Arc::new(ChildStore {
                store: Arc::clone(&store),
                destroy: Mutex::new(Some(built.destroy)),
                created_at: Instant::now(),
            }),
        );
        self.metrics
            .record_child_creation(&tenant, &self.config.resource);
        info!(
            partition = %kind,
            tenant = %tenant,
            resource = %self.config.resource,
            prefix = %partition.prefix,
            "child store created"
        );
        Ok(store)
    }

    /// Resolve the child and key for a CRUD call.
    fn route<'k>(&self, ctx: &RequestContext, key: &'k str) -> StorageResult<Route<'k>> {
        self.resolve(ctx, key, false)
    }

    /// Resolve the child, key and injected tenant for a list or watch.
    fn route_scan<'k>(&self, ctx: &RequestContext, key: &'k str) -> StorageResult<Route<'k>> {
        self.resolve(ctx, key, true)
    }

    fn resolve<'k>(&self, ctx: &RequestContext, key: &'k str, scan: bool) -> StorageResult<Route<'k>> {
        let tenant = match ctx.tenant() {
            Some(tenant) if !self.options.bypass => tenant,
            _ => {
                return Ok(Route {
                    store: self.child(PartitionKind::Root)?,
                    key: Cow::Borrowed(key),
                    inject: None,
                })
            }
        };
        match self.config.strategy {
            Strategy::Dedicated => Ok(Route {
                store: self.child(PartitionKind::Dedicated(tenant.to_string()))?,
                key: Cow::Owned(qualify_key(tenant, key)),
                inject: None,
            }),
            Strategy::Union if scan => Ok(Route {
                store: self.child(PartitionKind::Union)?,
                key: Cow::Borrowed(key),
                inject: Some(tenant.to_string()),
            }),
            Strategy::Union => Ok(Route {
                store: self.child(PartitionKind::Union)?,
                key: Cow::Owned(qualify_key(tenant, key)),
                inject: None,
            }),
        }
    }
}

impl Storage for StorageRouter {
    fn versioner(&self) -> Versioner {
        Versioner
    }

    fn create<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(async move {
            let route = self.route(ctx, key)?;
            route.store.create(ctx, &route.key, obj, ttl).await
        })
    }

    fn get<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: GetOptions,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(async move {
            let route = self.route(ctx, key)?;
            route.store.get(ctx, &route.key, opts).await
        })
    }

    fn get_list<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, ResourceList> {
        Box::pin(async move {
            let route = self.route_scan(ctx, key)?;
            let opts = route.list_options(opts);
            route.store.get_list(ctx, &route.key, opts).await
        })
    }

    fn watch<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, WatchStream> {
        Box::pin(async move {
            let route = self.route_scan(ctx, key)?;
            let opts = route.list_options(opts);
            route.store.watch(ctx, &route.key, opts).await
        })
    }

    fn delete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(async move {
            let route = self.route(ctx, key)?;
            route
                .store
                .delete(ctx, &route.key, preconditions, validate)
                .await
        })
    }

    fn guaranteed_update<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        update: UpdateFn,
    ) -> StorageFuture<'a, Resource> {
        Box::pin(async move {
            let route = self.route(ctx, key)?;
            route
                .store
                .guaranteed_update(ctx, &route.key, ignore_not_found, preconditions, update)
                .await
        })
    }

    fn count<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move { self.child(PartitionKind::Root)?.count(key).await })
    }

    fn readiness_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.child(PartitionKind::Root)?.readiness_check().await })
    }

    fn request_watch_progress<'a>(&'a self, ctx: &'a RequestContext) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let route = self.route_scan(ctx, "")?;
            route.store.request_watch_progress(ctx).await
        })
    }
}

impl Drop for StorageRouter {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.destroy_all();
        }
    }
}
