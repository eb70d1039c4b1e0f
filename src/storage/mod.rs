//! Storage contract and its implementations.
//!
//! # Modules
//!
//! - [`object`] - Resource objects, codecs, resource versions
//! - [`predicate`] - Label and field selectors
//! - [`keys`] - Key qualification and shape matching
//! - [`watch`] - Watch events and streams
//! - [`partition`] - Store over one key prefix of a backend
//! - [`union`] - Store multiplexing many tenants over one shared prefix
//! - [`instrumented`] - Metrics wrapper around a child store
//! - [`factory`] - Builds child stores from partition descriptions
//! - [`router`] - Tenant-aware router owning the children

pub mod factory;
pub mod instrumented;
pub mod keys;
pub mod object;
pub mod partition;
pub mod predicate;
pub mod router;
pub mod union;
pub mod watch;

use crate::core::context::RequestContext;
use crate::core::error::{StorageError, StorageResult};
use object::{Resource, ResourceList, Versioner};
use predicate::SelectionPredicate;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use watch::WatchStream;

pub use factory::{BuiltStore, DestroyFn, PartitionConfig, PartitionKind, StoreFactory};
pub use router::{RouterOptions, StorageRouter};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Validation callback run against the current object before a delete.
pub type ValidateObjectFn = Box<dyn Fn(&Resource) -> StorageResult<()> + Send + Sync>;

/// Update callback: receives the current object and returns the desired one.
/// Called again with a fresh object after every compare-and-swap conflict.
pub type UpdateFn = Box<dyn FnMut(Resource) -> StorageResult<Resource> + Send>;

/// Options for [`Storage::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Return a zero-value object instead of NotFound.
    pub ignore_not_found: bool,
    /// Read at this exact revision; empty reads the latest.
    pub resource_version: String,
}

/// Options for [`Storage::get_list`] and [`Storage::watch`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// List: snapshot revision. Watch: deliver changes after this revision.
    /// Empty means latest / from now.
    pub resource_version: String,
    /// Filter applied to every item or event.
    pub predicate: SelectionPredicate,
    /// Surface backend progress notifications as bookmark events.
    pub progress_notify: bool,
}

/// Conditions the current object must meet for a delete or update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    /// Require a UID.
    pub fn uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            resource_version: None,
        }
    }

    /// Require a resource version.
    pub fn resource_version(rv: impl Into<String>) -> Self {
        Self {
            uid: None,
            resource_version: Some(rv.into()),
        }
    }

    /// Check `obj` (stored under `key`) against these preconditions.
    pub fn check(&self, key: &str, obj: &Resource) -> StorageResult<()> {
        if let Some(uid) = &self.uid {
            if *uid != obj.metadata.uid {
                return Err(StorageError::conflict(
                    key,
                    format!(
                        "precondition failed: UID in precondition: {}, UID in object meta: {}",
                        uid, obj.metadata.uid
                    ),
                ));
            }
        }
        if let Some(rv) = &self.resource_version {
            if *rv != obj.metadata.resource_version {
                return Err(StorageError::conflict(
                    key,
                    format!(
                        "precondition failed: ResourceVersion in precondition: {}, ResourceVersion in object meta: {}",
                        rv, obj.metadata.resource_version
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Generic storage contract served by partition stores, the union store,
/// the instrumented wrapper and the router.
///
/// Keys are relative to the store's logical root.
pub trait Storage: Send + Sync {
    /// Revision/resource-version converter.
    fn versioner(&self) -> Versioner;

    /// Create `obj` at `key`. Fails with KeyExists if the key is occupied.
    fn create<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        obj: Resource,
        ttl: Option<Duration>,
    ) -> StorageFuture<'a, Resource>;

    /// Read one object.
    fn get<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: GetOptions,
    ) -> StorageFuture<'a, Resource>;

    /// List objects under `key` matching the predicate.
    fn get_list<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, ResourceList>;

    /// Watch changes under `key`. Returns once the watch is set up.
    fn watch<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        opts: ListOptions,
    ) -> StorageFuture<'a, WatchStream>;

    /// Delete the object at `key` and return its last state.
    fn delete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        preconditions: Option<Preconditions>,
        validate: Option<ValidateObjectFn>,
    ) -> StorageFuture<'a, Resource>;

    /// Read-modify-write with compare-and-swap retry.
    fn guaranteed_update<'a>(
        &'a self,
        ctx: &'a RequestContext,
        key: &'a str,
        ignore_not_found: bool,
        preconditions: Option<Preconditions>,
        update: UpdateFn,
    ) -> StorageFuture<'a, Resource>;

    /// Number of objects under `key`.
    fn count<'a>(&'a self, key: &'a str) -> StorageFuture<'a, u64>;

    /// Check that the store can serve requests.
    fn readiness_check(&self) -> StorageFuture<'_, ()>;

    /// Ask open watches to emit a progress notification.
    fn request_watch_progress<'a>(&'a self, ctx: &'a RequestContext) -> StorageFuture<'a, ()>;
}

/// Fail fast when the request was cancelled.
pub(crate) fn ensure_live(ctx: &RequestContext) -> StorageResult<()> {
    if ctx.is_cancelled() {
        return Err(StorageError::cancelled("request context cancelled"));
    }
    Ok(())
}
