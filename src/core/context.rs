//! Request-scoped context.
//!
//! The layer above the router attaches the caller's tenant and a cancellation
//! token to every storage call. An absent or empty tenant selects the root
//! partition.

use tokio_util::sync::CancellationToken;

/// Tenant identifier. The empty string denotes the root partition.
pub type TenantId = String;

/// Request-scoped context passed to every storage operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    tenant: Option<TenantId>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a root-tenant context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context for the given tenant.
    pub fn with_tenant(tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            cancel: CancellationToken::new(),
        }
    }

    /// Return a copy of this context scoped to `tenant`, sharing cancellation.
    pub fn for_tenant(&self, tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            cancel: self.cancel.clone(),
        }
    }

    /// Attach an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The tenant, if one was set and it is non-empty.
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref().filter(|t| !t.is_empty())
    }

    /// Whether this request targets the root partition.
    pub fn is_root(&self) -> bool {
        self.tenant().is_none()
    }

    /// Cancellation token for this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this request and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
