//! Trellis - tenant-aware storage router for a declarative-resource control plane.
//!
//! Trellis routes every storage call to the physical partition of the caller's
//! tenant. Tenants get either a dedicated partition store each, or share one
//! union store that serves all of them from a single backend range scan and a
//! single backend watch, attributing objects to tenants through a virtual
//! `tenant` predicate field.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Caller (API layer)                      │
//! │              RequestContext { tenant, cancellation }            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Storage Router                          │
//! │     tenant → child map │ key qualification │ tenant predicate   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Instrumented child stores                   │
//! │   Root partition │ Dedicated partitions │ Union store (shared)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Backing store clients                      │
//! │         etcd v3 gRPC (tonic)     │     in-memory MVCC engine    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::context`] - Request-scoped tenant and cancellation
//! - [`core::error`] - Error types and classification
//!
//! ## Backend
//! - [`backend::memory`] - Revisioned in-memory key-value engine
//! - `backend::etcd` - etcd v3 client (feature `etcd`)
//!
//! ## Storage
//! - [`storage::router`] - Tenant-aware router
//! - [`storage::union`] - Shared-partition union store
//! - [`storage::partition`] - Store over one key prefix
//! - [`storage::instrumented`] - Readiness and error metrics wrapper
//! - [`storage::factory`] - Child store construction
//! - [`storage::keys`] - Key qualification and shape matching
//! - [`storage::predicate`] - Label and field selectors
//! - [`storage::watch`] - Watch events and streams
//!
//! ## Operations
//! - [`ops::observability`] - Metrics registry
//! - [`ops::telemetry`] - Tracing setup
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - One child store per partition identity, even under concurrent first use
//! - Every key written for a non-root tenant starts with that tenant
//! - One backend range per union list, one backend watch per union watch
//! - The UID→tenant table only feeds predicates, never routing

// Core infrastructure
pub mod core;

// Backing store clients
pub mod backend;

// Storage layer
pub mod storage;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, context, error};
pub use ops::{observability, telemetry};
pub use storage::{Storage, StorageRouter};
