//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Request-scoped tenant and cancellation
//! - [`error`] - Error types and classification

pub mod config;
pub mod context;
pub mod error;
