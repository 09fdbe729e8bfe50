//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! They can:
//! - Resolve the calling principal
//! - Short-circuit requests (reject unauthenticated)

/// Principal resolution middleware
pub mod auth;
