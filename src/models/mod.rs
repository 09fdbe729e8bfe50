//! Data models for persisted keys and the HTTP surface.

/// API key record and request/response types
pub mod api_key;
/// Rotation events and webhook payloads
pub mod notification;
