//! Rotation notification models.
//!
//! A [`RotationEvent`] is produced after every successful rotation and handed
//! to the configured notifier. When webhook delivery is enabled it is wrapped
//! in a [`RotationWebhookPayload`] and POSTed with an HMAC signature.
//!
//! # Security
//!
//! - Neither the old nor the new secret is ever part of an event
//! - Payloads are signed using HMAC-SHA256

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    /// The key's timer came due
    Scheduled,
    /// The owner asked for an early rotation
    Manual,
}

/// A completed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub key_id: Uuid,
    pub owner_id: Option<String>,
    pub label: String,
    pub trigger: RotationTrigger,
    pub rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
}

/// Webhook payload sent to the rotation endpoint.
///
/// # Example
///
/// ```json
/// {
///   "event_type": "api_key.rotated",
///   "event_id": "550e8400-e29b-41d4-a716-446655440000",
///   "created_at": "2025-01-15T10:30:00Z",
///   "data": {
///     "key_id": "...",
///     "owner_id": "user-42",
///     "label": "default",
///     "trigger": "scheduled",
///     "rotated_at": "2025-01-15T10:30:00Z",
///     "next_rotation_at": "2025-01-22T10:30:00Z"
///   }
/// }
/// ```
///
/// The request carries an `X-Webhook-Signature: sha256=<hex>` header computed
/// as HMAC-SHA256(secret, json_body).
#[derive(Debug, Serialize, Deserialize)]
pub struct RotationWebhookPayload {
    /// Always "api_key.rotated"
    pub event_type: String,

    pub event_id: Uuid,

    pub created_at: DateTime<Utc>,

    pub data: RotationEvent,
}

impl RotationWebhookPayload {
    pub fn new(event_id: Uuid, event: RotationEvent) -> Self {
        Self {
            event_type: "api_key.rotated".to_string(),
            event_id,
            created_at: Utc::now(),
            data: event,
        }
    }
}
