//! Rotation notifications.
//!
//! The rotation service reports every completed rotation through the
//! [`Notifier`] trait. Delivery is best effort: failures are logged by the
//! caller and never undo a rotation.
//!
//! Two implementations ship with the service:
//! - [`LogNotifier`]: writes a log line (default)
//! - [`WebhookNotifier`]: POSTs an HMAC-signed payload to a configured URL

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::models::notification::{RotationEvent, RotationWebhookPayload};

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while delivering a rotation notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint responded with status {0}")]
    Rejected(u16),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid webhook configuration: {0}")]
    InvalidConfig(String),
}

/// Sink for rotation events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn key_rotated(&self, event: &RotationEvent) -> Result<(), NotifyError>;
}

/// Logs each rotation and does nothing else.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn key_rotated(&self, event: &RotationEvent) -> Result<(), NotifyError> {
        tracing::info!(
            key_id = %event.key_id,
            trigger = ?event.trigger,
            next_rotation_at = %event.next_rotation_at,
            "API key rotated"
        );
        Ok(())
    }
}

/// Delivers rotation events to an HTTP endpoint.
///
/// # Headers Sent
///
/// - `Content-Type: application/json`
/// - `X-Webhook-Signature: sha256=<hex>`
/// - `X-Webhook-Event-Id: <uuid>`
///
/// # Timeout
///
/// 5 seconds per delivery
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl WebhookNotifier {
    /// Validate `url` and build a notifier signing with `secret`.
    pub fn new(url: String, secret: String) -> Result<Self, NotifyError> {
        validate_webhook_url(&url)?;

        if secret.is_empty() {
            return Err(NotifyError::InvalidConfig(
                "Webhook secret must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            url,
            secret,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn key_rotated(&self, event: &RotationEvent) -> Result<(), NotifyError> {
        let event_id = Uuid::new_v4();
        let payload = RotationWebhookPayload::new(event_id, event.clone());
        let payload_json = serde_json::to_string(&payload)?;

        let signature = generate_signature(&self.secret, &payload_json)?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", &signature)
            .header("X-Webhook-Event-Id", event_id.to_string())
            .body(payload_json)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        tracing::debug!("Rotation webhook {} delivered to {}", event_id, self.url);
        Ok(())
    }
}

/// Generate HMAC-SHA256 signature for a webhook payload.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
fn generate_signature(secret: &str, payload: &str) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotifyError::InvalidConfig(e.to_string()))?;
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    Ok(format!("sha256={}", hex::encode(result.into_bytes())))
}

/// Validate webhook URL format.
///
/// # Rules
///
/// - Must be valid URL
/// - Must be HTTPS (HTTP localhost allowed for development)
/// - Maximum 2048 characters
fn validate_webhook_url(url: &str) -> Result<(), NotifyError> {
    if url.len() > 2048 {
        return Err(NotifyError::InvalidConfig(
            "URL exceeds 2048 characters".to_string(),
        ));
    }

    let parsed = url::Url::parse(url)
        .map_err(|_| NotifyError::InvalidConfig("Invalid URL format".to_string()))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            if matches!(
                parsed.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0")
            ) {
                Ok(())
            } else {
                Err(NotifyError::InvalidConfig(
                    "HTTP is only allowed for localhost. Use HTTPS for production.".to_string(),
                ))
            }
        }
        _ => Err(NotifyError::InvalidConfig(
            "URL must use HTTP or HTTPS".to_string(),
        )),
    }
}
