//! API key records and the request/response types built around them.
//!
//! The persisted record uses camelCase field names. The HTTP bodies follow the
//! field names the frontend already sends (`nama`, `hariUpdate`, `hariBaru`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by every issued secret.
pub const SECRET_PREFIX: &str = "sk_";

/// Label used when the caller does not supply one.
pub const DEFAULT_LABEL: &str = "default";

/// Smallest accepted rotation period, in days.
pub const MIN_ROTATION_DAYS: u32 = 1;

/// Largest accepted rotation period, in days.
pub const MAX_ROTATION_DAYS: u32 = 365;

/// A previously active secret and the moment it stopped being current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub secret: String,
    pub superseded_at: DateTime<Utc>,
}

/// One issued API key as stored in the key document.
///
/// # Invariants
///
/// - `id` never changes after issuance
/// - `rotation_period_days` stays within `1..=365`
/// - `secret` is the only current value; older ones live in `history`
/// - a timer is armed for the key exactly when `active` is true
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Stable identifier, also the scheduling handle
    pub id: Uuid,

    /// Principal that owns the key
    ///
    /// Documents written before owners were bound at issuance may carry
    /// `null` here. Such keys still verify but no owner-scoped call matches them.
    #[serde(default)]
    pub owner_id: Option<String>,

    pub label: String,

    /// Current secret value (`sk_` + 64 hex chars)
    pub secret: String,

    pub created_at: DateTime<Utc>,

    /// When the key is next rotated. Exposed as `expiresAt` in API views.
    #[serde(alias = "expiresAt")]
    pub next_rotation_at: DateTime<Utc>,

    pub rotation_period_days: u32,

    pub active: bool,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Build a fresh, active record whose first rotation is one period after `now`.
    pub fn new(
        owner_id: String,
        label: String,
        secret: String,
        rotation_period_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: Some(owner_id),
            label,
            secret,
            created_at: now,
            next_rotation_at: next_rotation_from(now, rotation_period_days),
            rotation_period_days,
            active: true,
            history: Vec::new(),
            last_used_at: None,
            last_rotated_at: None,
        }
    }

    /// The key is treated as expiring at its next rotation.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.next_rotation_at
    }

    /// Whether `owner_id` owns this record.
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id.as_deref() == Some(owner_id)
    }

    /// Replace the current secret, pushing the old one into history.
    ///
    /// `retention` caps the history length; the oldest entries go first.
    pub fn replace_secret(
        &mut self,
        new_secret: String,
        now: DateTime<Utc>,
        retention: Option<usize>,
    ) {
        let previous = std::mem::replace(&mut self.secret, new_secret);
        self.history.push(HistoryEntry {
            secret: previous,
            superseded_at: now,
        });

        if let Some(cap) = retention {
            if self.history.len() > cap {
                let excess = self.history.len() - cap;
                self.history.drain(..excess);
            }
        }

        self.next_rotation_at = next_rotation_from(now, self.rotation_period_days);
        self.last_rotated_at = Some(now);
    }

    /// Pull an out-of-range rotation period back into `1..=365`.
    ///
    /// Returns whether the record changed. A record whose due time cannot be
    /// represented is also brought back to one period after `now`.
    pub fn clamp_period(&mut self, now: DateTime<Utc>) -> bool {
        let clamped = self
            .rotation_period_days
            .clamp(MIN_ROTATION_DAYS, MAX_ROTATION_DAYS);
        if clamped == self.rotation_period_days {
            return false;
        }

        self.rotation_period_days = clamped;
        if self.next_rotation_at == DateTime::<Utc>::MAX_UTC {
            self.next_rotation_at = next_rotation_from(now, clamped);
        }
        true
    }

    /// Change the rotation period and restart the countdown from `now`.
    pub fn set_period(&mut self, rotation_period_days: u32, now: DateTime<Utc>) {
        self.rotation_period_days = rotation_period_days;
        self.next_rotation_at = next_rotation_from(now, rotation_period_days);
    }
}

/// `from + days`, saturating at the latest representable instant.
pub fn next_rotation_from(from: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    from.checked_add_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Request body for issuing a key.
///
/// ```json
/// { "nama": "mobile app", "hariUpdate": 7 }
/// ```
///
/// `hariUpdate` is read as a signed integer so that negative values reach
/// validation and come back as 400 rather than a deserialization rejection.
#[derive(Debug, Deserialize)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub nama: Option<String>,

    #[serde(rename = "hariUpdate")]
    pub hari_update: i64,
}

/// Response body for a freshly issued key. The only time `apiKey` is shown.
#[derive(Debug, Serialize)]
pub struct IssuedKeyResponse {
    pub id: Uuid,

    #[serde(rename = "apiKey")]
    pub api_key: String,

    /// Expiry / next rotation instant
    pub kadaluarsa: DateTime<Utc>,

    #[serde(rename = "hariUpdate")]
    pub hari_update: u32,
}

/// Result of issuing a key at the service level.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub id: Uuid,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub rotation_period_days: u32,
}

impl From<IssuedKey> for IssuedKeyResponse {
    fn from(key: IssuedKey) -> Self {
        Self {
            id: key.id,
            api_key: key.secret,
            kadaluarsa: key.expires_at,
            hari_update: key.rotation_period_days,
        }
    }
}

/// Response body for a manual rotation.
#[derive(Debug, Serialize)]
pub struct RotatedKeyResponse {
    #[serde(rename = "keyBaru")]
    pub key_baru: String,
}

/// Request body for changing a key's rotation period.
#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    #[serde(rename = "hariBaru")]
    pub hari_baru: i64,
}

/// Schedule information returned after a reschedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: Uuid,

    #[serde(rename = "hariUpdate")]
    pub hari_update: u32,

    pub kadaluarsa: DateTime<Utc>,
}

/// Plain message response, used by deactivation.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub pesan: String,
}

/// Redacted view of a record for listing. Never carries a secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotation_period_days: u32,
    pub active: bool,
    pub history_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            label: record.label.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at(),
            rotation_period_days: record.rotation_period_days,
            active: record.active,
            history_count: record.history.len(),
            last_used_at: record.last_used_at,
            last_rotated_at: record.last_rotated_at,
        }
    }
}

/// Request body for checking a presented key.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

/// Outcome of verifying a presented secret.
///
/// Serializes to `{"valid": false}` on a miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl VerifyOutcome {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            owner_id: None,
            key_id: None,
            label: None,
            expires_at: None,
        }
    }

    pub fn valid(record: &ApiKeyRecord) -> Self {
        Self {
            valid: true,
            owner_id: record.owner_id.clone(),
            key_id: Some(record.id),
            label: Some(record.label.clone()),
            expires_at: Some(record.expires_at()),
        }
    }
}
