//! Rotation service - issuing, rotating and verifying API keys.
//!
//! This service handles:
//! - Issuing keys bound to their owner
//! - Automatic rotation when a key's timer comes due
//! - Manual rotation, rescheduling and deactivation by the owner
//! - Verifying presented secrets
//!
//! # Consistency
//!
//! Every mutating call holds the key's lock for its whole read-modify-write
//! and timer update, so two rotations of the same key can never interleave.
//! Store writes are awaited before a call reports success. Rotation
//! notifications go out on their own task once the key's lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        api_key::{
            ApiKeyRecord, ApiKeySummary, DEFAULT_LABEL, IssuedKey, MAX_ROTATION_DAYS,
            MIN_ROTATION_DAYS, SECRET_PREFIX, ScheduleInfo, VerifyOutcome,
        },
        notification::{RotationEvent, RotationTrigger},
    },
    notifier::Notifier,
    scheduler::{Scheduler, TriggerReceiver},
    store::KeyStore,
};

/// Delay before a scheduled rotation that failed to persist is retried.
pub const ROTATION_RETRY_MINUTES: i64 = 5;

/// Check that `days` lies within `1..=365`.
pub fn validate_period(days: i64) -> Result<u32, AppError> {
    if !(i64::from(MIN_ROTATION_DAYS)..=i64::from(MAX_ROTATION_DAYS)).contains(&days) {
        return Err(AppError::Validation(format!(
            "Rotation period must be between {} and {} days",
            MIN_ROTATION_DAYS, MAX_ROTATION_DAYS
        )));
    }
    u32::try_from(days).map_err(|_| AppError::Validation("Rotation period out of range".into()))
}

/// Generate a fresh secret.
///
/// # Output
///
/// `sk_` followed by 64 hex characters (32 random bytes)
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

/// Shared handle used as router state.
pub type SharedRotationService = Arc<RotationService>;

/// Tunables for the rotation service.
#[derive(Debug, Clone, Default)]
pub struct RotationSettings {
    /// Maximum superseded secrets kept per key; `None` keeps all of them
    pub history_retention: Option<usize>,
}

/// One async mutex per key id.
///
/// Entries only live while someone holds or waits for them.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key_id: Uuid) -> KeyGuard<'_> {
        let lock = self.map().entry(key_id).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key_id,
            guard: Some(guard),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Held key lock. Dropping it removes the map entry once nobody else wants it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's own Arc no longer counts.
        drop(self.guard.take());

        let mut locks = self.locks.map();
        if locks
            .get(&self.key_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key_id);
        }
    }
}

/// Orchestrates the key store, rotation timers and notifications.
pub struct RotationService {
    store: KeyStore,
    scheduler: Scheduler,
    notifier: Arc<dyn Notifier>,
    settings: RotationSettings,
    locks: KeyLocks,
    triggers: StdMutex<Option<TriggerReceiver>>,
}

impl RotationService {
    /// Build the service around a loaded store.
    ///
    /// No timers run until [`RotationService::init`] is awaited.
    pub fn new(
        store: KeyStore,
        notifier: Arc<dyn Notifier>,
        settings: RotationSettings,
    ) -> SharedRotationService {
        let (scheduler, triggers) = Scheduler::new();
        Arc::new(Self {
            store,
            scheduler,
            notifier,
            settings,
            locks: KeyLocks::default(),
            triggers: StdMutex::new(Some(triggers)),
        })
    }

    /// Start the trigger loop and re-arm timers for every active key.
    ///
    /// Must complete before the service takes requests. Returns the number of
    /// timers restored; calling it again restores nothing.
    pub async fn init(self: &Arc<Self>) -> usize {
        let receiver = self
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(receiver) = receiver else {
            tracing::warn!("Rotation service already initialized");
            return 0;
        };

        tokio::spawn(run_trigger_loop(Arc::downgrade(self), receiver));

        let records = self.store.find_all().await;
        let restored = self.scheduler.restore_all(&records);
        tracing::info!(
            "Restored {} rotation timers ({} keys on record)",
            restored,
            records.len()
        );
        restored
    }

    /// Issue a new key for `owner_id`.
    ///
    /// The returned secret is the only time it is shown in plaintext.
    ///
    /// # Errors
    ///
    /// - `Validation`: period outside `1..=365`
    /// - `Persistence`: the key document could not be written
    pub async fn issue(
        &self,
        owner_id: &str,
        label: Option<String>,
        rotation_period_days: i64,
    ) -> Result<IssuedKey, AppError> {
        let period = validate_period(rotation_period_days)?;

        let label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());

        let record = ApiKeyRecord::new(
            owner_id.to_string(),
            label,
            generate_secret(),
            period,
            Utc::now(),
        );

        let _guard = self.locks.acquire(record.id).await;

        let issued = IssuedKey {
            id: record.id,
            secret: record.secret.clone(),
            expires_at: record.expires_at(),
            rotation_period_days: record.rotation_period_days,
        };
        let due_at = record.next_rotation_at;

        self.store.append(record).await?;
        self.scheduler.schedule(issued.id, due_at);

        tracing::info!("Issued API key {} rotating every {} days", issued.id, period);
        Ok(issued)
    }

    /// Rotate a key immediately.
    ///
    /// Missing or inactive keys are skipped and `Ok(None)` is returned.
    pub async fn rotate_now(&self, key_id: Uuid) -> Result<Option<String>, AppError> {
        let _guard = self.locks.acquire(key_id).await;
        self.rotate_locked(key_id, RotationTrigger::Manual).await
    }

    /// Handle a timer fire for `key_id`.
    ///
    /// Rotates only when the key is active and due. A fire for an active key
    /// that is not due yet re-arms the timer at the stored due time. If the
    /// rotation cannot be persisted the timer is re-armed a few minutes out
    /// before the error is returned.
    pub async fn rotate_due(&self, key_id: Uuid) -> Result<Option<String>, AppError> {
        let _guard = self.locks.acquire(key_id).await;

        let Some(record) = self.store.find(|r| r.id == key_id).await else {
            tracing::info!("Skipping scheduled rotation of unknown key {}", key_id);
            return Ok(None);
        };

        if !record.active {
            tracing::info!("Skipping scheduled rotation of inactive key {}", key_id);
            self.scheduler.cancel(key_id);
            return Ok(None);
        }

        if record.next_rotation_at > Utc::now() {
            tracing::debug!(
                "Key {} not due until {}, re-arming",
                key_id,
                record.next_rotation_at
            );
            self.scheduler.schedule(key_id, record.next_rotation_at);
            return Ok(None);
        }

        let result = self.rotate_locked(key_id, RotationTrigger::Scheduled).await;
        if result.is_err() {
            let retry_at = Utc::now() + Duration::minutes(ROTATION_RETRY_MINUTES);
            tracing::warn!("Scheduled rotation of key {} will be retried at {}", key_id, retry_at);
            self.scheduler.schedule(key_id, retry_at);
        }
        result
    }

    /// Rotate a key on behalf of its owner and return the new secret.
    ///
    /// Ownership never changes, so it is checked before [`RotationService::rotate_now`]
    /// takes the key's lock; a key deactivated in between is reported as missing.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: no active key with that id belongs to `owner_id`
    pub async fn rotate_manual(&self, key_id: Uuid, owner_id: &str) -> Result<String, AppError> {
        self.store
            .find(|r| r.id == key_id && r.is_owned_by(owner_id) && r.active)
            .await
            .ok_or(AppError::KeyNotFound)?;

        self.rotate_now(key_id).await?.ok_or(AppError::KeyNotFound)
    }

    /// Change a key's rotation period. The new countdown starts now.
    ///
    /// Inactive keys accept the new period but get no timer.
    ///
    /// # Errors
    ///
    /// - `Validation`: period outside `1..=365`
    /// - `KeyNotFound`: no key with that id belongs to `owner_id`
    pub async fn reschedule(
        &self,
        key_id: Uuid,
        owner_id: &str,
        new_period_days: i64,
    ) -> Result<ScheduleInfo, AppError> {
        let period = validate_period(new_period_days)?;
        let _guard = self.locks.acquire(key_id).await;

        self.store
            .find(|r| r.id == key_id && r.is_owned_by(owner_id))
            .await
            .ok_or(AppError::KeyNotFound)?;

        let now = Utc::now();
        let (active, info) = self
            .store
            .mutate(key_id, |r| {
                r.set_period(period, now);
                (
                    r.active,
                    ScheduleInfo {
                        id: r.id,
                        hari_update: r.rotation_period_days,
                        kadaluarsa: r.next_rotation_at,
                    },
                )
            })
            .await?
            .ok_or(AppError::KeyNotFound)?;

        if active {
            self.scheduler.reschedule(key_id, info.kadaluarsa);
        }

        tracing::info!("Key {} now rotates every {} days", key_id, period);
        Ok(info)
    }

    /// Check a presented secret against the current secrets of active keys.
    ///
    /// A hit records `last_used_at`. If that write fails the key still
    /// verifies; the failure is logged.
    pub async fn verify(&self, secret: &str) -> VerifyOutcome {
        let Some(record) = self.store.find(|r| r.active && r.secret == secret).await else {
            return VerifyOutcome::invalid();
        };

        self.record_use(record.id, secret).await
    }

    /// Stamp `last_used_at` on `key_id` if `secret` is still its current, active secret.
    async fn record_use(&self, key_id: Uuid, secret: &str) -> VerifyOutcome {
        let still_current = |r: &ApiKeyRecord| r.active && r.secret == secret;
        let now = Utc::now();

        let result = self
            .store
            .mutate(key_id, |r| {
                if !still_current(r) {
                    return None;
                }
                r.last_used_at = Some(now);
                Some(VerifyOutcome::valid(r))
            })
            .await;

        match result {
            Ok(outcome) => outcome.flatten().unwrap_or_else(VerifyOutcome::invalid),
            Err(e) => {
                tracing::warn!("Failed to record use of key {}: {}", key_id, e);
                self.store
                    .find(|r| r.id == key_id && still_current(r))
                    .await
                    .map(|r| VerifyOutcome::valid(&r))
                    .unwrap_or_else(VerifyOutcome::invalid)
            }
        }
    }

    /// Redacted views of every key owned by `owner_id`, newest first.
    pub async fn list_for_owner(&self, owner_id: &str) -> Vec<ApiKeySummary> {
        let mut records = self.store.filter(|r| r.is_owned_by(owner_id)).await;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.iter().map(ApiKeySummary::from).collect()
    }

    /// Deactivate a key and stop its timer. The record is kept.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: no active key with that id belongs to `owner_id`,
    ///   which includes a key that was already deactivated
    pub async fn deactivate(&self, key_id: Uuid, owner_id: &str) -> Result<(), AppError> {
        let _guard = self.locks.acquire(key_id).await;

        self.store
            .find(|r| r.id == key_id && r.is_owned_by(owner_id) && r.active)
            .await
            .ok_or(AppError::KeyNotFound)?;

        self.store
            .mutate(key_id, |r| r.active = false)
            .await?
            .ok_or(AppError::KeyNotFound)?;

        self.scheduler.cancel(key_id);

        tracing::info!("Deactivated API key {}", key_id);
        Ok(())
    }

    /// Number of armed rotation timers.
    pub fn scheduled_jobs(&self) -> usize {
        self.scheduler.job_count()
    }

    /// Whether `key_id` currently has an armed timer.
    pub fn is_scheduled(&self, key_id: Uuid) -> bool {
        self.scheduler.is_scheduled(key_id)
    }

    /// Stop every rotation timer.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Rotate `key_id`. Caller must hold the key's lock.
    async fn rotate_locked(
        &self,
        key_id: Uuid,
        trigger: RotationTrigger,
    ) -> Result<Option<String>, AppError> {
        let now = Utc::now();
        let new_secret = generate_secret();
        let retention = self.settings.history_retention;

        let rotated = self
            .store
            .mutate(key_id, |r| {
                if !r.active {
                    return None;
                }
                r.replace_secret(new_secret.clone(), now, retention);
                Some(RotationEvent {
                    key_id: r.id,
                    owner_id: r.owner_id.clone(),
                    label: r.label.clone(),
                    trigger,
                    rotated_at: now,
                    next_rotation_at: r.next_rotation_at,
                })
            })
            .await?
            .flatten();

        let Some(event) = rotated else {
            tracing::info!("Skipping rotation of missing or inactive key {}", key_id);
            return Ok(None);
        };

        self.scheduler.schedule(key_id, event.next_rotation_at);
        tracing::info!("Rotated API key {} ({:?})", key_id, trigger);

        // Delivery runs detached so a slow endpoint holds no key lock.
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.key_rotated(&event).await {
                tracing::warn!("Rotation notification for key {} failed: {}", event.key_id, e);
            }
        });

        Ok(Some(new_secret))
    }
}

/// Drain timer fires and rotate the keys they name.
///
/// Exits once the service is dropped or the channel closes.
async fn run_trigger_loop(service: Weak<RotationService>, mut triggers: TriggerReceiver) {
    while let Some(key_id) = triggers.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };

        if let Err(e) = service.rotate_due(key_id).await {
            tracing::error!("Scheduled rotation of key {} failed: {}", key_id, e);
        }
    }

    tracing::debug!("Rotation trigger loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{LogNotifier, NotifyError};
    use crate::store::DOCUMENT_NAME;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashSet;
    use tempfile::{TempDir, tempdir};

    /// Records every event it sees.
    #[derive(Default)]
    struct RecordingNotifier {
        events: StdMutex<Vec<RotationEvent>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<RotationEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn key_rotated(&self, event: &RotationEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// Takes far longer than any request should wait.
    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn key_rotated(&self, _event: &RotationEvent) -> Result<(), NotifyError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(())
        }
    }

    /// Always fails.
    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn key_rotated(&self, _event: &RotationEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected(503))
        }
    }

    async fn service_in(dir: &TempDir, notifier: Arc<dyn Notifier>) -> SharedRotationService {
        let store = KeyStore::load(dir.path().join(DOCUMENT_NAME)).await;
        let service = RotationService::new(store, notifier, RotationSettings::default());
        service.init().await;
        service
    }

    async fn service() -> (TempDir, SharedRotationService) {
        let dir = tempdir().unwrap();
        let service = service_in(&dir, Arc::new(LogNotifier)).await;
        (dir, service)
    }

    async fn record_of(service: &RotationService, key_id: Uuid) -> ApiKeyRecord {
        service.store.find(|r| r.id == key_id).await.unwrap()
    }

    /// Notifications are delivered on their own task; give them a moment.
    async fn wait_for_events(notifier: &RecordingNotifier, count: usize) -> Vec<RotationEvent> {
        for _ in 0..100 {
            let events = notifier.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        notifier.events()
    }

    /// Write a single overdue active key for `alice` into the data directory.
    fn write_overdue_key(data: &std::path::Path, period_days: u32) -> ApiKeyRecord {
        let mut overdue = ApiKeyRecord::new(
            "alice".into(),
            "default".into(),
            generate_secret(),
            period_days,
            Utc::now() - Duration::days(3),
        );
        overdue.next_rotation_at = Utc::now() - Duration::days(2);
        std::fs::create_dir_all(data).unwrap();
        std::fs::write(
            data.join(DOCUMENT_NAME),
            serde_json::to_vec_pretty(&vec![overdue.clone()]).unwrap(),
        )
        .unwrap();
        overdue
    }

    /// Replace the data directory with a plain file so every write fails.
    fn block_writes(data: &std::path::Path) {
        std::fs::remove_dir_all(data).unwrap();
        std::fs::write(data, b"blocker").unwrap();
    }

    #[test]
    fn test_validate_period_bounds() {
        assert_eq!(validate_period(1).unwrap(), 1);
        assert_eq!(validate_period(365).unwrap(), 365);
        assert!(matches!(validate_period(0), Err(AppError::Validation(_))));
        assert!(matches!(validate_period(366), Err(AppError::Validation(_))));
        assert!(matches!(validate_period(-7), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with("sk_"));
        assert_eq!(secret.len(), 3 + 64);
        assert!(secret[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_issue_binds_owner_and_schedules() {
        let (_dir, service) = service().await;
        let before = Utc::now();

        let issued = service.issue("alice", Some("ci".into()), 7).await.unwrap();

        assert!(issued.secret.starts_with("sk_"));
        assert!(issued.secret.len() >= 32);
        assert_eq!(issued.rotation_period_days, 7);
        assert!(issued.expires_at >= before + Duration::days(7));
        assert!(issued.expires_at <= Utc::now() + Duration::days(7));
        assert!(service.is_scheduled(issued.id));

        let record = record_of(&service, issued.id).await;
        assert_eq!(record.owner_id.as_deref(), Some("alice"));
        assert_eq!(record.label, "ci");
        assert_eq!(record.next_rotation_at, record.created_at + Duration::days(7));
    }

    #[tokio::test]
    async fn test_issue_defaults_blank_label() {
        let (_dir, service) = service().await;

        let issued = service.issue("alice", Some("   ".into()), 3).await.unwrap();

        assert_eq!(record_of(&service, issued.id).await.label, "default");
    }

    #[tokio::test]
    async fn test_out_of_range_period_mutates_nothing() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        let before = record_of(&service, issued.id).await;

        assert!(matches!(
            service.issue("alice", None, 0).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.reschedule(issued.id, "alice", 400).await,
            Err(AppError::Validation(_))
        ));

        assert_eq!(service.store.find_all().await.len(), 1);
        assert_eq!(record_of(&service, issued.id).await, before);
    }

    #[tokio::test]
    async fn test_rotation_moves_secret_into_history() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        let before = record_of(&service, issued.id).await;

        let new_secret = service.rotate_now(issued.id).await.unwrap().unwrap();
        let after = record_of(&service, issued.id).await;

        assert_ne!(new_secret, issued.secret);
        assert_eq!(after.secret, new_secret);
        assert_eq!(after.history.len(), 1);
        assert_eq!(after.history[0].secret, issued.secret);
        assert!(after.next_rotation_at > before.next_rotation_at);
        assert!(after.last_rotated_at.is_some());
        assert!(service.is_scheduled(issued.id));
    }

    #[tokio::test]
    async fn test_secrets_never_repeat_across_history() {
        let (_dir, service) = service().await;
        let mut ids = HashSet::new();
        let mut secrets = HashSet::new();

        for owner in ["alice", "bob", "carol"] {
            let issued = service.issue(owner, None, 30).await.unwrap();
            assert!(ids.insert(issued.id));
            assert!(secrets.insert(issued.secret));
            for _ in 0..5 {
                let secret = service.rotate_now(issued.id).await.unwrap().unwrap();
                assert!(secrets.insert(secret));
            }
        }

        assert_eq!(secrets.len(), 18);
    }

    #[tokio::test]
    async fn test_only_current_secret_verifies() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", Some("web".into()), 7).await.unwrap();
        let first = service.rotate_now(issued.id).await.unwrap().unwrap();
        let current = service.rotate_now(issued.id).await.unwrap().unwrap();

        let outcome = service.verify(&current).await;
        assert!(outcome.valid);
        assert_eq!(outcome.owner_id.as_deref(), Some("alice"));
        assert_eq!(outcome.key_id, Some(issued.id));
        assert_eq!(outcome.label.as_deref(), Some("web"));

        assert_eq!(service.verify(&issued.secret).await, VerifyOutcome::invalid());
        assert_eq!(service.verify(&first).await, VerifyOutcome::invalid());
        assert_eq!(service.verify("sk_unknown").await, VerifyOutcome::invalid());

        assert!(record_of(&service, issued.id).await.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_rotate_now_skips_missing_and_inactive_keys() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        service.deactivate(issued.id, "alice").await.unwrap();

        assert_eq!(service.rotate_now(issued.id).await.unwrap(), None);
        assert_eq!(service.rotate_now(Uuid::new_v4()).await.unwrap(), None);
        assert!(record_of(&service, issued.id).await.history.is_empty());
    }

    #[tokio::test]
    async fn test_manual_rotation_requires_owner() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        let before = record_of(&service, issued.id).await;

        let result = service.rotate_manual(issued.id, "mallory").await;

        assert!(matches!(result, Err(AppError::KeyNotFound)));
        assert_eq!(record_of(&service, issued.id).await, before);
        assert!(matches!(
            service.rotate_manual(Uuid::new_v4(), "alice").await,
            Err(AppError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_reschedule_counts_from_now() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        let before = Utc::now();

        let info = service.reschedule(issued.id, "alice", 30).await.unwrap();

        assert_eq!(info.hari_update, 30);
        assert!(info.kadaluarsa >= before + Duration::days(30));
        let record = record_of(&service, issued.id).await;
        assert_eq!(record.rotation_period_days, 30);
        assert_eq!(record.next_rotation_at, info.kadaluarsa);
        assert!(service.is_scheduled(issued.id));

        assert!(matches!(
            service.reschedule(issued.id, "bob", 30).await,
            Err(AppError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_reschedule_inactive_key_stays_unscheduled() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();
        service.deactivate(issued.id, "alice").await.unwrap();

        let info = service.reschedule(issued.id, "alice", 14).await.unwrap();

        assert_eq!(info.hari_update, 14);
        assert!(!service.is_scheduled(issued.id));
        assert!(!record_of(&service, issued.id).await.active);
    }

    #[tokio::test]
    async fn test_deactivate_twice_never_reactivates() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        service.deactivate(issued.id, "alice").await.unwrap();
        let second = service.deactivate(issued.id, "alice").await;

        assert!(matches!(second, Err(AppError::KeyNotFound)));
        assert!(!record_of(&service, issued.id).await.active);
        assert!(!service.is_scheduled(issued.id));
        assert_eq!(service.verify(&issued.secret).await, VerifyOutcome::invalid());
    }

    #[tokio::test]
    async fn test_deactivate_wrong_owner_is_not_found() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        assert!(matches!(
            service.deactivate(issued.id, "bob").await,
            Err(AppError::KeyNotFound)
        ));
        assert!(record_of(&service, issued.id).await.active);
    }

    #[tokio::test]
    async fn test_list_for_owner_is_redacted_and_scoped() {
        let (_dir, service) = service().await;
        let older = service.issue("alice", Some("old".into()), 7).await.unwrap();
        let newer = service.issue("alice", Some("new".into()), 7).await.unwrap();
        service.issue("bob", None, 7).await.unwrap();
        service.rotate_now(older.id).await.unwrap();

        let listed = service.list_for_owner("alice").await;

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
        assert_eq!(listed[1].history_count, 1);
        assert!(service.list_for_owner("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_restores_only_active_timers() {
        let dir = tempdir().unwrap();
        let mut active = Vec::new();
        {
            let service = service_in(&dir, Arc::new(LogNotifier)).await;
            for i in 0..5 {
                let issued = service.issue("alice", None, 7).await.unwrap();
                if i % 2 == 0 {
                    active.push(issued.id);
                } else {
                    service.deactivate(issued.id, "alice").await.unwrap();
                }
            }
            service.shutdown();
        }

        let restarted = service_in(&dir, Arc::new(LogNotifier)).await;

        assert_eq!(restarted.scheduled_jobs(), 3);
        for record in restarted.store.find_all().await {
            assert_eq!(restarted.is_scheduled(record.id), active.contains(&record.id));
        }
    }

    #[tokio::test]
    async fn test_init_twice_restores_nothing() {
        let (_dir, service) = service().await;
        assert_eq!(service.init().await, 0);
    }

    #[tokio::test]
    async fn test_overdue_key_rotates_on_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);
        let mut overdue = ApiKeyRecord::new(
            "alice".into(),
            "default".into(),
            generate_secret(),
            1,
            Utc::now() - Duration::days(3),
        );
        overdue.next_rotation_at = Utc::now() - Duration::days(2);
        let original_secret = overdue.secret.clone();
        std::fs::write(&path, serde_json::to_vec_pretty(&vec![overdue.clone()]).unwrap()).unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let service = service_in(&dir, notifier.clone()).await;

        let mut rotated = None;
        for _ in 0..100 {
            let record = record_of(&service, overdue.id).await;
            if !record.history.is_empty() {
                rotated = Some(record);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let rotated = rotated.expect("overdue key was not rotated");
        assert_eq!(rotated.history[0].secret, original_secret);
        assert!(rotated.next_rotation_at > Utc::now());
        assert!(service.is_scheduled(overdue.id));

        let events = wait_for_events(&notifier, 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, RotationTrigger::Scheduled);
    }

    #[tokio::test]
    async fn test_premature_fire_rearms_without_rotating() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        assert_eq!(service.rotate_due(issued.id).await.unwrap(), None);

        let record = record_of(&service, issued.id).await;
        assert!(record.history.is_empty());
        assert_eq!(record.secret, issued.secret);
        assert!(service.is_scheduled(issued.id));
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_rotation() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir, Arc::new(FailingNotifier)).await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        let secret = service.rotate_manual(issued.id, "alice").await.unwrap();

        assert!(service.verify(&secret).await.valid);
    }

    #[tokio::test]
    async fn test_manual_rotation_notifies() {
        let dir = tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let service = service_in(&dir, notifier.clone()).await;
        let issued = service.issue("alice", Some("cli".into()), 7).await.unwrap();

        service.rotate_manual(issued.id, "alice").await.unwrap();

        let events = wait_for_events(&notifier, 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key_id, issued.id);
        assert_eq!(events[0].owner_id.as_deref(), Some("alice"));
        assert_eq!(events[0].label, "cli");
        assert_eq!(events[0].trigger, RotationTrigger::Manual);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_do_not_lose_updates() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.rotate_manual(issued.id, "alice").await.unwrap()
            }));
        }

        let mut secrets = HashSet::new();
        for handle in handles {
            secrets.insert(handle.await.unwrap());
        }

        let record = record_of(&service, issued.id).await;
        assert_eq!(secrets.len(), 16);
        assert_eq!(record.history.len(), 16);
        assert!(secrets.contains(&record.secret));

        let superseded: HashSet<_> = record.history.iter().map(|h| h.secret.clone()).collect();
        assert_eq!(superseded.len(), 16);
        assert!(superseded.contains(&issued.secret));
    }

    #[tokio::test]
    async fn test_history_retention_setting_caps_history() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load(dir.path().join(DOCUMENT_NAME)).await;
        let service = RotationService::new(
            store,
            Arc::new(LogNotifier),
            RotationSettings {
                history_retention: Some(2),
            },
        );
        service.init().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        for _ in 0..5 {
            service.rotate_now(issued.id).await.unwrap();
        }

        assert_eq!(record_of(&service, issued.id).await.history.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_persist_surfaces_and_keeps_state() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let store = KeyStore::load(data.join(DOCUMENT_NAME)).await;
        let service = RotationService::new(store, Arc::new(LogNotifier), RotationSettings::default());
        service.init().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, b"blocker").unwrap();

        let result = service.rotate_manual(issued.id, "alice").await;

        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert!(service.verify(&issued.secret).await.valid);
        assert!(record_of(&service, issued.id).await.history.is_empty());
    }

    #[tokio::test]
    async fn test_failed_scheduled_rotation_rearms_timer() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let overdue = write_overdue_key(&data, 1);
        let store = KeyStore::load(data.join(DOCUMENT_NAME)).await;
        let service = RotationService::new(store, Arc::new(LogNotifier), RotationSettings::default());
        block_writes(&data);

        let result = service.rotate_due(overdue.id).await;

        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert!(service.is_scheduled(overdue.id));
        let record = record_of(&service, overdue.id).await;
        assert!(record.active);
        assert!(record.history.is_empty());
    }

    #[tokio::test]
    async fn test_timer_survives_failed_write_after_firing() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let overdue = write_overdue_key(&data, 1);
        let store = KeyStore::load(data.join(DOCUMENT_NAME)).await;
        let service = RotationService::new(store, Arc::new(LogNotifier), RotationSettings::default());
        block_writes(&data);

        service.init().await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert!(service.is_scheduled(overdue.id));
        assert!(record_of(&service, overdue.id).await.history.is_empty());
    }

    #[tokio::test]
    async fn test_overdue_zero_period_key_rotates_once() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let overdue = write_overdue_key(&data, 0);
        let store = KeyStore::load(data.join(DOCUMENT_NAME)).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let service = RotationService::new(store, notifier.clone(), RotationSettings::default());

        service.init().await;
        wait_for_events(&notifier, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let record = record_of(&service, overdue.id).await;
        assert_eq!(record.rotation_period_days, 1);
        assert_eq!(record.history.len(), 1);
        assert!(record.next_rotation_at > Utc::now());
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_key_locks_do_not_accumulate() {
        let (_dir, service) = service().await;

        for _ in 0..1000 {
            let unknown = Uuid::new_v4();
            assert!(service.rotate_manual(unknown, "mallory").await.is_err());
            assert!(service.deactivate(unknown, "mallory").await.is_err());
            assert!(service.reschedule(unknown, "mallory", 7).await.is_err());
            assert_eq!(service.rotate_due(unknown).await.unwrap(), None);
        }

        let issued = service.issue("alice", None, 7).await.unwrap();
        service.rotate_manual(issued.id, "alice").await.unwrap();
        service.reschedule(issued.id, "alice", 9).await.unwrap();
        service.deactivate(issued.id, "alice").await.unwrap();

        assert_eq!(service.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_superseded_secret_is_not_recorded_as_used() {
        let (_dir, service) = service().await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        // Lookup matched the old secret, then a rotation landed before the stamp.
        service.rotate_now(issued.id).await.unwrap();
        let outcome = service.record_use(issued.id, &issued.secret).await;

        assert_eq!(outcome, VerifyOutcome::invalid());
        assert!(record_of(&service, issued.id).await.last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_slow_notifier_does_not_block_rotations() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir, Arc::new(SlowNotifier)).await;
        let issued = service.issue("alice", None, 7).await.unwrap();

        let rotations = async {
            service.rotate_manual(issued.id, "alice").await.unwrap();
            service.rotate_manual(issued.id, "alice").await.unwrap();
        };
        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), rotations).await;

        assert!(finished.is_ok());
        assert_eq!(record_of(&service, issued.id).await.history.len(), 2);
    }

    #[tokio::test]
    async fn test_key_lifecycle_scenario() {
        let (_dir, service) = service().await;
        let before = Utc::now();

        let issued = service.issue("alice", None, 7).await.unwrap();
        assert!(issued.secret.starts_with("sk_") && issued.secret.len() >= 32);
        assert!(issued.expires_at >= before + Duration::days(7));

        let rotated = service.rotate_manual(issued.id, "alice").await.unwrap();
        assert_ne!(rotated, issued.secret);
        assert_eq!(record_of(&service, issued.id).await.history.len(), 1);

        let snapshot = record_of(&service, issued.id).await;
        assert!(matches!(
            service.rotate_manual(issued.id, "bob").await,
            Err(AppError::KeyNotFound)
        ));
        assert_eq!(record_of(&service, issued.id).await, snapshot);

        let reschedule_at = Utc::now();
        let info = service.reschedule(issued.id, "alice", 30).await.unwrap();
        assert!(info.kadaluarsa >= reschedule_at + Duration::days(30));
        assert!(info.kadaluarsa <= Utc::now() + Duration::days(30));

        service.deactivate(issued.id, "alice").await.unwrap();
        assert_eq!(service.verify(&rotated).await, VerifyOutcome::invalid());
    }
}
