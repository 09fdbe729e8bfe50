//! Per-key rotation timers.
//!
//! Every active key owns one pending tokio task that sleeps until the key's
//! `next_rotation_at` and then sends the key id down the trigger channel.
//! The scheduler never touches records itself; whoever drains the channel
//! decides whether the key really is due.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::api_key::ApiKeyRecord;

/// Receiving side of the trigger channel.
pub type TriggerReceiver = mpsc::UnboundedReceiver<Uuid>;

/// Map of key id to its pending timer task.
#[derive(Debug)]
pub struct Scheduler {
    jobs: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    triggers: mpsc::UnboundedSender<Uuid>,
}

impl Scheduler {
    /// Create a scheduler and the receiver its timers fire into.
    pub fn new() -> (Self, TriggerReceiver) {
        let (triggers, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            jobs: Mutex::new(HashMap::new()),
            triggers,
        };
        (scheduler, receiver)
    }

    /// Arm a timer that fires at `due_at`, replacing any existing one for the key.
    ///
    /// A `due_at` in the past fires right away.
    pub fn schedule(&self, key_id: Uuid, due_at: DateTime<Utc>) {
        let delay = (due_at - Utc::now()).to_std().unwrap_or_default();
        let triggers = self.triggers.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if triggers.send(key_id).is_err() {
                tracing::debug!("Trigger channel closed, dropping fire for key {}", key_id);
            }
        });

        if let Some(previous) = self.jobs().insert(key_id, handle) {
            previous.abort();
        }

        tracing::debug!("Key {} scheduled for rotation at {}", key_id, due_at);
    }

    /// Stop and forget the key's timer. Returns whether one was present.
    pub fn cancel(&self, key_id: Uuid) -> bool {
        match self.jobs().remove(&key_id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!("Rotation timer for key {} cancelled", key_id);
                true
            }
            None => false,
        }
    }

    /// Cancel then schedule at the new due time.
    pub fn reschedule(&self, key_id: Uuid, due_at: DateTime<Utc>) {
        self.cancel(key_id);
        self.schedule(key_id, due_at);
    }

    /// Arm a timer for every active record. Returns how many were armed.
    pub fn restore_all(&self, records: &[ApiKeyRecord]) -> usize {
        let mut restored = 0;
        for record in records.iter().filter(|r| r.active) {
            self.schedule(record.id, record.next_rotation_at);
            restored += 1;
        }
        restored
    }

    /// Whether the key has a timer that has not fired yet.
    pub fn is_scheduled(&self, key_id: Uuid) -> bool {
        self.jobs()
            .get(&key_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of timers that have not fired yet.
    pub fn job_count(&self) -> usize {
        self.jobs().values().filter(|h| !h.is_finished()).count()
    }

    /// Abort every timer.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs();
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
