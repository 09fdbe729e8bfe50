//! JSON document store for API key records.
//!
//! The whole collection lives in memory behind an async `RwLock` and is
//! written out as a single pretty-printed JSON array after every mutation.
//!
//! # Durability
//!
//! - Mutations hold the write lock across apply + persist, so documents are
//!   written one at a time and always reflect the latest state
//! - Documents are written to a sibling temp file, synced, and renamed into place
//! - Loaded records with a rotation period outside `1..=365` are clamped
//! - A failed persist rolls the in-memory change back before returning the error

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::{io::AsyncWriteExt, sync::RwLock};
use uuid::Uuid;

use crate::models::api_key::ApiKeyRecord;

/// File name of the key document inside the data directory.
pub const DOCUMENT_NAME: &str = "apikeys.json";

/// Errors raised while writing the key document.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent collection of [`ApiKeyRecord`]s.
#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    records: RwLock<Vec<ApiKeyRecord>>,
}

impl KeyStore {
    /// Load the key document at `path`.
    ///
    /// A missing, unreadable or malformed document is logged and replaced by
    /// an empty collection, which is written out immediately. This never
    /// fails: the service always starts, even if empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<ApiKeyRecord>>(&bytes) {
                Ok(records) => Some(records),
                Err(e) => {
                    tracing::warn!(
                        "Key document {} is malformed, starting empty: {}",
                        path.display(),
                        e
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No key document at {}, creating one", path.display());
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Key document {} is unreadable, starting empty: {}",
                    path.display(),
                    e
                );
                None
            }
        };

        let store = Self {
            path,
            records: RwLock::new(Vec::new()),
        };

        match records {
            Some(mut records) => {
                tracing::info!("Loaded {} API keys", records.len());

                let now = Utc::now();
                let mut clamped = 0;
                for record in records.iter_mut() {
                    let period = record.rotation_period_days;
                    if record.clamp_period(now) {
                        tracing::warn!(
                            "Key {} had rotation period {} days, clamped to {}",
                            record.id,
                            period,
                            record.rotation_period_days
                        );
                        clamped += 1;
                    }
                }

                *store.records.write().await = records;

                if clamped > 0 {
                    if let Err(e) = store.persist().await {
                        tracing::error!(
                            "Failed to write clamped key document {}: {}",
                            store.path.display(),
                            e
                        );
                    }
                }
            }
            None => {
                if let Err(e) = store.persist().await {
                    tracing::error!(
                        "Failed to write empty key document {}: {}",
                        store.path.display(),
                        e
                    );
                }
            }
        }

        store
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every record.
    pub async fn find_all(&self) -> Vec<ApiKeyRecord> {
        self.records.read().await.clone()
    }

    /// First record matching `predicate`.
    pub async fn find<P>(&self, predicate: P) -> Option<ApiKeyRecord>
    where
        P: Fn(&ApiKeyRecord) -> bool,
    {
        self.records
            .read()
            .await
            .iter()
            .find(|r| predicate(r))
            .cloned()
    }

    /// Every record matching `predicate`, in storage order.
    pub async fn filter<P>(&self, predicate: P) -> Vec<ApiKeyRecord>
    where
        P: Fn(&ApiKeyRecord) -> bool,
    {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Insert a record and persist.
    pub async fn append(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.push(record);

        if let Err(e) = write_document(&self.path, &records).await {
            records.pop();
            return Err(e);
        }

        Ok(())
    }

    /// Apply `f` to the record with `id` and persist.
    ///
    /// Returns `Ok(None)` when no record has that id. The closure's result is
    /// handed back on success; on a failed write the record is restored to
    /// what it was before `f` ran.
    pub async fn mutate<F, T>(&self, id: Uuid, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut ApiKeyRecord) -> T,
    {
        let mut records = self.records.write().await;

        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };

        let before = records[index].clone();
        let result = f(&mut records[index]);

        if let Err(e) = write_document(&self.path, &records).await {
            records[index] = before;
            return Err(e);
        }

        Ok(Some(result))
    }

    /// Write the full collection to disk.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let records = self.records.read().await;
        write_document(&self.path, &records).await
    }
}

/// Serialize `records` and atomically replace the document at `path`.
async fn write_document(path: &Path, records: &[ApiKeyRecord]) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(records)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;

    Ok(())
}
