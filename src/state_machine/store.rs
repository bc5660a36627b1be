//! Persistence collaborators for [`RotationStateRecord`]s.
//!
//! Writes are compare-and-swap: the caller passes the record it read, and the
//! store refuses the write if someone else has changed it since.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::RotationStateRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rotation store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Loads and saves rotation state for creators.
#[async_trait]
pub trait RotationStore: Send + Sync {
    async fn load_rotation_state(
        &self,
        creator_id: &str,
    ) -> Result<Option<RotationStateRecord>, StoreError>;

    /// Store `record` if the current value still equals `expected`
    /// (`None` meaning "no record yet"). Returns `false` on a mismatch.
    async fn save_rotation_state(
        &self,
        record: &RotationStateRecord,
        expected: Option<&RotationStateRecord>,
    ) -> Result<bool, StoreError>;

    /// Remove the creator's record if it still equals `expected`.
    async fn delete_rotation_state(
        &self,
        creator_id: &str,
        expected: &RotationStateRecord,
    ) -> Result<bool, StoreError>;
}

fn compare_and_swap(
    records: &mut HashMap<String, RotationStateRecord>,
    record: &RotationStateRecord,
    expected: Option<&RotationStateRecord>,
) -> bool {
    if records.get(&record.creator_id) != expected {
        warn!(creator_id = %record.creator_id, "rotation state changed concurrently, refusing write");
        return false;
    }
    records.insert(record.creator_id.clone(), record.clone());
    true
}

fn compare_and_delete(
    records: &mut HashMap<String, RotationStateRecord>,
    creator_id: &str,
    expected: &RotationStateRecord,
) -> bool {
    if records.get(creator_id) != Some(expected) {
        return false;
    }
    records.remove(creator_id);
    true
}

/// Process-local store, mostly for tests and the demo command.
#[derive(Debug, Default)]
pub struct InMemoryRotationStore {
    records: Mutex<HashMap<String, RotationStateRecord>>,
}

impl InMemoryRotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, bypassing the optimistic check.
    pub fn insert(&self, record: RotationStateRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.creator_id.clone(), record);
    }

    pub fn get(&self, creator_id: &str) -> Option<RotationStateRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(creator_id)
            .cloned()
    }
}

#[async_trait]
impl RotationStore for InMemoryRotationStore {
    async fn load_rotation_state(
        &self,
        creator_id: &str,
    ) -> Result<Option<RotationStateRecord>, StoreError> {
        Ok(self.get(creator_id))
    }

    async fn save_rotation_state(
        &self,
        record: &RotationStateRecord,
        expected: Option<&RotationStateRecord>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(compare_and_swap(&mut records, record, expected))
    }

    async fn delete_rotation_state(
        &self,
        creator_id: &str,
        expected: &RotationStateRecord,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(compare_and_delete(&mut records, creator_id, expected))
    }
}

/// Keeps every creator's record in one JSON object on disk.
///
/// Writes go to a sibling `.tmp` file first and are renamed into place.
pub struct JsonFileRotationStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileRotationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, RotationStateRecord>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, records: &HashMap<String, RotationStateRecord>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = records.len(), "rotation state written");
        Ok(())
    }
}

#[async_trait]
impl RotationStore for JsonFileRotationStore {
    async fn load_rotation_state(
        &self,
        creator_id: &str,
    ) -> Result<Option<RotationStateRecord>, StoreError> {
        Ok(self.read_all().await?.remove(creator_id))
    }

    async fn save_rotation_state(
        &self,
        record: &RotationStateRecord,
        expected: Option<&RotationStateRecord>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await?;
        if !compare_and_swap(&mut records, record, expected) {
            return Ok(false);
        }
        self.write_all(&records).await?;
        Ok(true)
    }

    async fn delete_rotation_state(
        &self,
        creator_id: &str,
        expected: &RotationStateRecord,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await?;
        if !compare_and_delete(&mut records, creator_id, expected) {
            return Ok(false);
        }
        self.write_all(&records).await?;
        Ok(true)
    }
}
