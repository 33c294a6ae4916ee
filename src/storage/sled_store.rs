//! Durable position store on sled
//!
//! Two trees:
//! - `current_positions`: tag id -> JSON `CurrentPosition`
//! - `calculated_positions`: tag id length (u32 big-endian), tag id, monotonic sequence
//!   (big-endian) -> JSON `CalculatedPosition`, so one tag's history is a contiguous,
//!   insertion-ordered range that no other tag id can share a prefix with

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use std::path::Path;

use super::{PositionStore, UpsertOutcome};
use crate::core::{BatchId, CalculatedPosition, CurrentPosition};
use crate::utils::config::CurrentPositionPolicy;
use crate::validation::error::StorageError;

const CURRENT_TREE: &str = "current_positions";
const HISTORY_TREE: &str = "calculated_positions";

pub struct SledPositionStore {
    db: Db,
    current: Tree,
    history: Tree,
    policy: CurrentPositionPolicy,
}

impl SledPositionStore {
    /// Opens or creates the store at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P, policy: CurrentPositionPolicy) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db, policy)
    }

    pub fn from_db(db: Db, policy: CurrentPositionPolicy) -> Result<Self, StorageError> {
        let current = db.open_tree(CURRENT_TREE)?;
        let history = db.open_tree(HISTORY_TREE)?;
        Ok(Self {
            db,
            current,
            history,
            policy,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn history_prefix(tag_id: &str) -> Vec<u8> {
        let tag = tag_id.as_bytes();
        let mut prefix = Vec::with_capacity(tag.len() + 4);
        prefix.extend_from_slice(&(tag.len() as u32).to_be_bytes());
        prefix.extend_from_slice(tag);
        prefix
    }
}

fn decode<T: DeserializeOwned>(key: &[u8], value: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(value).map_err(|source| StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        source,
    })
}

/// Run a sled operation on the blocking pool
async fn off_runtime<T, F>(op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StorageError::Backend(format!("storage task failed: {}", e)))?
}

#[async_trait]
impl PositionStore for SledPositionStore {
    async fn record_calculated_position(&self, record: CalculatedPosition) -> Result<(), StorageError> {
        let db = self.db.clone();
        let history = self.history.clone();
        off_runtime(move || {
            let mut key = Self::history_prefix(&record.tag_id);
            key.extend_from_slice(&db.generate_id()?.to_be_bytes());
            history.insert(key, serde_json::to_vec(&record)?)?;
            Ok(())
        })
        .await
    }

    async fn upsert_current_position(&self, current: CurrentPosition) -> Result<UpsertOutcome, StorageError> {
        let tree = self.current.clone();
        let policy = self.policy;
        off_runtime(move || {
            let key = current.tag_id.as_bytes();
            let encoded = serde_json::to_vec(&current)?;

            // Compare-and-swap on the tag's own key; retries only race against the same tag
            loop {
                let existing = tree.get(key)?;
                let outcome = match &existing {
                    Some(raw) => {
                        let stored: CurrentPosition = decode(key, raw)?;
                        if !policy.should_replace(&stored, &current) {
                            return Ok(UpsertOutcome::KeptExisting);
                        }
                        UpsertOutcome::Replaced
                    }
                    None => UpsertOutcome::Inserted,
                };

                match tree.compare_and_swap(key, existing, Some(encoded.clone()))? {
                    Ok(()) => return Ok(outcome),
                    Err(_) => continue,
                }
            }
        })
        .await
    }

    async fn get_current_position(&self, tag_id: &str) -> Result<Option<CurrentPosition>, StorageError> {
        let tree = self.current.clone();
        let tag_id = tag_id.to_string();
        off_runtime(move || match tree.get(tag_id.as_bytes())? {
            Some(raw) => Ok(Some(decode(tag_id.as_bytes(), &raw)?)),
            None => Ok(None),
        })
        .await
    }

    async fn list_current_positions(&self) -> Result<Vec<CurrentPosition>, StorageError> {
        let tree = self.current.clone();
        off_runtime(move || {
            tree.iter()
                .map(|item| {
                    let (key, raw) = item?;
                    decode(&key, &raw)
                })
                .collect()
        })
        .await
    }

    async fn remove_tag(&self, tag_id: &str) -> Result<bool, StorageError> {
        let tree = self.current.clone();
        let tag_id = tag_id.to_string();
        off_runtime(move || Ok(tree.remove(tag_id.as_bytes())?.is_some())).await
    }

    async fn history_for_tag(
        &self,
        tag_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CalculatedPosition>, StorageError> {
        let history = self.history.clone();
        let prefix = Self::history_prefix(tag_id);
        off_runtime(move || {
            history
                .scan_prefix(prefix)
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .map(|item| {
                    let (key, raw) = item?;
                    decode(&key, &raw)
                })
                .collect()
        })
        .await
    }

    async fn positions_for_batch(&self, batch_id: BatchId) -> Result<Vec<CalculatedPosition>, StorageError> {
        let history = self.history.clone();
        off_runtime(move || {
            let mut rows = Vec::new();
            for item in history.iter() {
                let (key, raw) = item?;
                let record: CalculatedPosition = decode(&key, &raw)?;
                if record.batch_id == batch_id {
                    rows.push(record);
                }
            }
            // Keys sort by tag length first; order by tag id like the in-memory store
            rows.sort_by(|a, b| a.tag_id.cmp(&b.tag_id));
            Ok(rows)
        })
        .await
    }
}
