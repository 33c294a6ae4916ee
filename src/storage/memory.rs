use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{PositionStore, UpsertOutcome};
use crate::core::{BatchId, CalculatedPosition, CurrentPosition};
use crate::utils::config::CurrentPositionPolicy;
use crate::validation::error::StorageError;

/// In-memory store; per-tag shards of a `DashMap` give key-level isolation
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    policy: CurrentPositionPolicy,
    current: DashMap<String, CurrentPosition>,
    history: DashMap<String, Vec<CalculatedPosition>>,
}

impl InMemoryPositionStore {
    pub fn new(policy: CurrentPositionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> CurrentPositionPolicy {
        self.policy
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn record_calculated_position(&self, record: CalculatedPosition) -> Result<(), StorageError> {
        self.history.entry(record.tag_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn upsert_current_position(&self, current: CurrentPosition) -> Result<UpsertOutcome, StorageError> {
        match self.current.entry(current.tag_id.clone()) {
            Entry::Occupied(mut slot) => {
                if self.policy.should_replace(slot.get(), &current) {
                    slot.insert(current);
                    Ok(UpsertOutcome::Replaced)
                } else {
                    Ok(UpsertOutcome::KeptExisting)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(current);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get_current_position(&self, tag_id: &str) -> Result<Option<CurrentPosition>, StorageError> {
        Ok(self.current.get(tag_id).map(|row| row.value().clone()))
    }

    async fn list_current_positions(&self) -> Result<Vec<CurrentPosition>, StorageError> {
        let mut rows: Vec<CurrentPosition> = self.current.iter().map(|row| row.value().clone()).collect();
        rows.sort_by(|a, b| a.tag_id.cmp(&b.tag_id));
        Ok(rows)
    }

    async fn remove_tag(&self, tag_id: &str) -> Result<bool, StorageError> {
        Ok(self.current.remove(tag_id).is_some())
    }

    async fn history_for_tag(
        &self,
        tag_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CalculatedPosition>, StorageError> {
        let rows: Vec<CalculatedPosition> = match self.history.get(tag_id) {
            Some(rows) => rows
                .iter()
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(rows)
    }

    async fn positions_for_batch(&self, batch_id: BatchId) -> Result<Vec<CalculatedPosition>, StorageError> {
        let mut rows: Vec<CalculatedPosition> = self
            .history
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|r| r.batch_id == batch_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_by(|a, b| a.tag_id.cmp(&b.tag_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Point3;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn fix(tag_id: &str, batch_id: BatchId, x: f64) -> CalculatedPosition {
        CalculatedPosition {
            batch_id,
            tag_id: tag_id.to_string(),
            position: Point3::new(x, 0.0, 1.0),
            accuracy: 0.05,
            calculated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_not_found() {
        let store = InMemoryPositionStore::default();
        assert!(store.get_current_position("tag-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_last_write_wins() {
        let store = InMemoryPositionStore::new(CurrentPositionPolicy::LastWriteWins);
        let later = fix("tag-1", BatchId::new(), 1.0);
        let earlier = fix("tag-1", BatchId::new(), 2.0);
        let now = Utc::now();

        let first = CurrentPosition::from_calculated(&later, now);
        let second = CurrentPosition::from_calculated(&earlier, now - Duration::seconds(30));

        assert_eq!(store.upsert_current_position(first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_current_position(second).await.unwrap(), UpsertOutcome::Replaced);

        let row = store.get_current_position("tag-1").await.unwrap().unwrap();
        assert_eq!(row.position.x, 2.0);
    }

    #[tokio::test]
    async fn test_upsert_newest_measurement_wins() {
        let store = InMemoryPositionStore::new(CurrentPositionPolicy::NewestMeasurementWins);
        let now = Utc::now();

        let newer = CurrentPosition::from_calculated(&fix("tag-1", BatchId::new(), 1.0), now);
        let stale = CurrentPosition::from_calculated(
            &fix("tag-1", BatchId::new(), 2.0),
            now - Duration::seconds(30),
        );

        store.upsert_current_position(newer).await.unwrap();
        assert_eq!(
            store.upsert_current_position(stale).await.unwrap(),
            UpsertOutcome::KeptExisting
        );

        let row = store.get_current_position("tag-1").await.unwrap().unwrap();
        assert_eq!(row.position.x, 1.0);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_by_batch() {
        let store = InMemoryPositionStore::default();
        let batch_a = BatchId::new();
        let batch_b = BatchId::new();

        store.record_calculated_position(fix("tag-1", batch_a, 1.0)).await.unwrap();
        store.record_calculated_position(fix("tag-2", batch_a, 5.0)).await.unwrap();
        store.record_calculated_position(fix("tag-1", batch_b, 2.0)).await.unwrap();

        let history = store.history_for_tag("tag-1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].batch_id, batch_b);

        let limited = store.history_for_tag("tag-1", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        let in_batch = store.positions_for_batch(batch_a).await.unwrap();
        let tags: Vec<&str> = in_batch.iter().map(|r| r.tag_id.as_str()).collect();
        assert_eq!(tags, vec!["tag-1", "tag-2"]);
    }

    #[tokio::test]
    async fn test_remove_tag_keeps_history() {
        let store = InMemoryPositionStore::default();
        let record = fix("tag-1", BatchId::new(), 1.0);
        store.record_calculated_position(record.clone()).await.unwrap();
        store
            .upsert_current_position(CurrentPosition::from_calculated(&record, Utc::now()))
            .await
            .unwrap();

        assert!(store.remove_tag("tag-1").await.unwrap());
        assert!(!store.remove_tag("tag-1").await.unwrap());
        assert!(store.get_current_position("tag-1").await.unwrap().is_none());
        assert_eq!(store.history_for_tag("tag-1", None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_for_many_tags() {
        let store = Arc::new(InMemoryPositionStore::default());
        let mut handles = Vec::new();

        for t in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let tag = format!("tag-{}", t);
                for i in 0..50 {
                    let record = fix(&tag, BatchId::new(), i as f64);
                    store.record_calculated_position(record.clone()).await.unwrap();
                    store
                        .upsert_current_position(CurrentPosition::from_calculated(&record, Utc::now()))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = store.list_current_positions().await.unwrap();
        assert_eq!(rows.len(), 16);
        for row in rows {
            assert_eq!(row.position.x, 49.0);
            assert_eq!(store.history_for_tag(&row.tag_id, None).await.unwrap().len(), 50);
        }
    }
}
