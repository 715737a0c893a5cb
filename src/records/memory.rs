use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    paginate, AppendOutcome, ImageRecord, ImageRecordStore, RecordPage, TransformFailure, Variant,
};
use crate::error::StoreError;

/// In-process record store. Appends happen under a write lock.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ImageRecordStore for MemoryRecordStore {
    async fn create(&self, record: ImageRecord) -> Result<String, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id));
        }
        let id = record.id.clone();
        records.insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn append_variant(
        &self,
        id: &str,
        variant: Variant,
    ) -> Result<AppendOutcome, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(record.push_variant(variant))
    }

    async fn record_failure(
        &self,
        id: &str,
        failure: TransformFailure,
    ) -> Result<AppendOutcome, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(record.push_failure(failure))
    }

    async fn list(&self, owner_id: &str, page: u32, limit: u32) -> Result<RecordPage, StoreError> {
        let owned = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        Ok(paginate(owned, page, limit))
    }
}
