//! Image records and their persistence.
//!
//! An [`ImageRecord`] is created once per upload. Afterwards the only
//! mutations are appending a [`Variant`] (a finished transform) or a
//! [`TransformFailure`] (a dead-lettered one); neither list ever shrinks.
//!
//! Appends must be safe under concurrent callers: two workers finishing jobs
//! on the same image both see their variant persisted.

mod fs;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::transform::TransformSpec;

pub use fs::FsRecordStore;
pub use memory::MemoryRecordStore;

// =============================================================================
// Data Model
// =============================================================================

/// Upload metadata, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// One transformed output of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub location: String,
    pub spec: TransformSpec,
    pub created_at: DateTime<Utc>,

    /// Job that produced this variant; a second append with the same id is a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// A transform that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformFailure {
    pub spec: TransformSpec,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// An uploaded image and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: String,
    pub owner_id: String,
    pub original_location: String,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub failures: Vec<TransformFailure>,
    pub metadata: ImageMetadata,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A fresh record with a new id and no variants.
    pub fn new(
        owner_id: impl Into<String>,
        original_location: impl Into<String>,
        metadata: ImageMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            original_location: original_location.into(),
            variants: Vec::new(),
            failures: Vec::new(),
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Append `variant` unless one from the same job is already present.
    pub fn push_variant(&mut self, variant: Variant) -> AppendOutcome {
        if let Some(job_id) = &variant.job_id {
            if self.variants.iter().any(|v| v.job_id.as_ref() == Some(job_id)) {
                return AppendOutcome::Duplicate;
            }
        }
        self.variants.push(variant);
        AppendOutcome::Appended
    }

    /// Append `failure` unless one from the same job is already present.
    pub fn push_failure(&mut self, failure: TransformFailure) -> AppendOutcome {
        if let Some(job_id) = &failure.job_id {
            if self.failures.iter().any(|f| f.job_id.as_ref() == Some(job_id)) {
                return AppendOutcome::Duplicate;
            }
        }
        self.failures.push(failure);
        AppendOutcome::Appended
    }
}

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry from the same job was already recorded
    Duplicate,
}

/// One page of a user's records plus the total across all pages.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPage {
    pub records: Vec<ImageRecord>,
    pub total: u64,
}

// =============================================================================
// ImageRecordStore
// =============================================================================

/// Durable storage of image records.
#[async_trait]
pub trait ImageRecordStore: Send + Sync {
    /// Persist a new record and return its id.
    ///
    /// Fails with `Conflict` if a record with the same id exists.
    async fn create(&self, record: ImageRecord) -> Result<String, StoreError>;

    /// Fetch a record regardless of owner.
    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError>;

    /// Fetch a record only if it belongs to `owner_id`.
    async fn find_by_id(
        &self,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.get(id).await?.filter(|r| r.owner_id == owner_id))
    }

    /// Atomically append a variant.
    ///
    /// Returns `NotFound` if the record does not exist and `Conflict` if a
    /// concurrent writer prevented the append (the caller may retry).
    async fn append_variant(&self, id: &str, variant: Variant)
        -> Result<AppendOutcome, StoreError>;

    /// Atomically append a failure entry. Same error contract as `append_variant`.
    async fn record_failure(
        &self,
        id: &str,
        failure: TransformFailure,
    ) -> Result<AppendOutcome, StoreError>;

    /// Records owned by `owner_id`, newest first. `page` is 1-based.
    async fn list(&self, owner_id: &str, page: u32, limit: u32) -> Result<RecordPage, StoreError>;
}

/// Sort newest first and cut out one page.
pub(crate) fn paginate(mut records: Vec<ImageRecord>, page: u32, limit: u32) -> RecordPage {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let total = records.len() as u64;
    let skip = (page.max(1) as usize - 1).saturating_mul(limit as usize);
    let records = records
        .into_iter()
        .skip(skip)
        .take(limit as usize)
        .collect();
    RecordPage { records, total }
}
