//! The synchronous side of the pipeline.
//!
//! [`ImageService`] backs the HTTP API: it stores uploads, validates
//! transform requests and enqueues them, and serves image records through
//! the read-through cache. It never transforms images itself.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{image_key, RecordCache, DEFAULT_CACHE_TTL};
use crate::error::{ServiceError, SpecError};
use crate::queue::{JobQueue, TransformJob};
use crate::records::{ImageMetadata, ImageRecord, ImageRecordStore};
use crate::storage::ObjectStore;
use crate::transform::{decode_limits, TransformSpec};

/// Default upload size limit: 5MB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Upload types accepted by default.
pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

const MAX_FILENAME_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_upload_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub cache_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// An accepted transform request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformAccepted {
    pub image_id: String,
    pub job_id: String,
    pub transformations: TransformSpec,
}

/// One page of a user's images.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePage {
    pub images: Vec<ImageRecord>,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u32,
    pub limit: u32,
}

pub struct ImageService {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ImageRecordStore>,
    queue: Arc<dyn JobQueue>,
    cache: Arc<RecordCache>,
    config: ServiceConfig,
}

impl ImageService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ImageRecordStore>,
        queue: Arc<dyn JobQueue>,
        cache: Arc<RecordCache>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            objects,
            records,
            queue,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    /// Store an uploaded original and create its record.
    ///
    /// Rejects empty, oversized, disallowed or undecodable uploads before
    /// anything is written. Both the declared type and the type detected
    /// from the content must be allowed; the detected one is stored.
    pub async fn submit_upload(
        &self,
        user_id: &str,
        bytes: Bytes,
        filename: &str,
        mime_type: &str,
    ) -> Result<ImageRecord, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::InvalidUpload(
                "No image file provided".to_string(),
            ));
        }
        if bytes.len() > self.config.max_upload_bytes {
            return Err(ServiceError::InvalidUpload(format!(
                "File too large: {} bytes (max {})",
                bytes.len(),
                self.config.max_upload_bytes
            )));
        }
        if !self
            .config
            .allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
        {
            return Err(ServiceError::InvalidUpload(format!(
                "Unsupported file type '{}'; allowed: {}",
                mime_type,
                self.config.allowed_mime_types.join(", ")
            )));
        }
        let mime_type = sniff_upload(&bytes, &self.config.allowed_mime_types)?;

        let name = format!(
            "images/{}-{}",
            uuid::Uuid::new_v4().simple(),
            sanitize_filename(filename)
        );
        let size_bytes = bytes.len() as u64;
        let location = self.objects.put(&name, bytes, mime_type).await?;

        let record = ImageRecord::new(
            user_id,
            location,
            ImageMetadata {
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes,
            },
        );
        self.records.create(record.clone()).await?;

        info!(
            image_id = %record.id,
            user_id = %user_id,
            size_bytes,
            "Image uploaded"
        );
        Ok(record)
    }

    /// Validate `raw` and enqueue a transform job for the caller's image.
    ///
    /// `raw` is the `transformations` value of the request; `Null` means it
    /// was missing. Nothing is enqueued unless both the spec and the image
    /// check out.
    pub async fn request_transform(
        &self,
        user_id: &str,
        image_id: &str,
        raw: &Value,
    ) -> Result<TransformAccepted, ServiceError> {
        if raw.is_null() {
            return Err(SpecError::malformed("Transformations required").into());
        }
        let spec = TransformSpec::from_value(raw)?;

        if self.records.find_by_id(image_id, user_id).await?.is_none() {
            return Err(ServiceError::NotFound {
                image_id: image_id.to_string(),
            });
        }

        let job = TransformJob::new(image_id, spec.clone());
        let job_id = job.job_id.clone().unwrap_or_default();
        self.queue.enqueue(job).await?;

        info!(
            image_id = %image_id,
            job_id = %job_id,
            operations = ?spec.operation_names(),
            "Transform queued"
        );
        Ok(TransformAccepted {
            image_id: image_id.to_string(),
            job_id,
            transformations: spec,
        })
    }

    /// Fetch the caller's image record, through the cache.
    pub async fn get_image(&self, user_id: &str, image_id: &str) -> Result<ImageRecord, ServiceError> {
        let key = image_key(image_id);
        let not_found = || ServiceError::NotFound {
            image_id: image_id.to_string(),
        };

        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_slice::<ImageRecord>(&cached) {
                Ok(record) if record.owner_id == user_id => {
                    debug!(image_id = %image_id, "Cache hit");
                    return Ok(record);
                }
                Ok(_) => return Err(not_found()),
                Err(e) => {
                    warn!(image_id = %image_id, error = %e, "Dropping undecodable cache entry");
                    self.cache.invalidate(&key).await;
                }
            }
        }

        let record = self
            .records
            .find_by_id(image_id, user_id)
            .await?
            .ok_or_else(not_found)?;

        let snapshot =
            serde_json::to_vec(&record).map_err(|e| ServiceError::Cache(e.to_string()))?;
        self.cache
            .set(key, Bytes::from(snapshot), self.config.cache_ttl)
            .await;
        debug!(image_id = %image_id, "Cache populated");

        Ok(record)
    }

    /// The caller's images, newest first.
    ///
    /// `page` is 1-based and defaults to 1; `limit` defaults to 10 and is
    /// clamped to 1..=100.
    pub async fn list_images(
        &self,
        user_id: &str,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ImagePage, ServiceError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);

        let result = self.records.list(user_id, page, limit).await?;
        Ok(ImagePage {
            images: result.records,
            total: result.total,
            total_pages: result.total.div_ceil(u64::from(limit)),
            current_page: page,
            limit,
        })
    }
}

/// Identify the upload from its content and make sure it decodes.
///
/// Returns the MIME type of the detected format, which must itself be
/// allowed whatever the client declared.
fn sniff_upload(bytes: &[u8], allowed: &[String]) -> Result<&'static str, ServiceError> {
    let invalid = |detail: String| {
        ServiceError::InvalidUpload(format!("File is not a valid image: {}", detail))
    };
    let mut reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?;

    let format = reader
        .format()
        .ok_or_else(|| invalid("unrecognized format".to_string()))?;
    let detected = format.to_mime_type();
    if !allowed.iter().any(|m| m.eq_ignore_ascii_case(detected)) {
        return Err(ServiceError::InvalidUpload(format!(
            "Unsupported file type '{}' detected from content; allowed: {}",
            detected,
            allowed.join(", ")
        )));
    }

    reader.limits(decode_limits());
    reader
        .into_dimensions()
        .map_err(|e| invalid(e.to_string()))?;
    Ok(detected)
}

/// Keep object names to a safe alphabet.
fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
