use std::time::Duration;

use thiserror::Error;

/// Errors from the object store and the image record store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Error reported by the storage backend (S3, filesystem, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation did not finish within its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A concurrent writer holds the record; the caller may retry
    #[error("Conflicting concurrent update on {0}")]
    Conflict(String),

    /// A location could not be parsed or does not belong to this store
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Backend(_)
                | StoreError::Connection(_)
                | StoreError::Timeout { .. }
                | StoreError::Conflict(_)
        )
    }
}

/// A raw transformation mapping was rejected.
///
/// Both lists are complete: every unrecognized key and every malformed
/// parameter found in the mapping is reported, not just the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe_spec_error(.unknown_keys, .problems))]
pub struct SpecError {
    /// Operation names outside the supported set
    pub unknown_keys: Vec<String>,

    /// Human-readable problems with recognized operations
    pub problems: Vec<String>,
}

impl SpecError {
    /// A rejection with a single malformed-input message.
    pub fn malformed(problem: impl Into<String>) -> Self {
        Self {
            unknown_keys: Vec::new(),
            problems: vec![problem.into()],
        }
    }
}

fn describe_spec_error(unknown_keys: &[String], problems: &[String]) -> String {
    let mut parts = Vec::new();
    if !unknown_keys.is_empty() {
        parts.push(format!(
            "Invalid transformations: {}",
            unknown_keys.join(", ")
        ));
    }
    parts.extend(problems.iter().cloned());
    if parts.is_empty() {
        "Invalid transformations".to_string()
    } else {
        parts.join("; ")
    }
}

/// Errors raised while applying a transform pipeline to image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// Input bytes are not a decodable image
    #[error("Failed to decode image: {message}")]
    DecodeFailure { message: String },

    /// An operation cannot be applied to the current image state
    #[error("Operation '{op}' failed: {message}")]
    OperationFailure { op: &'static str, message: String },

    /// The final image could not be encoded
    #[error("Failed to encode image as {format}: {message}")]
    EncodeFailure { format: String, message: String },
}

/// Errors from job queue backends.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Filesystem error in a durable queue
    #[error("Queue I/O error: {0}")]
    Io(String),

    /// A message could not be (de)serialized
    #[error("Malformed queue message: {0}")]
    Serialization(String),

    /// The delivery's lease expired and the message was handed to another consumer
    #[error("Delivery {0} is no longer held by this consumer")]
    StaleDelivery(String),

    /// The queue was closed
    #[error("Queue closed")]
    Closed,
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Errors returned by the synchronous service operations.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Transformation mapping rejected; nothing was enqueued
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),

    /// Upload rejected before anything was stored
    #[error("{0}")]
    InvalidUpload(String),

    /// Image does not exist or belongs to another user
    #[error("Image not found: {image_id}")]
    NotFound { image_id: String },

    /// Object or record store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Job queue failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A record could not be written to the cache
    #[error("Cache error: {0}")]
    Cache(String),
}

/// Errors from a single worker attempt at a job.
///
/// Each variant is either transient (the job is redelivered) or permanent
/// (the job is dead-lettered and the failure recorded on the image).
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The image record no longer exists
    #[error("Image record {0} not found")]
    RecordMissing(String),

    /// Fetching the original bytes failed
    #[error("Fetching original failed: {0}")]
    Fetch(StoreError),

    /// The transform engine rejected the image or spec
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Uploading the variant bytes failed
    #[error("Uploading variant failed: {0}")]
    Upload(StoreError),

    /// Appending the variant to the record failed
    #[error("Persisting variant failed: {0}")]
    Persist(StoreError),

    /// The blocking transform task panicked or was cancelled
    #[error("Transform task aborted: {0}")]
    Aborted(String),

    /// The job was delivered more often than the retry policy allows,
    /// typically because earlier attempts never settled
    #[error("Gave up after {attempts} delivery attempts (max {max})")]
    AttemptsExhausted { attempts: u32, max: u32 },
}

impl JobError {
    /// Whether the job should be redelivered.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::RecordMissing(_) => false,
            // A missing original may still be propagating in eventually-consistent storage
            JobError::Fetch(StoreError::NotFound(_)) => true,
            JobError::Fetch(e) | JobError::Upload(e) | JobError::Persist(e) => e.is_transient(),
            JobError::Transform(_) => false,
            JobError::Aborted(_) => true,
            JobError::AttemptsExhausted { .. } => false,
        }
    }
}
