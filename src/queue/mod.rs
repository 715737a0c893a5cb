//! Job queue carrying transform requests from the API to workers.
//!
//! Delivery is at-least-once. A received job is leased to one consumer for
//! the queue's visibility timeout; unless the consumer settles it (ack,
//! retry later, or dead-letter) before the lease runs out, the job becomes
//! visible again and is redelivered, possibly to another consumer.
//!
//! No ordering is promised, not even between jobs for the same image.
//!
//! # Wire format
//!
//! Jobs travel as JSON objects:
//!
//! ```json
//! {"imageId": "…", "transformations": {"resize": {"width": 100}}}
//! ```
//!
//! `enqueuedAt` and `jobId` are optional extras; messages without them are
//! accepted.

mod dir;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::transform::TransformSpec;

pub use dir::DirQueue;
pub use memory::MemoryQueue;

/// Default queue name.
pub const DEFAULT_QUEUE_NAME: &str = "image-transformations";

/// Default time a received job stays invisible to other consumers.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Messages
// =============================================================================

/// A request to produce one variant of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformJob {
    pub image_id: String,
    pub transformations: TransformSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Stable across redeliveries; makes the variant append idempotent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl TransformJob {
    pub fn new(image_id: impl Into<String>, transformations: TransformSpec) -> Self {
        Self {
            image_id: image_id.into(),
            transformations,
            enqueued_at: Some(Utc::now()),
            job_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A job leased to one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Identifies this lease when settling
    pub tag: String,

    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,

    pub job: TransformJob,
}

/// A job that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: TransformJob,
    pub attempts: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove the job permanently
    Ack,
    /// Make the job visible again after `delay`
    Retry { delay: Duration },
    /// Move the job to the dead-letter area
    DeadLetter { reason: String },
}

// =============================================================================
// JobQueue
// =============================================================================

/// A named, at-least-once job channel.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append a job; it is visible to consumers immediately.
    async fn enqueue(&self, job: TransformJob) -> Result<(), QueueError>;

    /// Lease the next visible job, waiting up to `wait` for one to appear.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery as done.
    ///
    /// Fails with `StaleDelivery` if the lease already expired.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a delivery to the queue, visible again after `delay`.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Move a delivery to the dead-letter area.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Everything in the dead-letter area.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Jobs waiting or leased, excluding dead letters.
    async fn len(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

/// Processes one delivery and decides how to settle it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Apply `disposition` to `delivery`.
pub async fn settle<Q>(
    queue: &Q,
    delivery: &Delivery,
    disposition: Disposition,
) -> Result<(), QueueError>
where
    Q: JobQueue + ?Sized,
{
    match disposition {
        Disposition::Ack => queue.ack(delivery).await,
        Disposition::Retry { delay } => queue.retry(delivery, delay).await,
        Disposition::DeadLetter { reason } => queue.dead_letter(delivery, &reason).await,
    }
}

/// Deliver jobs from `queue` to `handler` until `shutdown` flips to `true`.
///
/// A job that has been received always runs to completion and is settled
/// before shutdown is observed. Queue I/O errors are logged and retried
/// after `poll`; a closed queue ends the loop.
pub async fn consume<Q, H>(
    queue: &Q,
    handler: &H,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), QueueError>
where
    Q: JobQueue + ?Sized,
    H: JobHandler + ?Sized,
{
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            received = queue.receive(poll) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(QueueError::Closed) => return Ok(()),
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "Failed to receive job");
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        debug!(
            queue = %queue.name(),
            tag = %delivery.tag,
            attempt = delivery.attempt,
            image_id = %delivery.job.image_id,
            "Job received"
        );

        let disposition = handler.handle(&delivery).await;

        match settle(queue, &delivery, disposition).await {
            Ok(()) => {}
            Err(QueueError::StaleDelivery(tag)) => {
                // Lease expired while we worked; the job will be redelivered
                warn!(queue = %queue.name(), tag = %tag, "Lease expired before settling job");
            }
            Err(QueueError::Closed) => return Ok(()),
            Err(e) => {
                error!(queue = %queue.name(), tag = %delivery.tag, error = %e, "Failed to settle job");
            }
        }
    }
}
