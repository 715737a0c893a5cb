//! Background workers that turn queued jobs into image variants.
//!
//! Each delivery goes through
//!
//! ```text
//! Received → Fetching → Transforming → Uploading → Persisting → Acknowledged
//! ```
//!
//! or drops to `Failed` from any stage. A failed attempt is either retried
//! with backoff or, once it is clearly hopeless, dead-lettered and recorded
//! on the image so its owner can see what went wrong.
//!
//! Fetching and uploading are bounded by a timeout. The transform itself runs
//! on the blocking pool so it never stalls the delivery loop. Persisting only
//! starts after the upload has fully succeeded, so no record ever points at a
//! missing object.

mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{image_key, RecordCache};
use crate::error::{JobError, StoreError};
use crate::queue::{consume, Delivery, Disposition, JobHandler, JobQueue, TransformJob};
use crate::records::{AppendOutcome, ImageRecordStore, TransformFailure, Variant};
use crate::storage::ObjectStore;
use crate::transform::TransformEngine;

pub use retry::{
    backoff_duration, RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY,
    MAX_BACKOFF,
};

/// Default bound on a single fetch or upload.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// In-place retries of a record append that hit a concurrent writer.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 20;

const CONFLICT_BACKOFF: Duration = Duration::from_millis(5);

/// Where a job attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Received,
    Fetching,
    Transforming,
    Uploading,
    Persisting,
    Acknowledged,
    Failed,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Received => "received",
            JobStage::Fetching => "fetching",
            JobStage::Transforming => "transforming",
            JobStage::Uploading => "uploading",
            JobStage::Persisting => "persisting",
            JobStage::Acknowledged => "acknowledged",
            JobStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub retry: RetryPolicy,
    pub io_timeout: Duration,
    pub conflict_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

/// Result of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub variant: Variant,
    /// `Duplicate` when an earlier delivery of the same job already persisted
    pub append: AppendOutcome,
}

// =============================================================================
// Worker
// =============================================================================

/// Processes transform jobs against shared stores.
pub struct Worker {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ImageRecordStore>,
    engine: TransformEngine,
    cache: Option<Arc<RecordCache>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ImageRecordStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            objects,
            records,
            engine: TransformEngine::new(),
            cache: None,
            config,
        }
    }

    /// Invalidate `image:{id}` in `cache` whenever a record changes.
    pub fn with_cache(mut self, cache: Arc<RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one attempt at `job`.
    pub async fn process(&self, job: &TransformJob, attempt: u32) -> Result<JobOutcome, JobError> {
        let image_id = job.image_id.as_str();
        let enter = |stage: JobStage| {
            debug!(image_id = %image_id, attempt, stage = %stage, "Job stage");
        };

        enter(JobStage::Received);
        let record = self
            .records
            .get(image_id)
            .await
            .map_err(JobError::Fetch)?
            .ok_or_else(|| JobError::RecordMissing(image_id.to_string()))?;

        enter(JobStage::Fetching);
        let original = self
            .bounded("fetch", self.objects.get(&record.original_location))
            .await
            .map_err(JobError::Fetch)?;

        enter(JobStage::Transforming);
        let engine = self.engine.clone();
        let spec = job.transformations.clone();
        let rendered = tokio::task::spawn_blocking(move || engine.render(&original, &spec))
            .await
            .map_err(|e| JobError::Aborted(e.to_string()))??;

        enter(JobStage::Uploading);
        let name = format!(
            "variants/{}/{}.{}",
            image_id,
            uuid::Uuid::new_v4(),
            rendered.format.extension()
        );
        let location = self
            .bounded(
                "upload",
                self.objects
                    .put(&name, rendered.bytes, rendered.format.content_type()),
            )
            .await
            .map_err(JobError::Upload)?;

        enter(JobStage::Persisting);
        let variant = Variant {
            location,
            spec: job.transformations.clone(),
            created_at: Utc::now(),
            job_id: job.job_id.clone(),
        };
        let append = self
            .append_with_retry(image_id, |records| {
                let variant = variant.clone();
                async move { records.append_variant(image_id, variant).await }
            })
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => JobError::RecordMissing(image_id.to_string()),
                other => JobError::Persist(other),
            })?;

        self.invalidate(image_id).await;

        Ok(JobOutcome { variant, append })
    }

    /// Decide how to settle a failed attempt, recording terminal failures.
    async fn fail(&self, delivery: &Delivery, err: JobError) -> Disposition {
        let job = &delivery.job;
        let attempt = delivery.attempt;

        if let RetryDecision::RetryAfter(delay) = self.config.retry.decide(attempt, &err) {
            warn!(
                image_id = %job.image_id,
                attempt,
                stage = %JobStage::Failed,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Job attempt failed, retrying"
            );
            return Disposition::Retry { delay };
        }

        let reason = err.to_string();
        let failure = TransformFailure {
            spec: job.transformations.clone(),
            reason: reason.clone(),
            attempts: attempt,
            failed_at: Utc::now(),
            job_id: job.job_id.clone(),
        };
        let image_id = job.image_id.as_str();
        let recorded = self
            .append_with_retry(image_id, |records| {
                let failure = failure.clone();
                async move { records.record_failure(image_id, failure).await }
            })
            .await;

        match recorded {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(store_err) if store_err.is_transient() && attempt < self.config.retry.max_attempts => {
                // Keep the job around until the failure can be written down
                let delay = backoff_duration(attempt, self.config.retry.base_delay);
                warn!(
                    image_id = %image_id,
                    attempt,
                    error = %store_err,
                    "Could not record job failure, retrying"
                );
                return Disposition::Retry { delay };
            }
            Err(store_err) => {
                error!(image_id = %image_id, error = %store_err, "Could not record job failure");
            }
        }

        self.invalidate(image_id).await;

        error!(
            image_id = %image_id,
            attempt,
            transient = err.is_transient(),
            error = %err,
            "Job dead-lettered"
        );
        Disposition::DeadLetter { reason }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let after = self.config.io_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { operation, after }),
        }
    }

    /// Run a record append, retrying in place while another writer holds it.
    async fn append_with_retry<'a, F, Fut>(
        &'a self,
        image_id: &str,
        append: F,
    ) -> Result<AppendOutcome, StoreError>
    where
        F: Fn(&'a dyn ImageRecordStore) -> Fut,
        Fut: std::future::Future<Output = Result<AppendOutcome, StoreError>>,
    {
        let mut conflicts = 0;
        loop {
            match append(self.records.as_ref()).await {
                Err(StoreError::Conflict(_)) if conflicts < self.config.conflict_retries => {
                    conflicts += 1;
                    debug!(image_id = %image_id, conflicts, "Record busy, retrying append");
                    tokio::time::sleep(CONFLICT_BACKOFF * conflicts).await;
                }
                result => return result,
            }
        }
    }

    async fn invalidate(&self, image_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&image_key(image_id)).await;
        }
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        // Deliveries whose earlier attempts crashed or timed out never reached
        // `fail`, so the budget is enforced here as well
        let max = self.config.retry.max_attempts;
        if delivery.attempt > max {
            let err = JobError::AttemptsExhausted {
                attempts: delivery.attempt,
                max,
            };
            return self.fail(delivery, err).await;
        }

        let started = tokio::time::Instant::now();
        match self.process(&delivery.job, delivery.attempt).await {
            Ok(outcome) => {
                info!(
                    image_id = %delivery.job.image_id,
                    attempt = delivery.attempt,
                    stage = %JobStage::Acknowledged,
                    location = %outcome.variant.location,
                    duplicate = outcome.append == AppendOutcome::Duplicate,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                Disposition::Ack
            }
            Err(err) => self.fail(delivery, err).await,
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// A set of consumer tasks sharing one worker and one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `count` consumers polling `queue` every `poll`.
    pub fn spawn(
        worker: Arc<Worker>,
        queue: Arc<dyn JobQueue>,
        count: usize,
        poll: Duration,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..count)
            .map(|index| {
                let worker = worker.clone();
                let queue = queue.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    debug!(worker = index, queue = %queue.name(), "Worker started");
                    if let Err(e) = consume(queue.as_ref(), worker.as_ref(), poll, rx).await {
                        error!(worker = index, error = %e, "Worker stopped with error");
                    }
                    debug!(worker = index, "Worker stopped");
                })
            })
            .collect();

        info!(workers = count, queue = %queue.name(), "Worker pool started");
        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every consumer to stop and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}
