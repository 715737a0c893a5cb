//! Durable queue and filesystem-backed pipeline tests.
//!
//! Tests verify:
//! - Several handles on one queue directory share work like separate processes
//! - Expired leases are redelivered to another consumer
//! - Messages written by other producers in the plain wire format are accepted
//! - A pipeline on local disk survives reopening its stores

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use imgflow::error::QueueError;
use imgflow::queue::{DirQueue, JobQueue, TransformJob, DEFAULT_QUEUE_NAME};
use imgflow::records::{FsRecordStore, ImageRecordStore};
use imgflow::storage::{FsObjectStore, ObjectStore};
use imgflow::worker::{Worker, WorkerPool};
use imgflow::{ImageService, RecordCache, ServiceConfig, TransformSpec};

use super::test_utils::{decode, fast_worker_config, png_bytes};

fn job(image_id: &str) -> TransformJob {
    TransformJob::new(
        image_id,
        TransformSpec::from_value(&json!({ "flip": true })).unwrap(),
    )
}

// =============================================================================
// Shared Directory
// =============================================================================

#[tokio::test]
async fn test_two_handles_share_one_queue() {
    let dir = TempDir::new().unwrap();
    let producer = DirQueue::open(dir.path(), DEFAULT_QUEUE_NAME).unwrap();
    let consumer = DirQueue::open(dir.path(), DEFAULT_QUEUE_NAME).unwrap();

    producer.enqueue(job("img-1")).await.unwrap();
    assert_eq!(consumer.len().await.unwrap(), 1);

    let delivery = consumer.receive(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(delivery.job.image_id, "img-1");
    assert_eq!(delivery.attempt, 1);

    // Leased by the consumer, so invisible to the producer's handle
    assert!(producer.receive(Duration::ZERO).await.unwrap().is_none());

    consumer.ack(&delivery).await.unwrap();
    assert!(producer.is_empty().await.unwrap());
    assert!(consumer.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_moves_to_another_consumer() {
    let dir = TempDir::new().unwrap();
    let crashed = DirQueue::open(dir.path(), "jobs")
        .unwrap()
        .with_visibility_timeout(Duration::from_millis(50));
    let survivor = DirQueue::open(dir.path(), "jobs")
        .unwrap()
        .with_poll_interval(Duration::from_millis(10));

    crashed.enqueue(job("img-2")).await.unwrap();
    let lost = crashed.receive(Duration::ZERO).await.unwrap().unwrap();

    let redelivered = survivor
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("lease should expire");
    assert_eq!(redelivered.job.job_id, lost.job.job_id);
    assert_eq!(redelivered.attempt, 2);

    // The first consumer lost its lease and cannot settle any more
    assert!(matches!(
        crashed.ack(&lost).await,
        Err(QueueError::StaleDelivery(_))
    ));
    survivor.ack(&redelivered).await.unwrap();
    assert!(survivor.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_dead_letters_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let queue = DirQueue::open(dir.path(), "jobs").unwrap();
        queue.enqueue(job("img-3")).await.unwrap();
        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue
            .dead_letter(&delivery, "Operation 'crop' failed: out of bounds")
            .await
            .unwrap();
    }

    let reopened = DirQueue::open(dir.path(), "jobs").unwrap();
    assert!(reopened.is_empty().await.unwrap());
    let dead = reopened.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.image_id, "img-3");
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].reason.contains("crop"));
}

// =============================================================================
// Wire Format
// =============================================================================

#[tokio::test]
async fn test_plain_wire_message_is_accepted() {
    let dir = TempDir::new().unwrap();
    let queue = DirQueue::open(dir.path(), "jobs").unwrap();

    // A producer that only knows the `{imageId, transformations}` shape
    let envelope = json!({
        "id": "external1",
        "attempts": 0,
        "payload": {
            "imageId": "img-4",
            "transformations": { "rotate": 180, "resize": { "width": 20 } }
        }
    });
    let path = dir
        .path()
        .join("jobs")
        .join("ready")
        .join("00000000000000000000-external1.json");
    std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

    let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(delivery.job.image_id, "img-4");
    assert_eq!(delivery.job.job_id, None);
    assert_eq!(
        delivery.job.transformations.operation_names(),
        vec!["resize", "rotate"]
    );
    queue.ack(&delivery).await.unwrap();
}

#[test]
fn test_job_serializes_camel_case() {
    let job = job("img-5");
    let value: serde_json::Value = serde_json::from_slice(&job.to_json().unwrap()).unwrap();

    assert_eq!(value["imageId"], "img-5");
    assert_eq!(value["transformations"], json!({ "flip": true }));
    assert!(value["jobId"].is_string());
    assert!(value["enqueuedAt"].is_string());
}

// =============================================================================
// Filesystem Pipeline
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_on_local_disk() {
    let dir = TempDir::new().unwrap();
    let objects: Arc<FsObjectStore> = Arc::new(FsObjectStore::new(dir.path().join("objects")).unwrap());
    let records = Arc::new(FsRecordStore::new(dir.path().join("records")).unwrap());
    let queue = Arc::new(
        DirQueue::open(dir.path().join("queues"), DEFAULT_QUEUE_NAME)
            .unwrap()
            .with_poll_interval(Duration::from_millis(10)),
    );
    let cache = Arc::new(RecordCache::new());

    let service = ImageService::new(
        objects.clone(),
        records.clone(),
        queue.clone(),
        cache.clone(),
        ServiceConfig::default(),
    );
    let record = service
        .submit_upload("alice", png_bytes(60, 30), "wide.png", "image/png")
        .await
        .unwrap();
    assert!(record.original_location.starts_with("file://"));

    for transformations in [
        json!({ "transformations": { "rotate": 90 } }),
        json!({ "transformations": { "resize": { "width": 30 }, "format": "jpeg" } }),
    ] {
        service
            .request_transform("alice", &record.id, &transformations)
            .await
            .unwrap();
    }

    let worker = Worker::new(objects.clone(), records.clone(), fast_worker_config()).with_cache(cache);
    let pool = WorkerPool::spawn(Arc::new(worker), queue.clone(), 2, Duration::from_millis(10));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !queue.is_empty().await.unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await;

    let fetched = service.get_image("alice", &record.id).await.unwrap();
    assert_eq!(fetched.variants.len(), 2);

    // Everything is on disk: a fresh store handle sees the same record
    let reopened = FsRecordStore::new(dir.path().join("records")).unwrap();
    let stored = reopened.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.variants.len(), 2);

    let mut sizes = Vec::new();
    for variant in &stored.variants {
        let output = decode(&objects.get(&variant.location).await.unwrap());
        sizes.push((output.width(), output.height()));
    }
    sizes.sort();
    assert_eq!(sizes, vec![(30, 15), (30, 60)]);
}
