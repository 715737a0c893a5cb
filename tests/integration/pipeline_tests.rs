//! End-to-end pipeline tests: API request, queue, worker, record.
//!
//! Tests verify:
//! - Variants land on the record in the canonical operation order
//! - Permanent transform failures are dead-lettered and visible to the owner
//! - Transient upload failures are retried into exactly one variant
//! - Concurrent and out-of-order jobs on one image all survive
//! - Redelivery after a lost acknowledgement does not duplicate variants

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use imgflow::queue::{settle, Disposition, JobHandler, JobQueue, MemoryQueue, TransformJob};
use imgflow::records::{ImageRecordStore, MemoryRecordStore};
use imgflow::storage::ObjectStore;
use imgflow::worker::{Worker, WorkerPool};
use imgflow::{AppendOutcome, RecordCache, TransformSpec};

use super::test_utils::{
    decode, drain, fast_worker_config, get_request, transform_request, FlakyObjectStore, TestApp,
};

const DRAIN_LIMIT: Duration = Duration::from_secs(10);

async fn request_transform(app: &TestApp, user: &str, image_id: &str, transformations: Value) {
    let (status, body) = app
        .send(transform_request(
            &app.token(user),
            image_id,
            &json!({ "transformations": transformations }),
        ))
        .await;
    assert_eq!(status, 202, "transform rejected: {}", body);
}

async fn fetch_record(app: &TestApp, user: &str, image_id: &str) -> Value {
    let (status, body) = app
        .send(get_request(&app.token(user), &format!("/api/images/{}", image_id)))
        .await;
    assert_eq!(status, 200);
    body
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_resize_then_rotate_produces_variant() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 200, 200).await;

    // Cache the record before the worker runs; the shared cache must not go stale
    let before = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(before["variants"], json!([]));

    request_transform(
        &app,
        "alice",
        &image_id,
        json!({ "rotate": { "degrees": 90 }, "resize": { "width": 100, "height": 100 } }),
    )
    .await;
    let worker = app.worker();
    assert_eq!(drain(app.queue.as_ref(), &worker, DRAIN_LIMIT).await, 1);

    let after = fetch_record(&app, "alice", &image_id).await;
    let variants = after["variants"].as_array().unwrap();
    assert_eq!(variants.len(), 1);
    assert_eq!(variants[0]["spec"]["resize"]["width"], 100);
    assert!(variants[0]["jobId"].as_str().is_some());

    let location = variants[0]["location"].as_str().unwrap();
    assert!(location.starts_with(&format!("mem://objects/variants/{}/", image_id)));
    assert!(location.ends_with(".png"));
    assert_eq!(
        app.objects.content_type(location).await.as_deref(),
        Some("image/png")
    );

    let output = decode(&app.objects.get(location).await.unwrap());
    assert_eq!((output.width(), output.height()), (100, 100));
}

#[tokio::test]
async fn test_rectangular_source_shows_operation_order() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 200, 100).await;

    // Resize runs before rotate whatever order the keys arrive in
    request_transform(
        &app,
        "alice",
        &image_id,
        json!({ "rotate": 90, "resize": { "width": 100 } }),
    )
    .await;
    drain(app.queue.as_ref(), &app.worker(), DRAIN_LIMIT).await;

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    let output = decode(&app.objects.get(&record.variants[0].location).await.unwrap());
    assert_eq!((output.width(), output.height()), (50, 100));
}

#[tokio::test]
async fn test_format_and_compress_choose_output_encoding() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 40, 40).await;

    request_transform(&app, "alice", &image_id, json!({ "compress": { "quality": 60 } })).await;
    request_transform(&app, "alice", &image_id, json!({ "format": "webp", "flip": true })).await;
    drain(app.queue.as_ref(), &app.worker(), DRAIN_LIMIT).await;

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    let mut extensions: Vec<&str> = record
        .variants
        .iter()
        .map(|v| v.location.rsplit('.').next().unwrap())
        .collect();
    extensions.sort();
    assert_eq!(extensions, vec!["jpg", "webp"]);
}

#[tokio::test]
async fn test_identical_jobs_produce_identical_bytes() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 64, 48).await;
    let spec = json!({ "blur": 1.5, "tint": { "r": 200, "g": 50, "b": 50 }, "sharpen": true });

    request_transform(&app, "alice", &image_id, spec.clone()).await;
    request_transform(&app, "alice", &image_id, spec).await;
    drain(app.queue.as_ref(), &app.worker(), DRAIN_LIMIT).await;

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    assert_eq!(record.variants.len(), 2);
    let first = app.objects.get(&record.variants[0].location).await.unwrap();
    let second = app.objects.get(&record.variants[1].location).await.unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_out_of_bounds_crop_is_dead_lettered_and_recorded() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 50, 50).await;

    request_transform(
        &app,
        "alice",
        &image_id,
        json!({ "crop": { "x": 0, "y": 0, "width": 10000, "height": 10000 } }),
    )
    .await;
    let worker = app.worker();

    // Permanent failure: one delivery, no retries
    assert_eq!(drain(app.queue.as_ref(), &worker, DRAIN_LIMIT).await, 1);

    let dead = app.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].reason.contains("crop"));

    let record = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(record["variants"], json!([]));
    let failures = record["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0]["reason"].as_str().unwrap().contains("crop"));
    assert_eq!(failures[0]["spec"]["crop"]["width"], 10000);

    // Only the original is stored
    assert_eq!(app.objects.len().await, 1);
}

#[tokio::test]
async fn test_transient_upload_failure_yields_exactly_one_variant() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 32, 32).await;
    let flaky = Arc::new(FlakyObjectStore::new(app.objects.clone(), 1));
    let worker = Worker::new(flaky.clone(), app.records.clone(), fast_worker_config())
        .with_cache(app.cache.clone());

    request_transform(&app, "alice", &image_id, json!({ "flop": true })).await;

    // First delivery fails on upload and is retried; the second succeeds
    assert_eq!(drain(app.queue.as_ref(), &worker, DRAIN_LIMIT).await, 2);
    assert_eq!(flaky.put_calls(), 2);

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    assert_eq!(record.variants.len(), 1);
    assert!(record.failures.is_empty());
    assert!(app.queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persistent_upload_failure_gives_up_after_max_attempts() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 16, 16).await;
    let flaky = Arc::new(FlakyObjectStore::new(app.objects.clone(), usize::MAX));
    let config = fast_worker_config();
    let max_attempts = config.retry.max_attempts;
    let worker = Worker::new(flaky.clone(), app.records.clone(), config);

    request_transform(&app, "alice", &image_id, json!({ "flip": true })).await;

    assert_eq!(
        drain(app.queue.as_ref(), &worker, DRAIN_LIMIT).await,
        max_attempts as usize
    );
    let dead = app.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, max_attempts);

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    assert!(record.variants.is_empty());
    assert_eq!(record.failures.len(), 1);
    assert_eq!(record.failures[0].attempts, max_attempts);
}

// =============================================================================
// Concurrency and Redelivery
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_jobs_on_one_image_all_survive() {
    const JOBS: usize = 12;

    let app = TestApp::new();
    let image_id = app.upload_png("alice", 24, 24).await;
    for i in 0..JOBS {
        request_transform(
            &app,
            "alice",
            &image_id,
            json!({ "resize": { "width": 8 + i as u32 } }),
        )
        .await;
    }

    let queue: Arc<dyn JobQueue> = app.queue.clone();
    let pool = WorkerPool::spawn(Arc::new(app.worker()), queue, 4, Duration::from_millis(20));

    let deadline = tokio::time::Instant::now() + DRAIN_LIMIT;
    while !app.queue.is_empty().await.unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await;

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    assert_eq!(record.variants.len(), JOBS);
    let mut widths: Vec<u64> = record
        .variants
        .iter()
        .map(|v| v.spec.to_map()["resize"]["width"].as_u64().unwrap())
        .collect();
    widths.sort();
    assert_eq!(widths, (8..8 + JOBS as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_out_of_order_completion_keeps_both_variants() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 20, 20).await;
    request_transform(&app, "alice", &image_id, json!({ "flip": true })).await;
    request_transform(&app, "alice", &image_id, json!({ "flop": true })).await;

    let worker = app.worker();
    let first = app.queue.receive(Duration::ZERO).await.unwrap().unwrap();
    let second = app.queue.receive(Duration::ZERO).await.unwrap().unwrap();

    // Finish the later job first
    let disposition = worker.handle(&second).await;
    assert_eq!(disposition, Disposition::Ack);
    settle(app.queue.as_ref(), &second, disposition).await.unwrap();

    let disposition = worker.handle(&first).await;
    assert_eq!(disposition, Disposition::Ack);
    settle(app.queue.as_ref(), &first, disposition).await.unwrap();

    let record = app.records.get(&image_id).await.unwrap().unwrap();
    let names: Vec<Vec<&str>> = record
        .variants
        .iter()
        .map(|v| v.spec.operation_names())
        .collect();
    assert_eq!(names, vec![vec!["flop"], vec!["flip"]]);
    assert!(app.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_redelivery_after_lost_ack_does_not_duplicate() {
    let objects = Arc::new(imgflow::MemoryObjectStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    let queue = MemoryQueue::with_visibility_timeout("q", Duration::from_millis(50));

    let location = objects
        .put("images/a.png", super::test_utils::png_bytes(16, 16), "image/png")
        .await
        .unwrap();
    let record = imgflow::ImageRecord::new(
        "alice",
        location,
        imgflow::ImageMetadata {
            filename: "a.png".into(),
            mime_type: "image/png".into(),
            size_bytes: 0,
        },
    );
    let image_id = record.id.clone();
    records.create(record).await.unwrap();

    let spec = TransformSpec::from_value(&json!({ "filters": { "grayscale": true } })).unwrap();
    queue.enqueue(TransformJob::new(&image_id, spec)).await.unwrap();

    let worker = Worker::new(objects.clone(), records.clone(), fast_worker_config());

    // The worker persists the variant but "crashes" before acknowledging
    let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
    let outcome = worker.process(&first.job, first.attempt).await.unwrap();
    assert_eq!(outcome.append, AppendOutcome::Appended);

    // Lease runs out and the job comes back
    let second = queue.receive(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(second.attempt, 2);
    let outcome = worker.process(&second.job, second.attempt).await.unwrap();
    assert_eq!(outcome.append, AppendOutcome::Duplicate);
    queue.ack(&second).await.unwrap();

    let record = records.get(&image_id).await.unwrap().unwrap();
    assert_eq!(record.variants.len(), 1);
}

// =============================================================================
// Cache Consistency
// =============================================================================

#[tokio::test]
async fn test_standalone_worker_leaves_cache_stale_until_expiry() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 16, 16).await;
    fetch_record(&app, "alice", &image_id).await;

    request_transform(&app, "alice", &image_id, json!({ "normalize": true })).await;

    // A separate worker process has no handle on the API's cache
    let standalone = Worker::new(app.objects.clone(), app.records.clone(), fast_worker_config());
    drain(app.queue.as_ref(), &standalone, DRAIN_LIMIT).await;

    let cached = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(cached["variants"], json!([]));

    app.cache.invalidate(&imgflow::image_key(&image_id)).await;
    let fresh = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(fresh["variants"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_shared_cache_sees_recorded_failures() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 10, 10).await;
    fetch_record(&app, "alice", &image_id).await;

    request_transform(
        &app,
        "alice",
        &image_id,
        json!({ "crop": { "x": 5, "y": 5, "width": 10, "height": 10 } }),
    )
    .await;
    drain(app.queue.as_ref(), &app.worker(), DRAIN_LIMIT).await;

    let record = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(record["failures"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_cache_entry_is_refreshed() {
    let app = TestApp::new();
    let image_id = app.upload_png("alice", 8, 8).await;

    // Seed an entry that expires almost immediately
    let snapshot = serde_json::to_vec(&app.records.get(&image_id).await.unwrap().unwrap()).unwrap();
    app.cache
        .set(
            imgflow::image_key(&image_id),
            snapshot.into(),
            Duration::from_millis(10),
        )
        .await;

    let cache_for_worker = Arc::new(RecordCache::new());
    let standalone = Worker::new(app.objects.clone(), app.records.clone(), fast_worker_config())
        .with_cache(cache_for_worker);
    request_transform(&app, "alice", &image_id, json!({ "flip": true })).await;
    drain(app.queue.as_ref(), &standalone, DRAIN_LIMIT).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let record = fetch_record(&app, "alice", &image_id).await;
    assert_eq!(record["variants"].as_array().unwrap().len(), 1);
}
