//! Test utilities for integration tests.
//!
//! In-memory collaborators wired the way `imgflow serve` wires the real
//! ones, failure-injecting wrappers, and helpers for building requests and
//! test images.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use tokio::time::Instant;
use tower::ServiceExt;

use imgflow::error::StoreError;
use imgflow::queue::{settle, JobHandler, JobQueue, MemoryQueue};
use imgflow::records::MemoryRecordStore;
use imgflow::server::{create_router, RouterConfig, TokenAuth};
use imgflow::storage::{MemoryObjectStore, ObjectStore};
use imgflow::worker::{RetryPolicy, Worker, WorkerConfig};
use imgflow::{ImageService, RecordCache, ServiceConfig};

pub const TEST_SECRET: &str = "integration-test-secret";

// =============================================================================
// Images
// =============================================================================

/// A `width`x`height` RGB gradient encoded as PNG.
pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode test png");
    Bytes::from(out)
}

pub fn decode(bytes: &[u8]) -> DynamicImage {
    image::load_from_memory(bytes).expect("decode image")
}

// =============================================================================
// Failure Injection
// =============================================================================

/// Object store whose first `put_failures` uploads fail with a connection error.
pub struct FlakyObjectStore {
    inner: Arc<MemoryObjectStore>,
    put_failures: AtomicUsize,
    put_calls: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn new(inner: Arc<MemoryObjectStore>, put_failures: usize) -> Self {
        Self {
            inner,
            put_failures: AtomicUsize::new(put_failures),
            put_calls: AtomicUsize::new(0),
        }
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<String, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .put_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        self.inner.put(name, bytes, content_type).await
    }

    async fn get(&self, location: &str) -> Result<Bytes, StoreError> {
        self.inner.get(location).await
    }
}

// =============================================================================
// Application Fixture
// =============================================================================

/// The API plus in-memory collaborators, with workers left to the test.
pub struct TestApp {
    pub router: Router,
    pub service: Arc<ImageService>,
    pub objects: Arc<MemoryObjectStore>,
    pub records: Arc<MemoryRecordStore>,
    pub queue: Arc<MemoryQueue>,
    pub cache: Arc<RecordCache>,
    pub auth: TokenAuth,
}

impl TestApp {
    pub fn new() -> Self {
        let objects = Arc::new(MemoryObjectStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let queue = Arc::new(MemoryQueue::new("image-transformations"));
        let cache = Arc::new(RecordCache::new());

        let service = Arc::new(ImageService::new(
            objects.clone(),
            records.clone(),
            queue.clone(),
            cache.clone(),
            ServiceConfig::default(),
        ));
        let router = create_router(
            service.clone(),
            RouterConfig::new(TEST_SECRET).with_tracing(false),
        );

        Self {
            router,
            service,
            objects,
            records,
            queue,
            cache,
            auth: TokenAuth::new(TEST_SECRET),
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        self.auth.sign(user_id, Duration::from_secs(3600))
    }

    /// A worker over this app's stores that shares its cache, as in `serve`.
    pub fn worker(&self) -> Worker {
        Worker::new(self.objects.clone(), self.records.clone(), fast_worker_config())
            .with_cache(self.cache.clone())
    }

    /// Send `request` through the router and return status and JSON body.
    pub async fn send(&self, request: Request<Body>) -> (u16, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Upload a PNG as `user_id` and return the created record's id.
    pub async fn upload_png(&self, user_id: &str, width: u32, height: u32) -> String {
        let (status, body) = self
            .send(upload_request(
                &self.token(user_id),
                "photo.png",
                "image/png",
                &png_bytes(width, height),
            ))
            .await;
        assert_eq!(status, 201, "upload failed: {}", body);
        body["id"].as_str().expect("record id").to_string()
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker settings with millisecond backoff so retries finish quickly.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        },
        io_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

// =============================================================================
// Requests
// =============================================================================

const BOUNDARY: &str = "imgflow-test-boundary";

/// A `multipart/form-data` body with one file field.
pub fn multipart_body(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(token: &str, filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    upload_request_with_field(token, "image", filename, content_type, data)
}

pub fn upload_request_with_field(
    token: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/images")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(field, filename, content_type, data)))
        .unwrap()
}

pub fn transform_request(token: &str, image_id: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/images/{}/transform", image_id))
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(token: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

// =============================================================================
// Queue Draining
// =============================================================================

/// Deliver jobs from `queue` to `handler` until the queue is empty, delayed
/// retries included. Returns the number of deliveries handled.
pub async fn drain<Q, H>(queue: &Q, handler: &H, limit: Duration) -> usize
where
    Q: JobQueue + ?Sized,
    H: JobHandler + ?Sized,
{
    let deadline = Instant::now() + limit;
    let mut handled = 0;
    while Instant::now() < deadline {
        match queue.receive(Duration::from_millis(50)).await.unwrap() {
            Some(delivery) => {
                let disposition = handler.handle(&delivery).await;
                settle(queue, &delivery, disposition).await.unwrap();
                handled += 1;
            }
            None if queue.is_empty().await.unwrap() => return handled,
            None => {}
        }
    }
    panic!("queue not drained within {:?}", limit);
}
