//! # imgflow
//!
//! An image upload and transformation service.
//!
//! Users upload images, then ask for transformations (resize, crop, rotate,
//! filters and more). Requests are validated synchronously and handed to a
//! durable job queue; background workers fetch the original, apply the
//! transformation pipeline in a fixed canonical order, store the result and
//! append it to the image's record as a new variant.
//!
//! ## Features
//!
//! - **Typed transform specs**: the loosely-keyed JSON mapping is parsed into
//!   an ordered list of operations, rejecting unknown keys up front
//! - **At-least-once jobs**: leased deliveries, bounded retry with
//!   exponential backoff, and a dead-letter area for hopeless jobs
//! - **Safe concurrent appends**: variants are only ever appended, and
//!   redelivered jobs never produce duplicates
//! - **Read-through cache** for image records
//! - **Pluggable storage**: S3, local filesystem or in-memory
//!
//! ## Architecture
//!
//! - [`transform`] - `TransformSpec` and the `TransformEngine`
//! - [`queue`] - job queue trait, wire format and backends
//! - [`worker`] - per-job state machine, retry policy and worker pool
//! - [`storage`] - object storage for originals and variants
//! - [`records`] - image records and their stores
//! - [`cache`] - TTL-bounded record cache
//! - [`service`] - upload, transform request and lookup operations
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use imgflow::{
//!     create_router, ImageService, MemoryObjectStore, MemoryQueue, MemoryRecordStore,
//!     RecordCache, RouterConfig, ServiceConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ImageService::new(
//!         Arc::new(MemoryObjectStore::new()),
//!         Arc::new(MemoryRecordStore::new()),
//!         Arc::new(MemoryQueue::new("image-transformations")),
//!         Arc::new(RecordCache::new()),
//!         ServiceConfig::default(),
//!     );
//!     let router = create_router(Arc::new(service), RouterConfig::new("secret"));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod records;
pub mod server;
pub mod service;
pub mod storage;
pub mod transform;
pub mod worker;

// Re-export commonly used types
pub use cache::{image_key, RecordCache, DEFAULT_CACHE_TTL};
pub use config::{
    Cli, Command, PipelineConfig, ServeConfig, StorageBackend, TokenConfig, WorkerProcessConfig,
};
pub use error::{JobError, QueueError, ServiceError, SpecError, StoreError, TransformError};
pub use queue::{
    consume, settle, DeadLetter, Delivery, DirQueue, Disposition, JobHandler, JobQueue,
    MemoryQueue, TransformJob, DEFAULT_QUEUE_NAME,
};
pub use records::{
    AppendOutcome, FsRecordStore, ImageMetadata, ImageRecord, ImageRecordStore,
    MemoryRecordStore, RecordPage, TransformFailure, Variant,
};
pub use server::{
    auth_middleware, create_router, create_router_with_verifier, health_handler, ApiError,
    AppState, AuthError, AuthUser, AuthVerifier, ErrorResponse, HealthResponse, RouterConfig,
    TokenAuth,
};
pub use service::{ImagePage, ImageService, ServiceConfig, TransformAccepted};
pub use storage::{create_s3_client, FsObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use transform::{Gravity, Operation, OutputFormat, TransformEngine, TransformSpec, TransformedImage};
pub use worker::{JobOutcome, JobStage, RetryPolicy, Worker, WorkerConfig, WorkerPool};
