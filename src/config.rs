//! Configuration management for imgflow.
//!
//! Configuration comes from command-line arguments via clap, with every
//! option also readable from an `IMGFLOW_` environment variable.
//!
//! # Commands
//!
//! - `serve` - HTTP API, optionally with an embedded worker pool
//! - `worker` - worker pool only, consuming the same queue as `serve`
//! - `token` - mint a bearer token for a user
//!
//! # Environment Variables
//!
//! - `IMGFLOW_HOST` - Server bind address (default: 0.0.0.0)
//! - `IMGFLOW_PORT` - Server port (default: 3000)
//! - `IMGFLOW_AUTH_SECRET` - HMAC secret for bearer tokens
//! - `IMGFLOW_AUTH_ENABLED` - Enable authentication (default: true)
//! - `IMGFLOW_STORAGE` - Object storage backend, `fs` or `s3` (default: fs)
//! - `IMGFLOW_S3_BUCKET` / `IMGFLOW_S3_PREFIX` / `IMGFLOW_S3_ENDPOINT` / `IMGFLOW_S3_REGION`
//! - `IMGFLOW_DATA_DIR` - Records, queue and fs objects (default: ./data)
//! - `IMGFLOW_QUEUE_NAME` - Job queue name (default: image-transformations)
//! - `IMGFLOW_WORKERS` - Consumer tasks (default: 2; 0 disables them in `serve`)
//! - `IMGFLOW_MAX_ATTEMPTS` - Deliveries before dead-lettering (default: 5)
//! - `IMGFLOW_RETRY_BASE_DELAY_MS` - First retry backoff (default: 500)
//! - `IMGFLOW_IO_TIMEOUT_SECS` - Fetch/upload bound (default: 30)
//! - `IMGFLOW_VISIBILITY_TIMEOUT_SECS` - Job lease length (default: 300)
//! - `IMGFLOW_POLL_INTERVAL_MS` - Queue poll interval (default: 250)
//! - `IMGFLOW_CACHE_TTL_SECS` - Record cache TTL (default: 3600)
//! - `IMGFLOW_CACHE_ENTRIES` / `IMGFLOW_CACHE_BYTES` - Record cache limits
//! - `IMGFLOW_MAX_UPLOAD_BYTES` - Upload size limit (default: 5MiB)
//! - `IMGFLOW_ALLOWED_MIME_TYPES` - Comma-separated upload types
//! - `IMGFLOW_CORS_ORIGINS` - Comma-separated CORS origins

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::cache::{DEFAULT_CACHE_CAPACITY_BYTES, DEFAULT_CACHE_MAX_ENTRIES};
use crate::queue::DEFAULT_QUEUE_NAME;
use crate::service::{ServiceConfig, DEFAULT_MAX_UPLOAD_BYTES};
use crate::worker::{RetryPolicy, WorkerConfig, DEFAULT_CONFLICT_RETRIES, DEFAULT_MAX_ATTEMPTS};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default directory for records, the queue and filesystem objects.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default number of consumer tasks.
pub const DEFAULT_WORKERS: usize = 2;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Default bearer token lifetime (24 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

const DEFAULT_ALLOWED_MIME_TYPES: &str = "image/jpeg,image/png,image/gif";

// =============================================================================
// CLI Arguments
// =============================================================================

/// imgflow - image upload and transformation service.
///
/// Uploads are stored in object storage; transformations are queued and
/// executed by background workers.
#[derive(Parser, Debug, Clone)]
#[command(name = "imgflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API (and, unless --workers=0, an embedded worker pool).
    Serve(ServeConfig),

    /// Run only the worker pool.
    Worker(WorkerProcessConfig),

    /// Mint a bearer token for a user.
    Token(TokenConfig),
}

/// Where original and variant bytes are stored.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Files under `{data_dir}/objects`
    Fs,
    /// An S3 or S3-compatible bucket
    S3,
}

// =============================================================================
// Pipeline Configuration (shared by serve and worker)
// =============================================================================

/// Storage, queue and retry settings shared by API and worker processes.
///
/// Processes that should cooperate must agree on all of these.
#[derive(Args, Debug, Clone)]
pub struct PipelineConfig {
    // =========================================================================
    // Storage Configuration
    // =========================================================================
    /// Object storage backend for images.
    #[arg(long, value_enum, default_value_t = StorageBackend::Fs, env = "IMGFLOW_STORAGE")]
    pub storage: StorageBackend,

    /// S3 bucket for images (required with --storage=s3).
    #[arg(long, env = "IMGFLOW_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket.
    #[arg(long, env = "IMGFLOW_S3_PREFIX")]
    pub s3_prefix: Option<String>,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "IMGFLOW_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "IMGFLOW_S3_REGION")]
    pub s3_region: String,

    /// Directory holding image records, the job queue and (with
    /// --storage=fs) image objects.
    #[arg(long, default_value = DEFAULT_DATA_DIR, env = "IMGFLOW_DATA_DIR")]
    pub data_dir: PathBuf,

    // =========================================================================
    // Queue and Retry Configuration
    // =========================================================================
    /// Name of the transform job queue.
    #[arg(long, default_value = DEFAULT_QUEUE_NAME, env = "IMGFLOW_QUEUE_NAME")]
    pub queue_name: String,

    /// Deliveries of one job before it is dead-lettered.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, env = "IMGFLOW_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Backoff before the first redelivery, in milliseconds; doubles per attempt.
    #[arg(long, default_value_t = DEFAULT_RETRY_BASE_DELAY_MS, env = "IMGFLOW_RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,

    /// Bound on fetching an original or uploading a variant, in seconds.
    #[arg(long, default_value_t = DEFAULT_IO_TIMEOUT_SECS, env = "IMGFLOW_IO_TIMEOUT_SECS")]
    pub io_timeout_secs: u64,

    /// How long a received job stays leased before it is redelivered, in seconds.
    #[arg(long, default_value_t = DEFAULT_VISIBILITY_TIMEOUT_SECS, env = "IMGFLOW_VISIBILITY_TIMEOUT_SECS")]
    pub visibility_timeout_secs: u64,

    /// How often idle consumers look for new jobs, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS, env = "IMGFLOW_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.storage == StorageBackend::S3
            && self.s3_bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(
                "S3 bucket name is required with --storage=s3. Set --s3-bucket or IMGFLOW_S3_BUCKET"
                    .to_string(),
            );
        }

        if self.queue_name.is_empty() || self.queue_name.contains(['/', '\\']) {
            return Err("queue_name must be non-empty and contain no path separators".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.retry_base_delay_ms == 0 {
            return Err("retry_base_delay_ms must be greater than 0".to_string());
        }
        if self.io_timeout_secs == 0 {
            return Err("io_timeout_secs must be greater than 0".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        // A lease shorter than one fetch plus one upload would expire mid-job
        if self.visibility_timeout_secs <= self.io_timeout_secs * 2 {
            return Err(format!(
                "visibility_timeout_secs ({}) must exceed twice io_timeout_secs ({})",
                self.visibility_timeout_secs, self.io_timeout_secs
            ));
        }

        Ok(())
    }

    pub fn bucket(&self) -> &str {
        self.s3_bucket.as_deref().unwrap_or("")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queues")
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            retry: self.retry_policy(),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

// =============================================================================
// Serve Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "IMGFLOW_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "IMGFLOW_PORT")]
    pub port: u16,

    /// Consumer tasks to run inside the server process (0 = API only).
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "IMGFLOW_WORKERS")]
    pub workers: usize,

    // =========================================================================
    // Authentication Configuration
    // =========================================================================
    /// Secret key for HMAC-SHA256 bearer tokens.
    ///
    /// If not provided and auth is enabled, the server will fail to start.
    #[arg(long, env = "IMGFLOW_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Enable bearer token authentication.
    ///
    /// When disabled every request acts as one development user.
    /// WARNING: Only disable authentication in development/testing.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "IMGFLOW_AUTH_ENABLED")]
    pub auth_enabled: bool,

    // =========================================================================
    // Upload Configuration
    // =========================================================================
    /// Largest accepted upload in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, env = "IMGFLOW_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: usize,

    /// Accepted upload content types (comma-separated).
    #[arg(
        long,
        default_value = DEFAULT_ALLOWED_MIME_TYPES,
        value_delimiter = ',',
        env = "IMGFLOW_ALLOWED_MIME_TYPES"
    )]
    pub allowed_mime_types: Vec<String>,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Lifetime of cached image records, in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL_SECS, env = "IMGFLOW_CACHE_TTL_SECS")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached image records.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_ENTRIES, env = "IMGFLOW_CACHE_ENTRIES")]
    pub cache_entries: usize,

    /// Maximum total size of cached image records, in bytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY_BYTES, env = "IMGFLOW_CACHE_BYTES")]
    pub cache_bytes: usize,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "IMGFLOW_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    #[command(flatten)]
    pub pipeline: PipelineConfig,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_enabled && self.auth_secret.as_deref().map_or(true, str::is_empty) {
            return Err(
                "Authentication is enabled but no secret provided. \
                 Set --auth-secret or IMGFLOW_AUTH_SECRET, or disable auth with --auth-enabled=false"
                    .to_string(),
            );
        }

        if self.max_upload_bytes == 0 {
            return Err("max_upload_bytes must be greater than 0".to_string());
        }
        if self.allowed_mime_types.is_empty() {
            return Err("allowed_mime_types must list at least one type".to_string());
        }
        if let Some(bad) = self
            .allowed_mime_types
            .iter()
            .find(|m| !m.starts_with("image/"))
        {
            return Err(format!("allowed_mime_types: '{}' is not an image type", bad));
        }

        if self.cache_ttl_secs == 0 {
            return Err("cache_ttl_secs must be greater than 0".to_string());
        }
        if self.cache_entries == 0 {
            return Err("cache_entries must be greater than 0".to_string());
        }
        if self.cache_bytes == 0 {
            return Err("cache_bytes must be greater than 0".to_string());
        }

        self.pipeline.validate()
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The auth secret, or an empty string when unset (call validate() first).
    pub fn auth_secret_or_empty(&self) -> &str {
        self.auth_secret.as_deref().unwrap_or("")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_upload_bytes: self.max_upload_bytes,
            allowed_mime_types: self
                .allowed_mime_types
                .iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .collect(),
            cache_ttl: self.cache_ttl(),
        }
    }
}

// =============================================================================
// Worker Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct WorkerProcessConfig {
    /// Consumer tasks to run.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "IMGFLOW_WORKERS")]
    pub workers: usize,

    #[command(flatten)]
    pub pipeline: PipelineConfig,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl WorkerProcessConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        self.pipeline.validate()
    }
}

// =============================================================================
// Token Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct TokenConfig {
    /// User id the token is issued to.
    #[arg(long)]
    pub user: String,

    /// Secret key shared with the server.
    #[arg(long, env = "IMGFLOW_AUTH_SECRET")]
    pub secret: String,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub ttl: u64,
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.user.is_empty() {
            return Err("user must not be empty".to_string());
        }
        if self.secret.is_empty() {
            return Err("secret must not be empty".to_string());
        }
        if self.ttl == 0 {
            return Err("ttl must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
