//! imgflow - image upload and transformation service.
//!
//! This binary wires the stores, queue and workers together and runs the
//! HTTP API, a standalone worker pool, or the token minting tool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgflow::{
    config::{Cli, Command, PipelineConfig, ServeConfig, StorageBackend, TokenConfig, WorkerProcessConfig},
    create_s3_client,
    queue::{DirQueue, JobQueue},
    records::{FsRecordStore, ImageRecordStore},
    server::{create_router, RouterConfig, TokenAuth},
    storage::{FsObjectStore, ObjectStore, S3ObjectStore},
    worker::{Worker, WorkerPool},
    ImageService, RecordCache,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Worker(config) => run_worker(config).await,
        Command::Token(config) => run_token(config),
    }
}

// =============================================================================
// Shared Setup
// =============================================================================

/// Explicitly constructed clients shared by the API and the workers.
struct Pipeline {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ImageRecordStore>,
    queue: Arc<dyn JobQueue>,
}

async fn open_pipeline(config: &PipelineConfig) -> Result<Pipeline, String> {
    let objects: Arc<dyn ObjectStore> = match config.storage {
        StorageBackend::Fs => {
            let dir = config.objects_dir();
            info!("  Objects: {}", dir.display());
            let store = FsObjectStore::new(&dir)
                .map_err(|e| format!("cannot open object directory {}: {}", dir.display(), e))?;
            Arc::new(store)
        }
        StorageBackend::S3 => {
            let bucket = config.bucket();
            info!("  Objects: s3://{}", bucket);
            if let Some(ref endpoint) = config.s3_endpoint {
                info!("  S3 endpoint: {}", endpoint);
            }
            info!("  S3 region: {}", config.s3_region);

            let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
            check_bucket(&client, bucket).await?;
            Arc::new(S3ObjectStore::new(
                client,
                bucket.to_string(),
                config.s3_prefix.clone(),
            ))
        }
    };

    let records_dir = config.records_dir();
    info!("  Records: {}", records_dir.display());
    let records = FsRecordStore::new(&records_dir).map_err(|e| {
        format!(
            "cannot open record directory {}: {}",
            records_dir.display(),
            e
        )
    })?;

    let queue_dir = config.queue_dir();
    info!("  Queue: {} in {}", config.queue_name, queue_dir.display());
    let queue = DirQueue::open(&queue_dir, config.queue_name.clone())
        .map_err(|e| format!("cannot open queue {}: {}", config.queue_name, e))?
        .with_visibility_timeout(config.visibility_timeout())
        .with_poll_interval(config.poll_interval());

    match queue.dead_letters().await {
        Ok(dead) if !dead.is_empty() => {
            warn!("  {} dead-lettered job(s) awaiting inspection", dead.len());
        }
        Ok(_) => {}
        Err(e) => warn!("  Could not read dead letters: {}", e),
    }

    Ok(Pipeline {
        objects,
        records: Arc::new(records),
        queue: Arc::new(queue),
    })
}

/// Check the bucket is reachable before accepting work.
async fn check_bucket(client: &aws_sdk_s3::Client, bucket: &str) -> Result<(), String> {
    info!("Connecting to S3...");
    client
        .head_bucket()
        .bucket(bucket)
        .send()
        .await
        .map_err(|e| {
            format!(
                "failed to reach bucket '{}': {}. Check credentials, bucket name and endpoint",
                bucket, e
            )
        })?;
    info!("  Connected successfully");
    Ok(())
}

fn spawn_workers(
    pipeline: &Pipeline,
    config: &PipelineConfig,
    count: usize,
    cache: Option<Arc<RecordCache>>,
) -> WorkerPool {
    let mut worker = Worker::new(
        pipeline.objects.clone(),
        pipeline.records.clone(),
        config.worker_config(),
    );
    if let Some(cache) = cache {
        worker = worker.with_cache(cache);
    }

    info!(
        "  Workers: {} (max {} attempts, {}ms base backoff, {}s I/O timeout)",
        count, config.max_attempts, config.retry_base_delay_ms, config.io_timeout_secs
    );
    WorkerPool::spawn(
        Arc::new(worker),
        pipeline.queue.clone(),
        count,
        config.poll_interval(),
    )
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "imgflow=debug,tower_http=debug"
    } else {
        "imgflow=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("imgflow v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");

    if config.auth_enabled {
        info!("  Auth: enabled");
    } else {
        warn!("  Auth: DISABLED - every request acts as the development user");
        warn!("        Enable for production: --auth-enabled=true --auth-secret=<secret>");
    }

    let pipeline = match open_pipeline(&config.pipeline).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cache = Arc::new(RecordCache::with_limits(
        config.cache_bytes,
        config.cache_entries,
        config.cache_ttl(),
    ));
    info!(
        "  Cache: {} records, {}MB, {}s TTL",
        config.cache_entries,
        config.cache_bytes / (1024 * 1024),
        config.cache_ttl_secs
    );

    // Embedded workers share the API's cache, so finished variants show up immediately
    let pool = if config.workers > 0 {
        Some(spawn_workers(
            &pipeline,
            &config.pipeline,
            config.workers,
            Some(cache.clone()),
        ))
    } else {
        info!("  Workers: none (run `imgflow worker` separately)");
        None
    };

    let service = ImageService::new(
        pipeline.objects.clone(),
        pipeline.records.clone(),
        pipeline.queue.clone(),
        cache,
        config.service_config(),
    );
    let router = create_router(Arc::new(service), build_router_config(&config));

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    if config.auth_enabled {
        info!("    imgflow token --user <id>   # then pass -H 'Authorization: Bearer <token>'");
    }
    info!("    curl -F image=@photo.png http://{}/api/images", addr);
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = if config.auth_enabled {
        RouterConfig::new(config.auth_secret_or_empty())
    } else {
        RouterConfig::without_auth()
    };

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

// =============================================================================
// Worker Command
// =============================================================================

async fn run_worker(config: WorkerProcessConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("imgflow worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");

    let pipeline = match open_pipeline(&config.pipeline).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // No shared cache here: API processes see new variants once their entry expires
    let pool = spawn_workers(&pipeline, &config.pipeline, config.workers, None);

    shutdown_signal().await;
    pool.shutdown().await;

    ExitCode::SUCCESS
}

// =============================================================================
// Token Command
// =============================================================================

fn run_token(config: TokenConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let auth = TokenAuth::new(&config.secret);
    let token = auth.sign(&config.user, Duration::from_secs(config.ttl));
    println!("{}", token);

    ExitCode::SUCCESS
}
