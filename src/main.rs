use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_lifecycle::{
    api,
    bus::{Consumer, EventBus, RedbBus},
    config::{Config, StorageBackend},
    events::{FILES_SCAN_REQUESTED, USERS_REMOVED},
    lifecycle::{LifecycleCoordinator, SCANNER_GROUP},
    object_store as obj,
    purge::{UserPurgeCoordinator, PURGE_GROUP},
    scanner::{ClamdScanner, Scanner},
    shard::ShardRouter,
    stats::StatsAggregator,
    upload::FileService,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-lifecycle starting");

    // Load configuration
    let config = Config::load()?;
    let data_dir = Path::new(&config.node.data_dir);

    // Open metadata shards; a missing or mismatched shard is fatal
    let router = Arc::new(ShardRouter::open(data_dir, config.shards.count)?);
    info!(
        shards = router.shard_count(),
        data_dir = %config.node.data_dir,
        "Metadata shards opened"
    );

    // Open the event log
    let bus: Arc<dyn EventBus> = Arc::new(RedbBus::open(data_dir.join("bus"), &config.bus)?);
    info!("Event bus opened");

    // Initialize object store backend
    let object_store: Arc<dyn obj::ObjectStore> = match config.storage.backend {
        StorageBackend::Local => {
            let store = obj::LocalStore::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                config.storage.local_storage_path
            );
            Arc::new(store)
        }
        StorageBackend::Gcs => {
            let bucket = config
                .storage
                .gcs_bucket
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("GCS_BUCKET is required for the gcs backend"))?;
            let store =
                obj::GcsStore::new(bucket, config.storage.gcs_credentials_file.as_deref()).await?;
            info!("Using GCS storage backend, bucket: {}", bucket);
            Arc::new(store)
        }
    };

    let scanner: Arc<dyn Scanner> = Arc::new(ClamdScanner::new(&config.scanner));
    let deadline = config.shards.deadline();

    // Start bus consumers
    let cancel = CancellationToken::new();
    let lifecycle = Arc::new(LifecycleCoordinator::new(
        Arc::clone(&router),
        Arc::clone(&object_store),
        Arc::clone(&bus),
        scanner,
        deadline,
    ));
    let purge = Arc::new(UserPurgeCoordinator::new(
        Arc::clone(&router),
        Arc::clone(&object_store),
        deadline,
    ));
    let consumers = vec![
        Consumer::new(
            Arc::clone(&bus),
            FILES_SCAN_REQUESTED,
            SCANNER_GROUP,
            lifecycle,
            &config.bus,
        )
        .spawn(cancel.clone()),
        Consumer::new(Arc::clone(&bus), USERS_REMOVED, PURGE_GROUP, purge, &config.bus)
            .spawn(cancel.clone()),
    ];

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        files: FileService::new(
            Arc::clone(&router),
            Arc::clone(&object_store),
            Arc::clone(&bus),
            deadline,
        ),
        stats: StatsAggregator::new(Arc::clone(&router), deadline),
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop consumers after the in-flight delivery settles
    info!("Stopping bus consumers");
    cancel.cancel();
    for handle in consumers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Consumer task failed during shutdown");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
