use anyhow::{Context, Result};
use filebot::config::{Config, ServiceConfig};
use filebot::metadata_store::{InMemoryMetadataStore, MetadataStore, PgMetadataStore};
use filebot::object_gateway::{ObjectStorageGateway, S3Gateway};
use filebot::telegram::{build_bot, run_bot, BotDeps};
use filebot::upload_pipeline::UploadPipeline;
use filebot::web::{start_api_server, AppState, PublicLinks};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        "Starting file bot"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let scratch_dir = config.scratch_dir();
    tokio::fs::create_dir_all(&scratch_dir)
        .await
        .with_context(|| format!("Failed to create scratch dir {}", scratch_dir.display()))?;

    // Initialize components
    let store: Arc<dyn MetadataStore> = match config.database.url.as_deref() {
        Some(url) => {
            let store = PgMetadataStore::new(url, &config.database)
                .await
                .context("Failed to initialize metadata store")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Arc::new(store)
        }
        None => {
            warn!("No database configured, file records will not survive a restart");
            Arc::new(InMemoryMetadataStore::new())
        }
    };

    let gateway: Arc<dyn ObjectStorageGateway> = Arc::new(
        S3Gateway::new(&config.s3)
            .await
            .context("Failed to initialize S3 gateway")?,
    );

    if let Err(e) = gateway.health().await {
        warn!(error = ?e, "Object storage connection test failed");
    }

    let pipeline = Arc::new(UploadPipeline::new(
        gateway.clone(),
        store.clone(),
        scratch_dir,
        config.upload.max_concurrent_uploads,
    ));

    let links = PublicLinks::from_config(&config.api);
    if links.is_none() {
        info!("No public domain configured, web link buttons disabled");
    }

    let bot = build_bot(&config.telegram.bot_token, config.telegram.api_url.as_deref())?;
    let deps = Arc::new(BotDeps {
        pipeline,
        store: store.clone(),
        gateway: gateway.clone(),
        links,
        download_url_expiry: config.presigned_url_expiry(),
    });

    // Create API state
    let api_state = AppState {
        store,
        gateway,
        download_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn bot task
    let bot_handle = tokio::spawn(run_bot(bot, deps));

    // Spawn API server task
    let shutdown = CancellationToken::new();
    let api_shutdown = shutdown.clone();
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown.cancelled_owned()).await {
            error!(error = %e, "API server error");
        }
    });

    info!("File bot started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down file bot");

    shutdown.cancel();
    bot_handle.abort();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }

    info!("File bot stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format == "pretty" {
        registry.with(fmt::layer()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
