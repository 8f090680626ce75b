use std::sync::Arc;

use anyhow::Context;
use common::storage::BlobStore;
use common::storage::filesystem::FilesystemBlobStore;
use common::storage::s3::S3BlobStore;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use receipt_server::config::{AppConfig, StorageBackend, StorageConfig};
use receipt_server::consumers::{consume_extraction_requests, run_metering};
use receipt_server::database::init_db;
use receipt_server::dispatch::{ExtractionDispatcher, InlineDispatcher, QueueDispatcher};
use receipt_server::entitlements::{AllowAll, Entitlements, HttpEntitlements};
use receipt_server::extraction::{AnthropicParser, Orchestrator, ReceiptRecords, RunSettings};
use receipt_server::state::AppState;
use receipt_server::stuck::run_stuck_receipt_sweeper;

async fn init_blob_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.backend {
        StorageBackend::Filesystem => {
            let store = FilesystemBlobStore::new(config.path.clone(), config.max_blob_size)
                .await
                .with_context(|| {
                    format!("Failed to open blob directory {}", config.path.display())
                })?;
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .context("storage.backend is s3 but [storage.s3] is missing")?;
            let store = S3BlobStore::new(s3, config.max_blob_size)
                .context("Failed to configure S3 blob store")?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db = init_db(&config.database)
        .await
        .context("Failed to initialize database")?;
    info!("Database ready");

    let blob_store = init_blob_store(&config.storage).await?;

    let entitlements: Arc<dyn Entitlements> = if config.entitlements.enabled {
        Arc::new(
            HttpEntitlements::new(config.entitlements.clone())
                .context("Failed to build entitlement client")?,
        )
    } else {
        info!("Entitlement service disabled, all features granted");
        Arc::new(AllowAll)
    };

    let (usage_tx, usage_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_metering(usage_rx, Arc::clone(&entitlements)));

    let parser = AnthropicParser::new(config.inference.clone())
        .context("Failed to build inference client")?;
    let records: Arc<dyn ReceiptRecords> = Arc::new(db.clone());
    let orchestrator = Arc::new(
        Orchestrator::new(
            records,
            Arc::new(parser),
            RunSettings::new(&config.extraction, &config.inference),
        )
        .with_usage_sink(usage_tx),
    );

    let dispatcher: Arc<dyn ExtractionDispatcher> = if config.mq.enabled {
        let mq = Arc::new(
            mq::init_mq(mq::MqConfig {
                url: config.mq.url.clone(),
                pool_size: config.mq.pool_size,
            })
            .await
            .context("Failed to connect to message queue")?,
        );
        info!(queue = %config.mq.queue_name, "Extraction runs go through the message queue");

        tokio::spawn(consume_extraction_requests(
            Arc::clone(&orchestrator),
            Arc::clone(&mq),
            config.mq.queue_name.clone(),
            config.mq.concurrency,
        ));
        Arc::new(QueueDispatcher::new(mq, config.mq.queue_name.clone()))
    } else {
        info!("Message queue disabled, extraction runs are spawned in-process");
        Arc::new(InlineDispatcher::new(Arc::clone(&orchestrator)))
    };

    tokio::spawn(run_stuck_receipt_sweeper(
        db.clone(),
        config.extraction.clone(),
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        db,
        config,
        blob_store,
        dispatcher,
        entitlements,
    };
    let app = receipt_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Server running at http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
