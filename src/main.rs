//! Fieldtrace - provenance reconciliation gateway for produce tracking

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldtrace::{
    config::Args,
    content::{ContentStore, HttpContentStore, MemoryContentStore},
    freshness::FreshnessInference,
    ledger::{LedgerBackend, LedgerClient, LifecycleLedger, MemoryLedger},
    nats::NatsClient,
    record::{MemoryRecordStore, MongoClient, MongoRecordStore, RecordStore},
    server,
    services::ProvenanceService,
    telemetry::TelemetryFeed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fieldtrace={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Fieldtrace - Provenance Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Ledger: {}", args.ledger_url);
    info!("Storage: {}", args.storage_url.as_deref().unwrap_or("(in-memory)"));
    info!("MongoDB: {}", args.mongodb_uri);
    info!("NATS: {}", args.nats.nats_url);
    info!("Telemetry subject: {}.>", args.telemetry_subject_prefix);
    info!("======================================");

    // Connect to the ledger node (in-memory fallback in dev mode)
    let ledger_backend: Arc<dyn LedgerBackend> =
        match LedgerClient::connect(&args.ledger_url, args.request_timeout_ms).await {
            Ok(client) => {
                info!("Ledger connected successfully");
                Arc::new(client)
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("Ledger connection failed (dev mode, using in-memory ledger): {}", e);
                    Arc::new(MemoryLedger::new())
                } else {
                    error!("Ledger connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };
    let ledger = LifecycleLedger::new(ledger_backend);

    // Content store backend (in-memory fallback in dev mode)
    let content: Arc<dyn ContentStore> = match &args.storage_url {
        Some(storage_url) => Arc::new(HttpContentStore::new(
            storage_url,
            &args.gateway_url,
            args.request_timeout_ms,
        )?),
        None => {
            warn!("No STORAGE_URL configured, using in-memory content store");
            Arc::new(MemoryContentStore::new(&args.gateway_url))
        }
    };

    // Connect to MongoDB (optional in dev mode)
    let records: Arc<dyn RecordStore> =
        match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(client) => {
                info!("MongoDB connected successfully");
                Arc::new(MongoRecordStore::new(client))
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using in-memory records): {}", e);
                    Arc::new(MemoryRecordStore::new())
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };

    // Freshness classifier health check, once at startup
    let freshness = Arc::new(FreshnessInference::new(
        args.classifier_command(),
        Duration::from_millis(args.classifier_timeout_ms),
    ));
    freshness.probe().await;

    // Telemetry feed, fed from NATS (optional in dev mode)
    let telemetry = Arc::new(TelemetryFeed::new());
    match NatsClient::new(&args.nats, &format!("fieldtrace-{}", args.node_id)).await {
        Ok(nats) => {
            info!("NATS connected successfully");
            let feed = Arc::clone(&telemetry);
            let prefix = args.telemetry_subject_prefix.clone();
            tokio::spawn(async move {
                if let Err(e) = feed.run_ingest(nats, &prefix).await {
                    error!("Telemetry ingestion failed: {}", e);
                }
            });
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, telemetry disabled): {}", e);
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let service = ProvenanceService::new(ledger, content, freshness, records, telemetry);
    let state = Arc::new(server::AppState::new(args, service));

    // Run the server
    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
