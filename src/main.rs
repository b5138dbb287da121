// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `docsync` server binary.
//!
//! Opens the local store, serves the document API and static files, and
//! replicates with `remote.url` when one is configured.
//!
//! Configuration comes from the JSON file named by `DOCSYNC_CONFIG`, or from
//! environment variables (see [`docsync::config`]).

use docsync::checkpoint::CheckpointStore;
use docsync::config::SyncConfig;
use docsync::server;
use docsync::{HttpEndpoint, RecordStore, ReplicaEndpoint, Replicator, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "docsync exited with error");
        std::process::exit(1);
    }
}

fn load_config() -> Result<SyncConfig> {
    let config = match std::env::var("DOCSYNC_CONFIG") {
        Ok(path) => SyncConfig::from_json_file(path)?,
        Err(_) => SyncConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

async fn run() -> Result<()> {
    let config = load_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node_id,
        db = %config.store.sqlite_path,
        "Starting docsync"
    );

    let store = Arc::new(RecordStore::open(config.node_id.clone(), &config.store).await?);
    let checkpoints = Arc::new(CheckpointStore::open(store.pool().clone()).await?);

    let replicator = match &config.remote {
        Some(remote_config) => {
            let remote: Arc<dyn ReplicaEndpoint> = Arc::new(HttpEndpoint::new(remote_config)?);
            let local: Arc<dyn ReplicaEndpoint> = store.clone();
            let replicator = Arc::new(Replicator::new(
                local,
                remote,
                checkpoints,
                config.replication.clone(),
            ));

            if config.replication.live {
                replicator.start().await?;
            } else {
                let once = Arc::clone(&replicator);
                tokio::spawn(async move {
                    match once.replicate_once().await {
                        Ok(summary) => info!(applied = summary.applied(), "Initial replication done"),
                        Err(e) => warn!(error = %e, "Initial replication failed"),
                    }
                });
            }
            Some(replicator)
        }
        None => {
            info!("No remote configured, running standalone");
            None
        }
    };

    let listener = TcpListener::bind(config.server.bind_addr())
        .await
        .map_err(|e| {
            docsync::SyncError::Config(format!("Cannot bind {}: {}", config.server.bind_addr(), e))
        })?;
    let app = server::app(Arc::clone(&store), &config.server);

    // Replicator first, then the server, then the store.
    let shutdown_replicator = replicator.clone();
    let shutdown = async move {
        server::shutdown_signal().await;
        if let Some(replicator) = shutdown_replicator {
            replicator.shutdown().await;
        }
    };

    server::serve(listener, app, shutdown).await?;
    store.close().await;
    info!("docsync shutdown complete");
    Ok(())
}
