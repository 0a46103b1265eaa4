//! Trustee Gateway service
//!
//! Wires the store, background maintenance and the HTTP router together, then
//! serves until SIGINT/SIGTERM and shuts everything down in order.

use anyhow::{Context, Result};
use gateway_store::{
    AuditLedger, AuditSink, BackingStore, HeartbeatRegistry, MigrationLock, RedisMigrationLock,
    RetentionScheduler, SnapshotManager, StoreMode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trustee_gateway::config::Config;
use trustee_gateway::forwarder::Forwarder;
use trustee_gateway::rvps::{GrpcRvpsClient, ReferenceValueProvider};
use trustee_gateway::{create_router, AppState};

const DEFAULT_LOG_FILTER: &str = "info,trustee_gateway=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Trustee Gateway");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration loaded - listening on {}, database mode: {}",
        config.listen_address(),
        config.database_mode
    );

    // The distributed lock only matters when processes share one file.
    // Redis is contacted lazily; if it is unreachable the migration is skipped.
    let migration_lock = match (&config.migration_lock_redis_url, config.database_mode) {
        (Some(url), StoreMode::Shared) => Some(
            RedisMigrationLock::new(url).context("Invalid MIGRATION_LOCK_REDIS_URL")?,
        ),
        _ => None,
    };

    let store = BackingStore::open(
        config.store_config(),
        migration_lock.as_ref().map(|lock| lock as &dyn MigrationLock),
    )
    .await
    .context("Failed to open database")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let snapshots = if store.mode() == StoreMode::Memory {
        let manager = SnapshotManager::new(store.clone(), config.snapshot_config())
            .context("Failed to create snapshot manager")?;
        Some(manager.start(shutdown_rx.clone()))
    } else {
        None
    };

    let ledger = AuditLedger::new(store.clone());
    let retention = RetentionScheduler::new(ledger.clone(), config.retention_config())
        .start(shutdown_rx.clone())
        .await;
    let (audit, audit_writer) = AuditSink::spawn(ledger.clone(), config.audit_queue_capacity);
    let heartbeats = HeartbeatRegistry::new(store.clone(), config.heartbeat_timeout());

    let rvps: Option<Arc<dyn ReferenceValueProvider>> = match config.rvps_grpc_addr.as_deref() {
        Some(addr) => match GrpcRvpsClient::connect_lazy(addr) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Failed to create RVPS gRPC client: {:#}", e);
                None
            }
        },
        None => {
            info!("RVPS gRPC address not configured, RVPS routes are disabled");
            None
        }
    };

    let forwarder = Forwarder::new(&config.kbs_url, &config.attestation_service_url, rvps)
        .context("Failed to create forwarder")?;

    let app = create_router(AppState {
        forwarder,
        audit,
        ledger,
        heartbeats,
    });

    let listener = TcpListener::bind(&config.listen_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_address()))?;

    info!("Trustee Gateway listening on {}", config.listen_address());
    info!("Health check: http://{}/api/health", config.listen_address());

    let mut server_shutdown = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
    });

    let mut server_done = false;
    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            server_done = true;
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
        }
    }

    info!("Shutting down Trustee Gateway");
    let _ = shutdown_tx.send(true);

    if !server_done {
        match tokio::time::timeout(config.shutdown_grace(), &mut server).await {
            Ok(Ok(Ok(()))) => info!("HTTP server drained"),
            Ok(Ok(Err(e))) => error!("Server error: {}", e),
            Ok(Err(e)) => error!("Server task failed: {}", e),
            Err(_) => {
                warn!(
                    "Grace period of {:?} elapsed, aborting in-flight requests",
                    config.shutdown_grace()
                );
                server.abort();
            }
        }
    }

    retention.stop().await;
    audit_writer.drain().await;
    if let Some(snapshots) = snapshots {
        snapshots.shutdown().await;
    }
    if let Err(e) = store.close().await {
        error!("Failed to close database: {}", e);
    }

    info!("Trustee Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
