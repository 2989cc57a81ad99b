mod config;
mod db;
mod error;
mod handlers;
mod jobs;
mod models;
mod protocols;
mod router;
mod scope;
mod services;
mod utils;
mod vendor;

use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::{RadiusStore, Store};
use jobs::Scheduler;
use protocols::{DefaultOltConnector, RouterOsConnector};
use services::{
    DeviceProbes, IpamService, MonitoringService, OltService, OltSettings, PppoeService, PppoeSettings,
    RadiusService,
};

/// Number of attempts for one OLT configuration backup
const BACKUP_ATTEMPTS: u32 = 3;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub ipam: IpamService,
    pub pppoe: PppoeService,
    pub radius: RadiusService,
    pub olts: OltService,
    pub monitoring: MonitoringService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netcore=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load();
    tracing::info!("Starting NetCore Server");
    tracing::info!("Database: {}", cfg.db_path);
    tracing::info!("RADIUS database: {}", cfg.radius_db_path);
    tracing::info!("Backup dir: {}", cfg.backup_dir.display());
    tracing::info!("Listen: {}", cfg.listen_addr);

    // Initialize databases
    let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections).await?;
    tracing::info!("Database initialized (pool_size={})", cfg.db_max_connections);
    let radius_store = RadiusStore::with_pool_size(&cfg.radius_db_path, cfg.db_max_connections).await?;
    tracing::info!("RADIUS database initialized");

    if let Err(e) = tokio::fs::create_dir_all(&cfg.backup_dir).await {
        tracing::warn!("Could not create backup dir {}: {}", cfg.backup_dir.display(), e);
    }

    // Services
    let ipam = IpamService::new(store.clone());
    let radius = RadiusService::new(radius_store, cfg.router_timeout);
    let pppoe = PppoeService::new(
        store.clone(),
        ipam.clone(),
        Arc::new(radius.clone()),
        Arc::new(RouterOsConnector::new(cfg.router_timeout)),
        PppoeSettings {
            item_timeout: cfg.bulk_item_timeout,
            batch_timeout: cfg.bulk_batch_timeout,
        },
    );
    let olts = OltService::new(
        store.clone(),
        Arc::new(DefaultOltConnector::new(cfg.snmp_timeout, cfg.olt_timeout)),
        OltSettings {
            operation_timeout: cfg.olt_timeout,
            confirm_delay: cfg.onu_confirm_delay,
            backup_dir: cfg.backup_dir.clone(),
            backup_attempts: BACKUP_ATTEMPTS,
            backup_retry_delay: std::time::Duration::from_secs(2),
        },
    );
    let monitoring = MonitoringService::new(
        store.clone(),
        Arc::new(DeviceProbes::new(pppoe.clone(), olts.clone())),
        cfg.failure_threshold,
    );

    // Background jobs
    let scheduler = Scheduler::new(store.clone(), olts.clone(), monitoring.clone());
    scheduler.start(&cfg.olt_sync_schedule, cfg.monitor_interval, cfg.aggregate_interval);

    let state = Arc::new(AppState {
        store,
        ipam,
        pppoe,
        radius,
        olts,
        monitoring,
    });

    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("NetCore listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("NetCore shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
}
