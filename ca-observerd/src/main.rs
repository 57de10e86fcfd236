mod ca;
mod config;
mod names;
mod store;
mod store_manager;
mod tracker;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use crate::ca::batch::{BatchHandler, BatchSettings};
use crate::ca::beacon::BeaconProtocol;
use crate::ca::receiver::run_receiver;
use crate::ca::search::SearchProtocol;
use crate::ca::{BeaconEvent, SearchDatagram};
use crate::config::Config;
use crate::names::{DnsResolver, NameService};
use crate::store_manager::StoreHandle;
use crate::tracker::{ExpirySettings, Tracker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config first so the log level can come from it
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ca-observer/observer.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("ca_observerd={}", config.general.log_level))
            })
        )
        .init();

    tracing::info!("Starting ca-observerd");
    tracing::info!("Loaded config from {}", config_path);

    let names = NameService::new(
        Box::new(DnsResolver),
        config.tasks.dns_cache_max,
        Duration::from_secs(config.tasks.dns_cache_max_age_secs),
    );
    let tracker = Arc::new(Tracker::new(ExpirySettings::from(&config.ca), names));

    // Start store workers
    let (store, workers) = StoreHandle::spawn(&config.db, tracker)?;
    tracing::info!(
        "Opened database at {:?} with {} workers",
        config.db.db_path,
        config.db.workers
    );
    store.write_config().await?;

    let cancel = CancellationToken::new();

    // Beacon receiver, fed by the local repeater
    let beacon_socket = ca::socket::beacon_socket()?;
    let repeater = SocketAddr::from((Ipv4Addr::LOCALHOST, config.ca.beacon_port));
    let retry = match config.ca.registration_retry_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let beacon_settings = BatchSettings {
        name: "Beacon",
        flush_period: config.ca.flush_period(),
        max_queue: config.ca.beacon_max_queue,
    };
    let beacon_cancel = cancel.clone();
    let beacon_store: Arc<dyn BatchHandler<BeaconEvent>> = Arc::new(store.clone());
    let beacon_handle = tokio::spawn(async move {
        if let Err(e) = run_receiver(
            beacon_socket,
            BeaconProtocol::new(repeater, retry),
            beacon_store,
            beacon_settings,
            beacon_cancel,
        )
        .await
        {
            tracing::error!("Beacon receiver error: {:#}", e);
        }
    });

    // Search receiver
    let search_socket = ca::socket::search_socket(config.ca.search_interface, config.ca.search_port)?;
    let search_settings = BatchSettings {
        name: "Search",
        flush_period: config.ca.flush_period(),
        max_queue: config.ca.search_max_queue,
    };
    let search_cancel = cancel.clone();
    let search_store: Arc<dyn BatchHandler<SearchDatagram>> = Arc::new(store.clone());
    let search_handle = tokio::spawn(async move {
        if let Err(e) = run_receiver(
            search_socket,
            SearchProtocol,
            search_store,
            search_settings,
            search_cancel,
        )
        .await
        {
            tracing::error!("Search receiver error: {:#}", e);
        }
    });

    // Expiry sweeps, name resolution, stats and aggregation
    let task_cancel = cancel.clone();
    let task_store = store.clone();
    let task_config = config.tasks.clone();
    let task_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(task_store, task_config, task_cancel).await {
            tracing::error!("Periodic task error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    // Receivers flush what they still hold before returning
    let _ = tokio::join!(beacon_handle, search_handle, task_handle);

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store workers: {:#}", e);
    }
    if tokio::task::spawn_blocking(move || workers.join()).await.is_err() {
        tracing::error!("Failed to join store workers");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
