//! rendezvousd - Rendezvous matchmaking broker
//!
//! Pairs anonymous clients two at a time so they can open a direct
//! peer-to-peer audio connection. The broker only introduces the parties;
//! no audio ever passes through it.

mod config;
mod db;
mod error;
mod http;
mod metrics;
mod network;
mod state;
mod telemetry;

use crate::config::{Config, StoreBackend};
use crate::db::{Database, SharedQueue};
use crate::network::Gateway;
use crate::network::limit::RateLimitManager;
use crate::state::{
    Broker, BrokerHandle, Lifecycle, LocalRelay, Matchmaker, MemorySlot, NoticeRelay, WaitingSlot,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often oversized rate limiter maps are pruned.
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("RENDEZVOUSD_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path);
    }

    let instance = config.server.instance_id();
    info!(
        server = %config.server.name,
        instance = %instance,
        backend = ?config.store.backend,
        "Starting rendezvousd"
    );

    // Prometheus metrics are optional.
    // Convention: metrics_port = 0 disables the HTTP endpoint (used by tests).
    let metrics_port = config.server.metrics_port.unwrap_or(9090);
    if metrics_port != 0 {
        metrics::init();
        info!("Metrics initialized");
    }

    // Choose where the waiting slot lives
    let (slot, relay, shared) = match config.store.backend {
        StoreBackend::Memory => {
            let slot: Arc<dyn WaitingSlot> = Arc::new(MemorySlot::new());
            let relay: Arc<dyn NoticeRelay> = Arc::new(LocalRelay);
            (slot, relay, None)
        }
        StoreBackend::Shared => {
            let db = Database::new(&config.store.path).await?;
            let queue = db.queue(instance.clone(), config.store.lease());
            let slot: Arc<dyn WaitingSlot> = Arc::new(queue.clone());
            let relay: Arc<dyn NoticeRelay> = Arc::new(queue.clone());
            (slot, relay, Some(queue))
        }
    };

    let matchmaker = Matchmaker::new(slot, instance.clone(), config.matchmaking.claim_retries);
    let broker = Broker::spawn(Lifecycle::new(matchmaker, relay));
    info!(claim_retries = config.matchmaking.claim_retries, "Broker started");

    if let Some(queue) = shared {
        spawn_notice_poller(queue.clone(), broker.clone(), config.store.poll_interval());
        spawn_lease_keeper(queue, config.store.heartbeat());
        info!(path = %config.store.path, "Shared queue store tasks started");
    }

    if metrics_port != 0 {
        let broker = broker.clone();
        tokio::spawn(async move {
            http::run_http_server(metrics_port, broker).await;
        });
        info!(port = metrics_port, "Prometheus HTTP server started");
    }

    let rate_limiter = Arc::new(RateLimitManager::new(&config.limits));
    {
        let rate_limiter = Arc::clone(&rate_limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                rate_limiter.cleanup();
            }
        });
    }

    // Start the Gateway (with optional TLS and WebSocket)
    let gateway = Gateway::bind(&config, broker.clone(), rate_limiter).await?;

    let result = tokio::select! {
        result = gateway.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    broker.shutdown().await;
    info!("Broker stopped");
    result
}

/// Forward claims and departures other instances left for us to the broker.
fn spawn_notice_poller(queue: SharedQueue, broker: BrokerHandle, every: Duration) {
    let span = telemetry::spans::store_task("poll", queue.instance().as_str());
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let notices = match queue.drain(queue.instance()).await {
                    Ok(notices) => notices,
                    Err(e) => {
                        warn!(error = %e, "Failed to drain notices");
                        continue;
                    }
                };
                for notice in notices {
                    if broker.remote(notice).await.is_err() {
                        info!("Broker stopped - notice poller exiting");
                        return;
                    }
                }
            }
        }
        .instrument(span),
    );
}

/// Renew our leases and sweep entries whose owner went away.
fn spawn_lease_keeper(queue: SharedQueue, every: Duration) {
    let span = telemetry::spans::store_task("lease", queue.instance().as_str());
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = queue.renew_leases().await {
                    warn!(error = %e, "Failed to renew leases");
                }
                match queue.reap_orphans().await {
                    Ok(removed) if removed > 0 => info!(removed, "Orphaned queue records reaped"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to reap orphaned queue records"),
                }
            }
        }
        .instrument(span),
    );
}
