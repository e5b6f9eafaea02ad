//! Wires the cache engine's components into one shared handle, spawns the
//! background jobs, and owns the graceful-shutdown sequence (§1.4).

use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coalesce::RequestCoalescer;
use crate::config::Config;
use crate::disk::DiskTier;
use crate::error::Error;
use crate::origin::OriginFetcher;
use crate::ram::RamTier;
use crate::ratelog::RateLimitedLogger;
use crate::revalidate::Revalidator;
use crate::rules::RuleEngine;
use crate::sitemap::{SitemapConfig, SitemapDiscoverer};
use crate::stats::Stats;

const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(60);
const COALESCE_MAX_WAITERS: usize = 256;
const SHUTDOWN_BOUND: Duration = Duration::from_secs(10);

pub struct AppState {
    pub ram: Arc<RamTier>,
    pub disk: Arc<DiskTier>,
    pub origin: Arc<OriginFetcher>,
    pub rule_engine: Arc<RuleEngine>,
    pub coalescer: RequestCoalescer,
    pub revalidator: Arc<Revalidator>,
    pub stats: Arc<Stats>,
}

/// Everything spawned at startup that must be torn down on shutdown.
pub struct Handles {
    pub stop_tx: watch::Sender<bool>,
    pub tasks: Vec<tokio::task::JoinHandle<()>>,
    pub disk: Arc<DiskTier>,
}

impl Handles {
    /// Signals every background task to stop, drains the disk writer, and
    /// flushes the KV store. Bounded to 10 seconds (§5 "Cancellation").
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);

        let join_all = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_BOUND, join_all).await.is_err() {
            tracing::warn!("graceful shutdown exceeded 10s bound, proceeding anyway");
        }

        self.disk.shutdown().await;
    }
}

/// Builds the router and shared state, and spawns the stats/warmup/sitemap
/// background tasks. The disk tier presents an empty logical cache on
/// startup per §6's contract — the chosen approach here is to wipe the KV
/// directory before opening it (see DESIGN.md for the Open Question
/// decision).
pub async fn build(config: Config) -> Result<(Router, Handles), Error> {
    let disk_path = &config.storage.disk.path;
    if std::path::Path::new(disk_path).exists() {
        std::fs::remove_dir_all(disk_path).map_err(|e| Error::Config(format!("wiping disk tier at startup: {e}")))?;
    }

    let disk = Arc::new(DiskTier::open(disk_path, config.storage.disk.max.bytes(), OVERFLOW_LOG_INTERVAL)?);
    let ram = Arc::new(RamTier::new(config.storage.ram.max.bytes(), RateLimitedLogger::new(OVERFLOW_LOG_INTERVAL)));
    let origin = Arc::new(OriginFetcher::new(config.server.origin.clone(), Duration::from_secs(30))?);
    let rules = config.into_rules()?;
    let rule_engine = Arc::new(RuleEngine::new(rules.clone()));
    let revalidator = Arc::new(Revalidator::new());
    let coalescer = RequestCoalescer::new(COALESCE_MAX_WAITERS);
    let stats = Arc::new(Stats::new());

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(crate::stats::spawn_stats_task(
        Arc::clone(&ram),
        Arc::clone(&disk),
        Arc::clone(&stats),
        config.logging.log_stats_every,
        false,
        stop_rx.clone(),
    ));

    tasks.extend(crate::warmup::spawn_warmup_tasks(
        rules,
        Arc::clone(&ram),
        Arc::clone(&disk),
        Arc::clone(&origin),
        Arc::clone(&revalidator),
        config.logging.warmup_logging_enabled(),
        stop_rx.clone(),
    ));

    if let Some(discover_cfg) = &config.urls_discover {
        let sitemap_config = SitemapConfig {
            initial_delay: discover_cfg.initial_delay,
            rediscover_every: discover_cfg.rediscover_every,
            sitemaps: discover_cfg.sitemaps.clone(),
            log_url_autodiscover: config.logging.log_url_autodiscover,
        };
        let discoverer = Arc::new(SitemapDiscoverer::new(reqwest::Client::new(), config.server.origin.clone(), sitemap_config));
        tasks.push(crate::sitemap::spawn_discovery_task(
            discoverer,
            Arc::clone(&rule_engine),
            Arc::clone(&ram),
            Arc::clone(&disk),
            stop_rx.clone(),
        ));
    }

    let state = Arc::new(AppState { ram, disk: Arc::clone(&disk), origin, rule_engine, coalescer, revalidator, stats });

    let router = Router::new()
        .fallback(any(crate::handler::handle_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(port = config.server.port, origin = %config.server.origin, "wait0 cache engine ready");

    Ok((router, Handles { stop_tx, tasks, disk }))
}
