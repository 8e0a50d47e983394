// ██╗     ███████╗ ██████╗  █████╗ ██╗
// ██║     ██╔════╝██╔════╝ ██╔══██╗██║
// ██║     █████╗  ██║  ███╗███████║██║
// ██║     ██╔══╝  ██║   ██║██╔══██║██║
// ███████╗███████╗╚██████╔╝██║  ██║███████╗
// ╚══════╝╚══════╝ ╚═════╝ ╚═╝  ╚═╝╚══════╝
//
//  A R C H I V E   E N G I N E
//
// Headless engine behind the Persian legal archive dashboard: listens to the
// backend's event stream, keeps the metrics, watches the proxies, works the
// document queue, classifies what comes back and archives it in Redis.

mod archive_sink;
mod backend;
mod circuit_breaker;
mod classifier;
mod config;
mod dedup;
mod dispatch;
mod error;
mod event_bus;
mod metrics;
mod models;
mod proxy_pool;
mod queue;
mod status_server;
mod ws_client;

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::archive_sink::ArchiveSink;
use crate::backend::HttpProcessor;
use crate::config::Config;
use crate::dedup::DedupEngine;
use crate::dispatch::Dispatcher;
use crate::event_bus::EventBus;
use crate::metrics::MetricsStore;
use crate::models::{DocumentRecord, Priority};
use crate::proxy_pool::{BreakerSettings, ProxyPool, ProxyProber, TcpProber};
use crate::queue::{DocumentProcessor, DocumentQueue, ProcessOptions, ProcessingContext};
use crate::status_server::{BoardSettings, StatusBoard};
use crate::ws_client::{ReconnectPolicy, WsClient};

fn print_banner(config: &Config) {
    let banner = format!(
        r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║            LEGAL ARCHIVE ENGINE  ·  آرشیو حقوقی              ║
    ║                                                              ║
    ║   Events:     {:<46} ║
    ║   Backend:    {:<46} ║
    ║   Archive:    {:<46} ║
    ║   Status:     http://0.0.0.0:{:<31} ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝
"#,
        config.ws_url, config.api_base_url, config.redis_url, config.status_port
    );
    println!("{}", banner);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(config.log_json);
    print_banner(&config);

    info!("Legal archive engine initializing");

    // Shared state
    let bus = Arc::new(EventBus::new(config.channel_capacity));
    let metrics = Arc::new(MetricsStore::open(&config.metrics_path));
    let dedup = Arc::new(DedupEngine::new(
        config.bloom_expected_items,
        config.bloom_false_positive_rate,
        config.lru_cache_size,
        config.bloom_rotation_interval,
    ));
    let pool = Arc::new(ProxyPool::new(
        proxy_pool::parse_proxy_list(&config.proxy_specs()),
        BreakerSettings {
            failure_threshold: config.circuit_breaker_failure_threshold,
            reset_timeout: config.circuit_breaker_reset_timeout,
            success_threshold: config.circuit_breaker_success_threshold,
        },
    ));
    let queue = Arc::new(DocumentQueue::new(dedup.clone(), config.queue_max_attempts));
    let ws = Arc::new(WsClient::new(
        config.ws_url.clone(),
        config.ws_client_name.clone(),
        ReconnectPolicy::new(
            config.ws_reconnect_base,
            config.ws_reconnect_max,
            config.ws_max_reconnect_attempts,
        ),
        bus.clone(),
    ));
    info!(proxies = pool.len(), "Proxy pool loaded");

    for url in config.seed_url_list() {
        match queue.enqueue(&url, None, Priority::Normal) {
            Ok(id) => info!(id = %id, url = %url, "Seed URL queued"),
            Err(e) => warn!(url = %url, error = %e, "Seed URL rejected"),
        }
    }

    let (doc_tx, doc_rx) = crossbeam_channel::bounded::<DocumentRecord>(config.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ═══════════════════════════════════════════
    // EVENT STREAM
    // ═══════════════════════════════════════════

    // Subscribe before the socket can deliver anything
    let dispatcher = Dispatcher::new(metrics.clone(), pool.clone());
    let dispatch_events = bus.subscribe_all();
    let mut dispatch_shutdown = shutdown_rx.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatcher.run(dispatch_events, &mut dispatch_shutdown).await;
    });

    let ws_client = ws.clone();
    let mut ws_shutdown = shutdown_rx.clone();
    let ws_handle = tokio::spawn(async move {
        ws_client.run(&mut ws_shutdown).await;
        info!("Event stream client: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // METRICS + PROXIES
    // ═══════════════════════════════════════════

    let ticker_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval;
    let mut ticker_shutdown = shutdown_rx.clone();
    let ticker_handle = tokio::spawn(async move {
        metrics::run_snapshot_ticker(ticker_metrics, metrics_interval, &mut ticker_shutdown).await;
    });

    let health_pool = pool.clone();
    let health_metrics = metrics.clone();
    let prober: Arc<dyn ProxyProber> = Arc::new(TcpProber::new(config.proxy_probe_timeout));
    let health_prober = prober.clone();
    let health_config = config.clone();
    let mut health_shutdown = shutdown_rx.clone();
    let health_handle = tokio::spawn(async move {
        proxy_pool::run_health_checks(
            health_pool,
            health_prober,
            health_metrics,
            health_config.proxy_check_interval,
            health_config.proxy_check_concurrency,
            &mut health_shutdown,
        )
        .await;
    });

    // ═══════════════════════════════════════════
    // DOCUMENT PIPELINE
    // ═══════════════════════════════════════════

    let processor: Arc<dyn DocumentProcessor> =
        Arc::new(HttpProcessor::new(&config.api_base_url, config.http_timeout, pool.clone())?);
    let context = ProcessingContext {
        metrics: metrics.clone(),
        archive: doc_tx,
        options: ProcessOptions {
            use_proxy: !pool.is_empty(),
        },
    };
    let worker_queue = queue.clone();
    let poll_interval = config.queue_poll_interval;
    let mut queue_shutdown = shutdown_rx.clone();
    let queue_handle = tokio::spawn(async move {
        worker_queue
            .run(processor, context, poll_interval, &mut queue_shutdown)
            .await;
    });

    let (sink, sink_stats) = ArchiveSink::new(config.clone(), doc_rx, metrics.clone(), shutdown_rx.clone());
    let sink_handle = tokio::spawn(async move {
        if let Err(e) = sink.run().await {
            error!(error = %e, "Archive sink failed");
        }
        info!("Archive sink: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // STATUS BOARD
    // ═══════════════════════════════════════════

    let board = Arc::new(StatusBoard::new(
        ws.clone(),
        bus.clone(),
        metrics.clone(),
        pool.clone(),
        queue.clone(),
        dedup.clone(),
        sink_stats,
        prober,
        BoardSettings {
            probe_concurrency: config.proxy_check_concurrency,
            batch_chunk_size: config.batch_chunk_size,
            batch_delay: config.batch_delay,
        },
    ));
    let status_port = config.status_port;
    let mut status_shutdown = shutdown_rx.clone();
    let status_handle = tokio::spawn(async move {
        if let Err(e) = status_server::run(status_port, board, &mut status_shutdown).await {
            error!(error = %e, "Status board failed");
        }
    });

    info!("All components online, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => warn!("Shutdown signal received"),
        Err(err) => error!(error = %err, "Signal listener error, shutting down"),
    }
    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to complete (timeout: 10s)");
    let joined = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = tokio::join!(
            dispatch_handle,
            ws_handle,
            ticker_handle,
            health_handle,
            queue_handle,
            sink_handle,
            status_handle,
        );
    })
    .await;
    if joined.is_err() {
        warn!("Some tasks did not stop within 10s");
    }

    metrics.persist();
    info!("Legal archive engine: OFFLINE");
    Ok(())
}
