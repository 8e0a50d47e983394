// ═══════════════════════════════════════════════════════════════
// METRICS STORE - rolling counters for the archive dashboard
// ═══════════════════════════════════════════════════════════════
//
// Four groups of numbers: scraping, ai, database, system. Updates come
// from the queue, the archive sink, the proxy health loop and whatever
// the backend pushes over the event stream.
//
// - One lock around the whole bundle, so a derived field (success rate,
//   running averages) is always computed from the counters next to it
// - Updates only mark the bundle dirty; the ticker writes it as JSON
//   (temp file + rename) on the blocking pool, and once more at shutdown
// - A ticker pushes a snapshot to watch subscribers on a fixed interval
// - The bundle carries a schema version; a file from another version is
//   thrown away instead of half-loaded

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::RemoteGauges;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapingMetrics {
    pub total_documents: u64,
    pub failed_attempts: u64,
    /// Integer percent, 0-100.
    pub success_rate: u32,
    pub average_processing_time_ms: f64,
    pub active_proxies: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiMetrics {
    pub models_loaded: u32,
    pub total_analyzed: u64,
    /// 0.0-1.0.
    pub average_confidence: f64,
    pub average_processing_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    pub total_records: u64,
    pub queries: u64,
    pub average_query_time_ms: f64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub uptime_secs: u64,
    /// Percent, 0-100.
    pub cpu_usage: f64,
    /// Percent, 0-100.
    pub memory_usage: f64,
    pub network_latency_ms: f64,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBundle {
    pub version: u32,
    pub scraping: ScrapingMetrics,
    pub ai: AiMetrics,
    pub database: DatabaseMetrics,
    pub system: SystemMetrics,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for MetricBundle {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            scraping: ScrapingMetrics::default(),
            ai: AiMetrics::default(),
            database: DatabaseMetrics::default(),
            system: SystemMetrics::default(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapingUpdate {
    pub success: bool,
    pub processing_time: Duration,
    pub proxy_count: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct AiUpdate {
    pub confidence: f64,
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseUpdate {
    pub records_added: u64,
    pub query_time: Duration,
    pub storage_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUpdate {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub network_latency_ms: Option<f64>,
}

/// Display-only composite scores, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub health: f64,
    pub performance: f64,
    pub reliability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: MetricBundle,
    pub summary: PerformanceSummary,
    pub taken_at: DateTime<Utc>,
}

/// `(avg * (n - 1) + x) / n`, where `n` already counts `x`.
pub fn incremental_mean(avg: f64, n: u64, x: f64) -> f64 {
    if n <= 1 {
        return x;
    }
    let n = n as f64;
    (avg * (n - 1.0) + x) / n
}

/// Rounded integer percent. Zero attempts is 0%, not NaN.
pub fn success_rate(succeeded: u64, failed: u64) -> u32 {
    let total = succeeded + failed;
    if total == 0 {
        return 0;
    }
    ((succeeded as f64 / total as f64) * 100.0).round() as u32
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// 100 at zero latency, falling linearly to 0 at `budget_ms`.
fn latency_score(ms: f64, budget_ms: f64) -> f64 {
    clamp_percent(100.0 * (1.0 - ms / budget_ms))
}

/// Weighted composites over a bundle. Pure: same bundle, same scores.
pub fn performance_summary(bundle: &MetricBundle) -> PerformanceSummary {
    let success = bundle.scraping.success_rate as f64;
    let confidence = clamp_percent(bundle.ai.average_confidence * 100.0);
    let cpu_headroom = 100.0 - clamp_percent(bundle.system.cpu_usage);
    let memory_headroom = 100.0 - clamp_percent(bundle.system.memory_usage);

    let health = success * 0.3 + confidence * 0.3 + cpu_headroom * 0.2 + memory_headroom * 0.2;

    let performance = latency_score(bundle.scraping.average_processing_time_ms, 10_000.0) * 0.4
        + latency_score(bundle.database.average_query_time_ms, 1_000.0) * 0.3
        + latency_score(bundle.system.network_latency_ms, 1_000.0) * 0.3;

    let proxy_score = clamp_percent(bundle.scraping.active_proxies as f64 * 20.0);
    let error_score = 100.0 - clamp_percent(bundle.system.error_count as f64);
    let reliability = success * 0.5 + proxy_score * 0.3 + error_score * 0.2;

    PerformanceSummary {
        health: round1(clamp_percent(health)),
        performance: round1(clamp_percent(performance)),
        reliability: round1(clamp_percent(reliability)),
    }
}

pub struct MetricsStore {
    bundle: RwLock<MetricBundle>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
    persist_failures: AtomicU64,
    dirty: AtomicBool,
    started: Instant,
    snapshots: watch::Sender<MetricsSnapshot>,
}

impl MetricsStore {
    /// Load the persisted bundle from `path` if there is a usable one,
    /// otherwise start from zero. Changes reach `path` on the next
    /// [`MetricsStore::persist_if_dirty`] or [`MetricsStore::persist`].
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let bundle = load_bundle(&path).unwrap_or_default();
        Self::with_bundle(bundle, Some(path))
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_bundle(MetricBundle::default(), None)
    }

    fn with_bundle(bundle: MetricBundle, path: Option<PathBuf>) -> Self {
        let initial = MetricsSnapshot {
            summary: performance_summary(&bundle),
            metrics: bundle.clone(),
            taken_at: Utc::now(),
        };
        let (snapshots, _) = watch::channel(initial);
        Self {
            bundle: RwLock::new(bundle),
            path,
            persist_lock: Mutex::new(()),
            persist_failures: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            started: Instant::now(),
            snapshots,
        }
    }

    pub fn update_scraping_metrics(&self, update: ScrapingUpdate) {
        self.mutate(|b| {
            let s = &mut b.scraping;
            if update.success {
                s.total_documents += 1;
            } else {
                s.failed_attempts += 1;
            }
            let attempts = s.total_documents + s.failed_attempts;
            s.average_processing_time_ms = incremental_mean(
                s.average_processing_time_ms,
                attempts,
                update.processing_time.as_secs_f64() * 1000.0,
            );
            s.success_rate = success_rate(s.total_documents, s.failed_attempts);
            if let Some(count) = update.proxy_count {
                s.active_proxies = count;
            }
        });
    }

    pub fn update_ai_metrics(&self, update: AiUpdate) {
        self.mutate(|b| {
            let ai = &mut b.ai;
            ai.total_analyzed += 1;
            let confidence = if update.confidence.is_finite() {
                update.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            ai.average_confidence =
                incremental_mean(ai.average_confidence, ai.total_analyzed, confidence);
            ai.average_processing_time_ms = incremental_mean(
                ai.average_processing_time_ms,
                ai.total_analyzed,
                update.processing_time.as_secs_f64() * 1000.0,
            );
        });
    }

    pub fn update_database_metrics(&self, update: DatabaseUpdate) {
        self.mutate(|b| {
            let db = &mut b.database;
            db.total_records += update.records_added;
            db.queries += 1;
            db.average_query_time_ms = incremental_mean(
                db.average_query_time_ms,
                db.queries,
                update.query_time.as_secs_f64() * 1000.0,
            );
            if let Some(bytes) = update.storage_bytes {
                db.storage_bytes = bytes;
            }
        });
    }

    pub fn update_system_metrics(&self, update: SystemUpdate) {
        self.mutate(|b| {
            let sys = &mut b.system;
            if let Some(cpu) = update.cpu_usage {
                sys.cpu_usage = clamp_percent(cpu);
            }
            if let Some(mem) = update.memory_usage {
                sys.memory_usage = clamp_percent(mem);
            }
            if let Some(latency) = update.network_latency_ms.filter(|l| l.is_finite()) {
                sys.network_latency_ms = latency.max(0.0);
            }
        });
    }

    pub fn set_active_proxies(&self, count: u32) {
        self.mutate(|b| b.scraping.active_proxies = count);
    }

    pub fn record_error(&self) {
        self.mutate(|b| b.system.error_count += 1);
    }

    pub fn record_model_loaded(&self) {
        self.mutate(|b| b.ai.models_loaded += 1);
    }

    /// Overwrite whatever gauges the backend pushed.
    pub fn apply_remote(&self, gauges: &RemoteGauges) {
        self.update_system_metrics(SystemUpdate {
            cpu_usage: gauges.cpu_usage,
            memory_usage: gauges.memory_usage,
            network_latency_ms: gauges.network_latency,
        });
        if gauges.active_proxies.is_some() || gauges.total_records.is_some() {
            self.mutate(|b| {
                if let Some(active) = gauges.active_proxies {
                    b.scraping.active_proxies = active;
                }
                if let Some(records) = gauges.total_records {
                    b.database.total_records = records;
                }
            });
        }
    }

    pub fn bundle(&self) -> MetricBundle {
        let mut bundle = self.bundle.read().clone();
        bundle.system.uptime_secs = self.started.elapsed().as_secs();
        bundle
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        performance_summary(&self.bundle())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.bundle();
        MetricsSnapshot {
            summary: performance_summary(&metrics),
            metrics,
            taken_at: Utc::now(),
        }
    }

    /// Receives a fresh snapshot on every ticker interval.
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Push the current snapshot to subscribers.
    pub fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    fn mutate(&self, f: impl FnOnce(&mut MetricBundle)) {
        {
            let mut bundle = self.bundle.write();
            f(&mut bundle);
            bundle.updated_at = Some(Utc::now());
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the bundle only if something changed since the last write.
    /// Returns whether a write was attempted. Blocking file IO.
    pub fn persist_if_dirty(&self) -> bool {
        if self.path.is_none() || !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.persist();
        true
    }

    /// Write the current bundle to disk. Serialized so the last writer
    /// always writes the latest state. Blocking file IO.
    pub fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.persist_lock.lock();
        self.dirty.store(false, Ordering::Release);
        let bundle = self.bundle();
        if let Err(e) = write_bundle(path, &bundle) {
            self.dirty.store(true, Ordering::Release);
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, path = %path.display(), "Failed to persist metrics");
        }
    }
}

fn load_bundle(path: &Path) -> Option<MetricBundle> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Could not read persisted metrics");
            return None;
        }
    };

    let bundle: MetricBundle = match serde_json::from_slice(&raw) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Persisted metrics are corrupt — starting fresh");
            return None;
        }
    };

    if bundle.version != SCHEMA_VERSION {
        warn!(
            found = bundle.version,
            expected = SCHEMA_VERSION,
            "Persisted metrics use another schema version — starting fresh"
        );
        return None;
    }

    info!(
        path = %path.display(),
        documents = bundle.scraping.total_documents,
        records = bundle.database.total_records,
        "Restored persisted metrics"
    );
    Some(bundle)
}

fn write_bundle(path: &Path, bundle: &MetricBundle) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(bundle)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Push a snapshot every `interval` and flush pending changes to disk,
/// until shutdown, then persist one last time.
pub async fn run_snapshot_ticker(
    store: Arc<MetricsStore>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.publish_snapshot();
                let flusher = Arc::clone(&store);
                if let Err(e) = tokio::task::spawn_blocking(move || flusher.persist_if_dirty()).await {
                    warn!(error = %e, "Metrics flush task failed");
                }
                let summary = store.performance_summary();
                debug!(
                    health = summary.health,
                    performance = summary.performance,
                    reliability = summary.reliability,
                    "Metrics snapshot published"
                );
            }
            _ = shutdown.changed() => {
                let flusher = Arc::clone(&store);
                if let Err(e) = tokio::task::spawn_blocking(move || flusher.persist()).await {
                    warn!(error = %e, "Final metrics flush failed");
                }
                info!("Metrics ticker: shutting down");
                break;
            }
        }
    }
}
