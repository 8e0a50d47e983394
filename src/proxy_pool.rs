// =============================================================================
// proxy_pool.rs — THE PROXY / DNS STATUS BOARD
// =============================================================================
//
// The scraper routes requests through a handful of proxies and resolvers.
// This pool tracks each one through a small state machine:
//
//     inactive ──probe ok──> active ──begin_test──> testing ──ok──> active
//        ^                                             │
//        └──────────────────probe failed───────────────┘
//
// Probes are real (a timed TCP connect by default), never a timer that
// declares victory. Rotation hands out active proxies round-robin, skipping
// any whose circuit breaker is open.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
use crate::error::{ArchiveError, Result};
use crate::metrics::{MetricsStore, SystemUpdate};
use crate::models::{ProxyRecord, ProxyStatus, ProxyType};

/// Something that can tell whether a proxy is reachable and how fast.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(&self, proxy: &ProxyRecord) -> Result<Duration>;
}

/// Measures how long a TCP connect to the proxy takes.
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProxyProber for TcpProber {
    async fn probe(&self, proxy: &ProxyRecord) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(proxy.address())).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ArchiveError::Io(e)),
            Err(_) => Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no answer from {} within {:?}", proxy.address(), self.timeout),
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

struct ProxyEntry {
    record: ProxyRecord,
    breaker: CircuitBreaker,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyPoolSnapshot {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub testing: usize,
    pub open_breakers: usize,
    /// Mean response time over active proxies that have one.
    pub average_response_ms: Option<f64>,
}

pub struct ProxyPool {
    entries: RwLock<Vec<ProxyEntry>>,
    cursor: AtomicUsize,
    breaker: BreakerSettings,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyRecord>, breaker: BreakerSettings) -> Self {
        let pool = Self {
            entries: RwLock::new(Vec::with_capacity(proxies.len())),
            cursor: AtomicUsize::new(0),
            breaker,
        };
        for proxy in proxies {
            pool.add(proxy);
        }
        pool
    }

    fn entry_for(&self, record: ProxyRecord) -> ProxyEntry {
        ProxyEntry {
            breaker: CircuitBreaker::new(
                record.id.clone(),
                self.breaker.failure_threshold,
                self.breaker.reset_timeout,
                self.breaker.success_threshold,
            ),
            record,
        }
    }

    /// Insert a proxy, replacing any existing one with the same id. The
    /// replaced proxy's breaker history is kept.
    pub fn add(&self, mut record: ProxyRecord) {
        if record.id.is_empty() {
            record.id = record.address();
        }
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.record.id == record.id) {
            existing.record = record;
        } else {
            entries.push(self.entry_for(record));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<ProxyRecord> {
        self.entries.read().iter().map(|e| e.record.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<ProxyRecord> {
        self.entries
            .read()
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.record.clone())
    }

    pub fn breakers(&self) -> Vec<CircuitBreakerSnapshot> {
        self.entries.read().iter().map(|e| e.breaker.snapshot()).collect()
    }

    /// `inactive | active -> testing`.
    pub fn begin_test(&self, id: &str) -> Result<ProxyRecord> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| ArchiveError::UnknownProxy(id.to_string()))?;

        if entry.record.status == ProxyStatus::Testing {
            return Err(ArchiveError::ProxyBusy(id.to_string()));
        }
        entry.record.status = ProxyStatus::Testing;
        Ok(entry.record.clone())
    }

    /// `testing -> active` on success, `testing -> inactive` on failure.
    pub fn finish_test(&self, id: &str, outcome: std::result::Result<Duration, String>) -> Result<ProxyRecord> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| ArchiveError::UnknownProxy(id.to_string()))?;

        let record = &mut entry.record;
        record.tests_run += 1;
        record.last_tested = Some(Utc::now());

        match outcome {
            Ok(rtt) => {
                record.tests_passed += 1;
                record.status = ProxyStatus::Active;
                record.response_time_ms = Some(rtt.as_millis() as u64);
                entry.breaker.record_success();
                debug!(proxy = %record.id, rtt_ms = rtt.as_millis() as u64, "Proxy probe ok");
            }
            Err(reason) => {
                record.status = ProxyStatus::Inactive;
                entry.breaker.record_failure();
                warn!(proxy = %record.id, reason = %reason, "Proxy probe failed");
            }
        }
        record.success_rate = record.tests_passed as f64 / record.tests_run as f64 * 100.0;

        Ok(record.clone())
    }

    /// Probe one proxy and move it through the state machine.
    pub async fn test_proxy(&self, id: &str, prober: &dyn ProxyProber) -> Result<ProxyRecord> {
        let record = self.begin_test(id)?;
        let outcome = prober.probe(&record).await.map_err(|e| e.to_string());
        self.finish_test(id, outcome)
    }

    /// Probe every proxy not already under test, at most `concurrency` at
    /// once. Returns the updated records.
    pub async fn test_all(&self, prober: &dyn ProxyProber, concurrency: usize) -> Vec<ProxyRecord> {
        let ids: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.record.status != ProxyStatus::Testing)
            .map(|e| e.record.id.clone())
            .collect();

        futures::stream::iter(ids)
            .map(|id| async move { self.test_proxy(&id, prober).await })
            .buffer_unordered(concurrency.max(1))
            .filter_map(|res| async move { res.ok() })
            .collect()
            .await
    }

    /// Next active proxy whose breaker admits traffic, round-robin.
    pub fn rotate(&self) -> Option<ProxyRecord> {
        let entries = self.entries.read();
        let n = entries.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..n {
            let idx = (start + offset) % n;
            let entry = &entries[idx];
            if entry.record.status == ProxyStatus::Active && entry.breaker.allow_request() {
                self.cursor.store(idx + 1, Ordering::Relaxed);
                return Some(entry.record.clone());
            }
        }
        None
    }

    /// Feed the outcome of a request routed through `id` into its breaker.
    pub fn record_outcome(&self, id: &str, success: bool) {
        if let Some(entry) = self.entries.read().iter().find(|e| e.record.id == id) {
            if success {
                entry.breaker.record_success();
            } else {
                entry.breaker.record_failure();
            }
        }
    }

    /// Manual `active -> inactive`.
    pub fn deactivate(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| ArchiveError::UnknownProxy(id.to_string()))?;
        if entry.record.status == ProxyStatus::Testing {
            return Err(ArchiveError::ProxyBusy(id.to_string()));
        }
        entry.record.status = ProxyStatus::Inactive;
        Ok(())
    }

    /// Upsert status reported by the backend. Local test counters survive.
    pub fn apply_remote(&self, records: Vec<ProxyRecord>) -> usize {
        let mut entries = self.entries.write();
        let mut applied = 0;
        for mut remote in records {
            if remote.host.is_empty() {
                continue;
            }
            if remote.id.is_empty() {
                remote.id = remote.address();
            }
            match entries.iter_mut().find(|e| e.record.id == remote.id) {
                Some(entry) => {
                    // Never clobber a probe we have in flight
                    if entry.record.status != ProxyStatus::Testing && remote.status != ProxyStatus::Testing {
                        entry.record.status = remote.status;
                    }
                    if remote.response_time_ms.is_some() {
                        entry.record.response_time_ms = remote.response_time_ms;
                    }
                    if remote.last_tested.is_some() {
                        entry.record.last_tested = remote.last_tested;
                    }
                    entry.record.success_rate = remote.success_rate;
                }
                None => {
                    if remote.status == ProxyStatus::Testing {
                        remote.status = ProxyStatus::Inactive;
                    }
                    entries.push(self.entry_for(remote));
                }
            }
            applied += 1;
        }
        applied
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.record.status == ProxyStatus::Active)
            .count()
    }

    pub fn snapshot(&self) -> ProxyPoolSnapshot {
        let entries = self.entries.read();
        let count = |s: ProxyStatus| entries.iter().filter(|e| e.record.status == s).count();

        let times: Vec<u64> = entries
            .iter()
            .filter(|e| e.record.status == ProxyStatus::Active)
            .filter_map(|e| e.record.response_time_ms)
            .collect();
        let average_response_ms = if times.is_empty() {
            None
        } else {
            Some(times.iter().sum::<u64>() as f64 / times.len() as f64)
        };

        ProxyPoolSnapshot {
            total: entries.len(),
            active: count(ProxyStatus::Active),
            inactive: count(ProxyStatus::Inactive),
            testing: count(ProxyStatus::Testing),
            open_breakers: entries
                .iter()
                .filter(|e| e.breaker.state() == CircuitState::Open)
                .count(),
            average_response_ms,
        }
    }
}

/// Parse `host:port[:type]` or `type://host:port`.
pub fn parse_proxy_spec(spec: &str) -> Option<ProxyRecord> {
    let spec = spec.trim();

    if spec.contains("://") {
        let url = url::Url::parse(spec).ok()?;
        let proxy_type = ProxyType::parse(url.scheme())?;
        let host = url.host_str()?.to_string();
        let port = url.port()?;
        return Some(ProxyRecord::new(host, port, proxy_type));
    }

    let mut parts = spec.split(':');
    let host = parts.next().filter(|h| !h.is_empty())?;
    let port: u16 = parts.next()?.parse().ok()?;
    let proxy_type = match parts.next() {
        Some(t) => ProxyType::parse(t)?,
        None => ProxyType::Http,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ProxyRecord::new(host, port, proxy_type))
}

pub fn parse_proxy_list(specs: &[String]) -> Vec<ProxyRecord> {
    specs
        .iter()
        .filter_map(|spec| {
            let parsed = parse_proxy_spec(spec);
            if parsed.is_none() {
                warn!(spec = %spec, "Ignoring unparseable proxy spec");
            }
            parsed
        })
        .collect()
}

/// Periodically probe every proxy and push the result into the metrics.
pub async fn run_health_checks(
    pool: Arc<ProxyPool>,
    prober: Arc<dyn ProxyProber>,
    metrics: Arc<MetricsStore>,
    interval: Duration,
    concurrency: usize,
    shutdown: &mut watch::Receiver<bool>,
) {
    info!(
        proxies = pool.len(),
        interval_secs = interval.as_secs(),
        "Proxy health checker online"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pool.is_empty() {
                    continue;
                }
                pool.test_all(prober.as_ref(), concurrency).await;
                let snap = pool.snapshot();
                metrics.set_active_proxies(snap.active as u32);
                if let Some(avg) = snap.average_response_ms {
                    metrics.update_system_metrics(SystemUpdate {
                        network_latency_ms: Some(avg),
                        ..SystemUpdate::default()
                    });
                }
                info!(
                    active = snap.active,
                    inactive = snap.inactive,
                    open_breakers = snap.open_breakers,
                    "Proxy sweep complete"
                );
            }
            _ = shutdown.changed() => {
                info!("Proxy health checker: shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::net::TcpListener;

    struct ScriptedProber {
        healthy: HashSet<String>,
    }

    impl ScriptedProber {
        fn new(healthy: &[&str]) -> Self {
            Self {
                healthy: healthy.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl ProxyProber for ScriptedProber {
        async fn probe(&self, proxy: &ProxyRecord) -> Result<Duration> {
            if self.healthy.contains(&proxy.id) {
                Ok(Duration::from_millis(40))
            } else {
                Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }
    }

    fn pool_of(ids: &[&str]) -> ProxyPool {
        let records = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut r = ProxyRecord::new("10.0.0.1", 8000 + i as u16, ProxyType::Http);
                r.id = id.to_string();
                r
            })
            .collect();
        ProxyPool::new(records, BreakerSettings::default())
    }

    #[test]
    fn test_parse_specs() {
        let p = parse_proxy_spec("proxy.example.ir:1080:socks5").unwrap();
        assert_eq!(p.proxy_type, ProxyType::Socks5);
        assert_eq!(p.id, "proxy.example.ir:1080");
        assert_eq!(p.status, ProxyStatus::Inactive);

        let p = parse_proxy_spec("https://10.1.1.1:8443").unwrap();
        assert_eq!(p.proxy_type, ProxyType::Https);
        assert_eq!(p.port, 8443);

        assert_eq!(parse_proxy_spec("1.1.1.1:53:dns").unwrap().proxy_type, ProxyType::Dns);
        assert!(parse_proxy_spec("nohost").is_none());
        assert!(parse_proxy_spec("host:notaport").is_none());
        assert!(parse_proxy_spec("host:80:carrier-pigeon").is_none());

        let list = parse_proxy_list(&["a:1".into(), "bogus".into(), "b:2:https".into()]);
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_moves_through_state_machine() {
        let pool = pool_of(&["good", "bad"]);
        let prober = ScriptedProber::new(&["good"]);

        let good = pool.test_proxy("good", &prober).await.unwrap();
        assert_eq!(good.status, ProxyStatus::Active);
        assert_eq!(good.response_time_ms, Some(40));
        assert_eq!(good.success_rate, 100.0);
        assert!(good.last_tested.is_some());

        let bad = pool.test_proxy("bad", &prober).await.unwrap();
        assert_eq!(bad.status, ProxyStatus::Inactive);
        assert_eq!(bad.success_rate, 0.0);
    }

    #[test]
    fn test_cannot_test_a_proxy_twice() {
        let pool = pool_of(&["p"]);
        pool.begin_test("p").unwrap();
        assert!(matches!(pool.begin_test("p"), Err(ArchiveError::ProxyBusy(_))));
        assert!(matches!(pool.deactivate("p"), Err(ArchiveError::ProxyBusy(_))));
        assert!(matches!(pool.begin_test("nope"), Err(ArchiveError::UnknownProxy(_))));
    }

    #[test]
    fn test_success_rate_tracks_history() {
        let pool = pool_of(&["p"]);
        for outcome in [Ok(Duration::from_millis(5)), Err("x".to_string()), Ok(Duration::from_millis(5)), Ok(Duration::from_millis(5))] {
            pool.begin_test("p").unwrap();
            pool.finish_test("p", outcome).unwrap();
        }
        let p = pool.get("p").unwrap();
        assert_eq!(p.tests_run, 4);
        assert_eq!(p.tests_passed, 3);
        assert_eq!(p.success_rate, 75.0);
        assert_eq!(p.status, ProxyStatus::Active);
    }

    #[tokio::test]
    async fn test_rotation_skips_inactive_and_round_robins() {
        let pool = pool_of(&["a", "b", "c"]);
        let prober = ScriptedProber::new(&["a", "c"]);
        let tested = pool.test_all(&prober, 2).await;
        assert_eq!(tested.len(), 3);

        let picks: Vec<String> = (0..4).map(|_| pool.rotate().unwrap().id).collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_rotation_skips_tripped_breakers() {
        let pool = pool_of(&["a", "b"]);
        for id in ["a", "b"] {
            pool.begin_test(id).unwrap();
            pool.finish_test(id, Ok(Duration::from_millis(1))).unwrap();
        }
        for _ in 0..3 {
            pool.record_outcome("a", false);
        }
        let tripped = pool.breakers().into_iter().find(|b| b.name == "a").unwrap();
        assert_eq!(tripped.state, CircuitState::Open);
        assert_eq!(pool.rotate().unwrap().id, "b");
        assert_eq!(pool.rotate().unwrap().id, "b");
    }

    #[test]
    fn test_rotate_empty_or_all_down() {
        assert!(ProxyPool::new(vec![], BreakerSettings::default()).rotate().is_none());
        assert!(pool_of(&["a"]).rotate().is_none());
    }

    #[test]
    fn test_apply_remote_upserts() {
        let pool = pool_of(&["a"]);
        let mut remote_a = pool.get("a").unwrap();
        remote_a.status = ProxyStatus::Active;
        remote_a.response_time_ms = Some(90);
        let mut remote_new = ProxyRecord::new("10.9.9.9", 3128, ProxyType::Http);
        remote_new.id = String::new();
        remote_new.status = ProxyStatus::Testing;

        assert_eq!(pool.apply_remote(vec![remote_a, remote_new]), 2);
        assert_eq!(pool.get("a").unwrap().status, ProxyStatus::Active);
        assert_eq!(pool.get("10.9.9.9:3128").unwrap().status, ProxyStatus::Inactive);

        let snap = pool.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.average_response_ms, Some(90.0));
    }

    #[tokio::test]
    async fn test_tcp_prober_against_real_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber::new(Duration::from_secs(2));

        let up = ProxyRecord::new("127.0.0.1", port, ProxyType::Http);
        assert!(prober.probe(&up).await.is_ok());

        drop(listener);
        let down = ProxyRecord::new("127.0.0.1", port, ProxyType::Http);
        assert!(prober.probe(&down).await.is_err());
    }
}
