// =============================================================================
// config.rs — EVERY KNOB THE ENGINE HAS
// =============================================================================
//
// All values can be overridden via environment variables prefixed with
// LEGAL_ARCHIVE_. A `.env` file in the working directory is honoured too.
// Unparseable values silently fall back to the default.
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Every tunable parameter in the engine lives here.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // EVENT STREAM
    // =========================================================================

    /// WebSocket endpoint the backend pushes events on.
    pub ws_url: String,

    /// Name we announce in the handshake frame.
    pub ws_client_name: String,

    /// First reconnect delay. Doubles every attempt.
    pub ws_reconnect_base: Duration,

    /// Ceiling for the reconnect delay.
    pub ws_reconnect_max: Duration,

    /// How many reconnects we try before giving up for good.
    pub ws_max_reconnect_attempts: u32,

    // =========================================================================
    // BACKEND
    // =========================================================================

    /// REST base for /api/process-urls and friends.
    pub api_base_url: String,

    pub http_timeout: Duration,

    // =========================================================================
    // ARCHIVE SINK (REDIS)
    // =========================================================================
    pub redis_url: String,

    /// Pub/sub channel processed documents are announced on.
    pub redis_channel: String,

    /// Sorted set holding every archived document, scored by timestamp.
    pub redis_sorted_set: String,

    // =========================================================================
    // METRICS
    // =========================================================================

    /// Where the metric bundle is persisted between runs.
    pub metrics_path: PathBuf,

    /// How often subscribers get a fresh snapshot and the file is flushed.
    /// Never below one second.
    pub metrics_interval: Duration,

    /// Port for the JSON status board.
    pub status_port: u16,

    // =========================================================================
    // PROXIES
    // =========================================================================

    /// Raw `host:port[:type]` list, comma separated.
    pub proxy_list: String,

    /// Never below one second.
    pub proxy_check_interval: Duration,

    pub proxy_probe_timeout: Duration,

    /// Maximum probes in flight during a health sweep.
    pub proxy_check_concurrency: usize,

    /// Consecutive failures before a proxy's breaker trips.
    pub circuit_breaker_failure_threshold: u32,

    pub circuit_breaker_reset_timeout: Duration,

    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // QUEUE
    // =========================================================================

    /// Idle sleep between queue polls.
    pub queue_poll_interval: Duration,

    /// Attempts per item before it is parked in `error`.
    pub queue_max_attempts: u32,

    /// URLs enqueued at startup, comma separated.
    pub seed_urls: String,

    // URL dedup (Bloom filter + LRU)
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    pub bloom_rotation_interval: Duration,
    pub lru_cache_size: usize,

    // =========================================================================
    // CLASSIFIER
    // =========================================================================

    /// Texts per batch chunk.
    pub batch_chunk_size: usize,

    /// Pause between chunks. The only intentional throttle in the engine.
    pub batch_delay: Duration,

    // =========================================================================
    // PLUMBING
    // =========================================================================

    /// Capacity of the document channel and of each event bus channel.
    pub channel_capacity: usize,

    /// Emit logs as JSON lines instead of the human formatter.
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            ws_url: env_or_default("LEGAL_ARCHIVE_WS_URL", "ws://127.0.0.1:8000/ws"),
            ws_client_name: env_or_default("LEGAL_ARCHIVE_WS_CLIENT_NAME", "legal-archive-engine"),
            ws_reconnect_base: Duration::from_millis(
                env_or_default("LEGAL_ARCHIVE_WS_RECONNECT_BASE_MS", "1000").parse().unwrap_or(1000)
            ),
            ws_reconnect_max: Duration::from_millis(
                env_or_default("LEGAL_ARCHIVE_WS_RECONNECT_MAX_MS", "30000").parse().unwrap_or(30_000)
            ),
            ws_max_reconnect_attempts: env_or_default("LEGAL_ARCHIVE_WS_MAX_RECONNECTS", "5")
                .parse().unwrap_or(5),

            api_base_url: env_or_default("LEGAL_ARCHIVE_API_BASE_URL", "http://127.0.0.1:8000"),
            http_timeout: Duration::from_secs(
                env_or_default("LEGAL_ARCHIVE_HTTP_TIMEOUT_SECS", "30").parse().unwrap_or(30)
            ),

            redis_url: env_or_default("LEGAL_ARCHIVE_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_channel: env_or_default("LEGAL_ARCHIVE_REDIS_CHANNEL", "legal_archive:documents"),
            redis_sorted_set: env_or_default(
                "LEGAL_ARCHIVE_REDIS_SORTED_SET",
                "legal_archive:documents:history",
            ),

            metrics_path: PathBuf::from(env_or_default(
                "LEGAL_ARCHIVE_METRICS_PATH",
                "legal_archive_metrics.json",
            )),
            metrics_interval: Duration::from_secs(
                env_or_default("LEGAL_ARCHIVE_METRICS_INTERVAL_SECS", "5").parse::<u64>().unwrap_or(5).max(1)
            ),
            status_port: env_or_default("LEGAL_ARCHIVE_STATUS_PORT", "9090")
                .parse().unwrap_or(9090),

            proxy_list: env_or_default("LEGAL_ARCHIVE_PROXIES", ""),
            proxy_check_interval: Duration::from_secs(
                env_or_default("LEGAL_ARCHIVE_PROXY_CHECK_SECS", "120").parse::<u64>().unwrap_or(120).max(1)
            ),
            proxy_probe_timeout: Duration::from_millis(
                env_or_default("LEGAL_ARCHIVE_PROXY_TIMEOUT_MS", "5000").parse().unwrap_or(5000)
            ),
            proxy_check_concurrency: env_or_default("LEGAL_ARCHIVE_PROXY_CHECK_CONCURRENCY", "8")
                .parse().unwrap_or(8),
            circuit_breaker_failure_threshold: env_or_default(
                "LEGAL_ARCHIVE_CB_FAILURE_THRESHOLD", "3"
            ).parse().unwrap_or(3),
            circuit_breaker_reset_timeout: Duration::from_secs(
                env_or_default("LEGAL_ARCHIVE_CB_RESET_TIMEOUT_SECS", "60").parse().unwrap_or(60)
            ),
            circuit_breaker_success_threshold: env_or_default(
                "LEGAL_ARCHIVE_CB_SUCCESS_THRESHOLD", "1"
            ).parse().unwrap_or(1),

            queue_poll_interval: Duration::from_millis(
                env_or_default("LEGAL_ARCHIVE_QUEUE_POLL_MS", "500").parse().unwrap_or(500)
            ),
            queue_max_attempts: env_or_default("LEGAL_ARCHIVE_QUEUE_MAX_ATTEMPTS", "3")
                .parse().unwrap_or(3),
            seed_urls: env_or_default("LEGAL_ARCHIVE_SEED_URLS", ""),
            bloom_expected_items: env_or_default("LEGAL_ARCHIVE_BLOOM_ITEMS", "100000")
                .parse().unwrap_or(100_000),
            bloom_false_positive_rate: env_or_default("LEGAL_ARCHIVE_BLOOM_FP_RATE", "0.01")
                .parse().unwrap_or(0.01),
            bloom_rotation_interval: Duration::from_secs(
                env_or_default("LEGAL_ARCHIVE_BLOOM_ROTATION_SECS", "86400").parse().unwrap_or(86_400)
            ),
            lru_cache_size: env_or_default("LEGAL_ARCHIVE_LRU_CACHE_SIZE", "10000")
                .parse().unwrap_or(10_000),

            batch_chunk_size: env_or_default("LEGAL_ARCHIVE_BATCH_CHUNK_SIZE", "10")
                .parse().unwrap_or(10),
            batch_delay: Duration::from_millis(
                env_or_default("LEGAL_ARCHIVE_BATCH_DELAY_MS", "100").parse().unwrap_or(100)
            ),

            channel_capacity: env_or_default("LEGAL_ARCHIVE_CHANNEL_CAPACITY", "10000")
                .parse().unwrap_or(10_000),
            log_json: env_or_default("LEGAL_ARCHIVE_LOG_JSON", "false")
                .parse().unwrap_or(false),
        }
    }

    /// Seed URLs split out of the comma-separated env value.
    pub fn seed_url_list(&self) -> Vec<String> {
        split_list(&self.seed_urls)
    }

    /// Proxy specs split out of the comma-separated env value.
    pub fn proxy_specs(&self) -> Vec<String> {
        split_list(&self.proxy_list)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_ignores_blanks() {
        assert_eq!(
            split_list(" https://a.ir , ,https://b.ir,"),
            vec!["https://a.ir".to_string(), "https://b.ir".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}

#[cfg(test)]
mod tests_clamping {
    use super::*;

    #[test]
    fn test_zero_intervals_are_clamped() {
        env::set_var("LEGAL_ARCHIVE_METRICS_INTERVAL_SECS", "0");
        env::set_var("LEGAL_ARCHIVE_PROXY_CHECK_SECS", "0");
        let config = Config::from_env();
        assert_eq!(config.metrics_interval, Duration::from_secs(1));
        assert_eq!(config.proxy_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_split_list_skips_blanks() {
        assert_eq!(split_list(" a.ir:80 , ,b.ir:81,"), vec!["a.ir:80", "b.ir:81"]);
    }
}
