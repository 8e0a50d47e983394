// =============================================================================
// status_server.rs — THE JSON STATUS BOARD
// =============================================================================
//
// A tiny HTTP/1.1 server for dashboards to poll. One request
// per connection, JSON in and out, CORS open to everyone.
//
//   GET  /api/status        connection state, uptime, performance summary
//   GET  /api/metrics       latest metrics snapshot, dedup and archive stats
//   GET  /api/network       proxy pool summary and every proxy record
//   GET  /api/queue         queue counts and items
//   POST /api/process-urls  {"urls": [...], "priority": "high"} -> enqueue
//   POST /api/analyze       {"texts": [...]} -> classifier batch
//   POST /api/classify      {"text": "..."} -> category, entities, topics
//
// Operator controls:
//   POST /api/proxies/test               probe every proxy now
//   POST /api/proxies/{id}/test          probe one proxy
//   POST /api/proxies/{id}/deactivate    take one proxy out of rotation
//   POST /api/queue/{id}/cancel          cancel a pending or running item
//   POST /api/queue/clear                drop finished items
//
// Anything else is a 404 (or 405 for a known path with the wrong method).
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::archive_sink::SinkStats;
use crate::classifier;
use crate::dedup::DedupEngine;
use crate::error::ArchiveError;
use crate::event_bus::EventBus;
use crate::metrics::{AiUpdate, MetricsSnapshot, MetricsStore};
use crate::models::Priority;
use crate::proxy_pool::{ProxyPool, ProxyProber};
use crate::queue::DocumentQueue;
use crate::ws_client::WsClient;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for the endpoints that do work rather than report.
#[derive(Debug, Clone)]
pub struct BoardSettings {
    pub probe_concurrency: usize,
    pub batch_chunk_size: usize,
    pub batch_delay: Duration,
}

/// Everything the board reports on.
pub struct StatusBoard {
    pub ws: Arc<WsClient>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsStore>,
    pub pool: Arc<ProxyPool>,
    pub queue: Arc<DocumentQueue>,
    pub dedup: Arc<DedupEngine>,
    pub archive: Arc<SinkStats>,
    prober: Arc<dyn ProxyProber>,
    settings: BoardSettings,
    snapshots: watch::Receiver<MetricsSnapshot>,
    started: Instant,
}

#[derive(Debug, Deserialize)]
struct ProcessUrlsBody {
    urls: Vec<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    #[serde(default)]
    texts: Vec<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "success": false, "error": message.into() }),
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

impl StatusBoard {
    pub fn new(
        ws: Arc<WsClient>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsStore>,
        pool: Arc<ProxyPool>,
        queue: Arc<DocumentQueue>,
        dedup: Arc<DedupEngine>,
        archive: Arc<SinkStats>,
        prober: Arc<dyn ProxyProber>,
        settings: BoardSettings,
    ) -> Self {
        let snapshots = metrics.subscribe();
        Self {
            ws,
            bus,
            metrics,
            pool,
            queue,
            dedup,
            archive,
            prober,
            settings,
            snapshots,
            started: Instant::now(),
        }
    }

    /// Answer one request. Query strings are ignored.
    pub async fn route(&self, method: &str, target: &str, body: &[u8]) -> Response {
        let path = target.split('?').next().unwrap_or(target);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            ("OPTIONS", _) => Response { status: 204, body: Value::Null },
            ("GET", ["api", "status"]) => self.status(),
            ("GET", ["api", "metrics"]) => self.metrics(),
            ("GET", ["api", "network"]) => self.network(),
            ("GET", ["api", "queue"]) => self.queue(),
            ("POST", ["api", "process-urls"]) => self.process_urls(body),
            ("POST", ["api", "analyze"]) => self.analyze(body).await,
            ("POST", ["api", "classify"]) => self.classify(body),
            ("POST", ["api", "proxies", "test"]) => self.test_all_proxies().await,
            ("POST", ["api", "proxies", id, "test"]) => self.test_proxy(id).await,
            ("POST", ["api", "proxies", id, "deactivate"]) => self.deactivate_proxy(id),
            ("POST", ["api", "queue", "clear"]) => self.clear_queue(),
            ("POST", ["api", "queue", id, "cancel"]) => self.cancel_item(id),
            (_, ["api", "status" | "metrics" | "network" | "queue" | "process-urls" | "analyze" | "classify"]) => {
                Response::error(405, format!("{} not allowed on {}", method, path))
            }
            _ => Response::error(404, format!("no route for {}", path)),
        }
    }

    fn status(&self) -> Response {
        let pool = self.pool.snapshot();
        Response::ok(json!({
            "status": "ok",
            "uptime_secs": self.started.elapsed().as_secs(),
            "connection": self.ws.snapshot(),
            "summary": self.metrics.performance_summary(),
            "events_published": self.bus.published_count(),
            "active_proxies": pool.active,
            "queue": self.queue.stats(),
        }))
    }

    fn metrics(&self) -> Response {
        let snapshot = self.snapshots.borrow().clone();
        Response::ok(json!({
            "metrics": snapshot.metrics,
            "summary": snapshot.summary,
            "taken_at": snapshot.taken_at,
            "dedup": self.dedup.snapshot(),
            "archive": self.archive.snapshot(),
            "persist_failures": self.metrics.persist_failures(),
        }))
    }

    fn network(&self) -> Response {
        Response::ok(json!({
            "summary": self.pool.snapshot(),
            "proxies": self.pool.records(),
            "breakers": self.pool.breakers(),
        }))
    }

    fn queue(&self) -> Response {
        Response::ok(json!({
            "stats": self.queue.stats(),
            "next": self.queue.next_pending(),
            "items": self.queue.items(),
        }))
    }

    fn process_urls(&self, body: &[u8]) -> Response {
        let request: ProcessUrlsBody = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return Response::error(400, format!("invalid body: {}", e)),
        };
        if request.urls.is_empty() {
            return Response::error(400, "urls must not be empty");
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for url in &request.urls {
            match self.queue.enqueue(url, request.title.as_deref(), request.priority) {
                Ok(id) => accepted.push(json!({ "url": url, "id": id })),
                Err(e) => rejected.push(json!({ "url": url, "error": e.to_string() })),
            }
        }

        info!(accepted = accepted.len(), rejected = rejected.len(), "URLs submitted via status board");
        Response::ok(json!({
            "success": !accepted.is_empty(),
            "accepted": accepted,
            "rejected": rejected,
        }))
    }

    async fn analyze(&self, body: &[u8]) -> Response {
        let request: AnalyzeBody = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return Response::error(400, format!("invalid body: {}", e)),
        };
        let mut texts = request.texts;
        texts.extend(request.text);
        if texts.is_empty() {
            return Response::error(400, "texts must not be empty");
        }

        let started = Instant::now();
        let results =
            classifier::batch_analyze(&texts, self.settings.batch_chunk_size, self.settings.batch_delay).await;
        let elapsed = started.elapsed();

        let per_text = elapsed / results.len().max(1) as u32;
        for analysis in &results {
            self.metrics.update_ai_metrics(AiUpdate {
                confidence: analysis.confidence,
                processing_time: per_text,
            });
        }

        Response::ok(json!({
            "success": true,
            "count": results.len(),
            "elapsed_ms": elapsed.as_millis() as u64,
            "results": results,
        }))
    }

    fn classify(&self, body: &[u8]) -> Response {
        let text = match serde_json::from_slice::<AnalyzeBody>(body) {
            Ok(AnalyzeBody { text: Some(text), .. }) => text,
            Ok(_) => return Response::error(400, "text is required"),
            Err(e) => return Response::error(400, format!("invalid body: {}", e)),
        };

        let (category, confidence, scores) = classifier::classify(&text);
        Response::ok(json!({
            "success": true,
            "category": category,
            "label": category.persian_label(),
            "confidence": confidence,
            "scores": scores,
            "entities": classifier::extract_entities(&text),
            "topics": classifier::tag_topics(&text),
        }))
    }

    async fn test_all_proxies(&self) -> Response {
        let tested = self.pool.test_all(self.prober.as_ref(), self.settings.probe_concurrency).await;
        self.metrics.set_active_proxies(self.pool.active_count() as u32);
        info!(tested = tested.len(), "Proxy sweep requested via status board");
        Response::ok(json!({
            "success": true,
            "summary": self.pool.snapshot(),
            "proxies": tested,
        }))
    }

    async fn test_proxy(&self, id: &str) -> Response {
        match self.pool.test_proxy(id, self.prober.as_ref()).await {
            Ok(record) => {
                self.metrics.set_active_proxies(self.pool.active_count() as u32);
                Response::ok(json!({ "success": true, "proxy": record }))
            }
            Err(e) => error_response(e),
        }
    }

    fn deactivate_proxy(&self, id: &str) -> Response {
        match self.pool.deactivate(id) {
            Ok(()) => {
                self.metrics.set_active_proxies(self.pool.active_count() as u32);
                info!(proxy = %id, "Proxy deactivated via status board");
                Response::ok(json!({ "success": true, "proxy": self.pool.get(id) }))
            }
            Err(e) => error_response(e),
        }
    }

    fn cancel_item(&self, id: &str) -> Response {
        match self.queue.cancel(id) {
            Ok(status) => Response::ok(json!({ "success": true, "id": id, "status": status })),
            Err(e) => error_response(e),
        }
    }

    fn clear_queue(&self) -> Response {
        let removed = self.queue.clear_finished();
        Response::ok(json!({ "success": true, "removed": removed }))
    }
}

fn error_response(e: ArchiveError) -> Response {
    let status = match e {
        ArchiveError::UnknownProxy(_) | ArchiveError::ItemNotFound(_) => 404,
        ArchiveError::ProxyBusy(_) => 409,
        _ => 500,
    };
    Response::error(status, e.to_string())
}

/// Method, request target, and the byte offset where the body starts.
fn parse_head(buf: &[u8]) -> Option<(String, String, usize, usize)> {
    let end = memchr::memmem::find(buf, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..end]).ok()?;
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_ascii_uppercase();
    let target = request_line.next()?.to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    Some((method, target, end + 4, content_length))
}

async fn read_request(stream: &mut TcpStream) -> Result<(String, String, Vec<u8>), Response> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Response::error(400, e.to_string()))?;
        if n == 0 {
            return Err(Response::error(400, "connection closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((method, target, body_start, length)) = parse_head(&buf) {
            if length > MAX_BODY_BYTES {
                return Err(Response::error(413, "body too large"));
            }
            if buf.len() >= body_start + length {
                let body = buf[body_start..body_start + length].to_vec();
                return Ok((method, target, body));
            }
        } else if buf.len() > MAX_HEADER_BYTES {
            return Err(Response::error(400, "headers too large"));
        }
    }
}

async fn write_response(stream: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let body = if response.status == 204 {
        String::new()
    } else {
        serde_json::to_string_pretty(&response.body).unwrap_or_else(|_| "{}".to_string())
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\n\
         Access-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await
}

async fn handle_connection(board: Arc<StatusBoard>, mut stream: TcpStream) {
    let response = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok((method, target, body))) => {
            debug!(method = %method, target = %target, "Status request");
            board.route(&method, &target, &body).await
        }
        Ok(Err(response)) => response,
        Err(_) => Response::error(400, "request timed out"),
    };

    if let Err(e) = write_response(&mut stream, &response).await {
        debug!(error = %e, "Status client went away before the response");
    }
}

/// Serve on an already-bound listener until shutdown.
pub async fn serve(listener: TcpListener, board: Arc<StatusBoard>, shutdown: &mut watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tokio::spawn(handle_connection(Arc::clone(&board), stream));
                }
                Err(e) => warn!(error = %e, "Status board accept error"),
            },
            _ = shutdown.changed() => {
                info!("Status board: shutting down");
                break;
            }
        }
    }
}

pub async fn run(port: u16, board: Arc<StatusBoard>, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "Failed to bind status board");
            return Err(e.into());
        }
    };
    info!(port, "Status board listening on http://0.0.0.0:{}/api/status", port);
    serve(listener, board, shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::{ProxyRecord, ProxyStatus, ProxyType, QueueStatus};
    use crate::proxy_pool::BreakerSettings;
    use crate::ws_client::ReconnectPolicy;
    use async_trait::async_trait;

    struct InstantProber;

    #[async_trait]
    impl ProxyProber for InstantProber {
        async fn probe(&self, _proxy: &ProxyRecord) -> Result<Duration> {
            Ok(Duration::from_millis(12))
        }
    }

    fn board() -> StatusBoard {
        let bus = Arc::new(EventBus::new(8));
        let dedup = Arc::new(DedupEngine::new(1000, 0.01, 100, Duration::from_secs(3600)));
        StatusBoard::new(
            Arc::new(WsClient::new("ws://127.0.0.1:1/ws", "test", ReconnectPolicy::default(), bus.clone())),
            bus,
            Arc::new(MetricsStore::in_memory()),
            Arc::new(ProxyPool::new(
                vec![ProxyRecord::new("10.0.0.1", 8080, ProxyType::Http)],
                BreakerSettings::default(),
            )),
            Arc::new(DocumentQueue::new(dedup.clone(), 3)),
            dedup,
            Arc::new(SinkStats::new()),
            Arc::new(InstantProber),
            BoardSettings {
                probe_concurrency: 4,
                batch_chunk_size: 2,
                batch_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_parse_head() {
        let raw = b"POST /api/process-urls HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n{\"urls\":[]}";
        let (method, target, start, len) = parse_head(raw).unwrap();
        assert_eq!(method, "POST");
        assert_eq!(target, "/api/process-urls");
        assert_eq!(len, 12);
        assert_eq!(&raw[start..start + 2], b"{\"");
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n").is_none());
    }

    #[tokio::test]
    async fn test_get_routes() {
        let board = board();
        let status = board.route("GET", "/api/status", b"").await;
        assert_eq!(status.status, 200);
        assert_eq!(status.body["connection"]["state"]["state"], "disconnected");

        let network = board.route("GET", "/api/network?fresh=1", b"").await;
        assert_eq!(network.body["summary"]["total"], 1);
        assert_eq!(network.body["proxies"][0]["id"], "10.0.0.1:8080");

        let metrics = board.route("GET", "/api/metrics", b"").await;
        assert_eq!(metrics.body["metrics"]["scraping"]["success_rate"], 0);
        assert!(metrics.body["dedup"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_and_wrong_method() {
        let board = board();
        assert_eq!(board.route("GET", "/api/search", b"").await.status, 404);
        assert_eq!(board.route("DELETE", "/api/queue", b"").await.status, 405);
        assert_eq!(board.route("OPTIONS", "/api/queue", b"").await.status, 204);
    }

    #[tokio::test]
    async fn test_process_urls_enqueues_and_reports_rejections() {
        let board = board();
        let body = br#"{"urls":["https://example.ir/a","https://example.ir/a","nope"],"priority":"urgent"}"#;
        let response = board.route("POST", "/api/process-urls", body).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body["success"], true);
        assert_eq!(response.body["accepted"].as_array().unwrap().len(), 1);
        assert_eq!(response.body["rejected"].as_array().unwrap().len(), 2);

        let items = board.queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, Priority::Urgent);

        assert_eq!(board.route("POST", "/api/process-urls", b"{oops").await.status, 400);
        assert_eq!(board.route("POST", "/api/process-urls", br#"{"urls":[]}"#).await.status, 400);
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut shutdown) = watch::channel(false);
        let server = tokio::spawn(async move { serve(listener, Arc::new(board()), &mut shutdown).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /api/queue HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Access-Control-Allow-Origin: *"));
        let body = &raw[raw.find("\r\n\r\n").unwrap() + 4..];
        let json: Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["stats"]["total"], 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_analyze_runs_the_classifier_batch() {
        let board = board();
        let body = serde_json::to_vec(&json!({
            "texts": [
                "دادخواست طلاق و حضانت فرزند در دادگاه خانواده مطرح شد",
                "متن بی ربط",
                "به استناد ماده 10 قانون مدنی",
            ]
        }))
        .unwrap();

        let response = board.route("POST", "/api/analyze", &body).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["count"], 3);
        assert_eq!(response.body["results"][0]["category"], "family");
        assert_eq!(board.metrics.bundle().ai.total_analyzed, 3);

        let empty = board.route("POST", "/api/analyze", br#"{"texts":[]}"#).await;
        assert_eq!(empty.status, 400);
    }

    #[tokio::test]
    async fn test_classify_single_text() {
        let board = board();
        let body = serde_json::to_vec(&json!({ "text": "متهم به سرقت و کلاهبرداری طبق ماده 1 محکوم شد" })).unwrap();

        let response = board.route("POST", "/api/classify", &body).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["category"], "criminal");
        assert_eq!(response.body["entities"]["articles"][0], "ماده 1");

        assert_eq!(board.route("POST", "/api/classify", b"{}").await.status, 400);
    }

    #[tokio::test]
    async fn test_proxy_controls() {
        let board = board();
        let id = "10.0.0.1:8080";

        let tested = board.route("POST", &format!("/api/proxies/{}/test", id), b"").await;
        assert_eq!(tested.status, 200);
        assert_eq!(tested.body["proxy"]["status"], "active");
        assert_eq!(board.metrics.bundle().scraping.active_proxies, 1);

        let off = board.route("POST", &format!("/api/proxies/{}/deactivate", id), b"").await;
        assert_eq!(off.status, 200);
        assert_eq!(board.pool.get(id).unwrap().status, ProxyStatus::Inactive);

        let sweep = board.route("POST", "/api/proxies/test", b"").await;
        assert_eq!(sweep.body["summary"]["active"], 1);

        let missing = board.route("POST", "/api/proxies/1.2.3.4:1/deactivate", b"").await;
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_queue_controls() {
        let board = board();
        let id = board.queue.enqueue("https://example.ir/x", None, Priority::Normal).unwrap();

        let cancelled = board.route("POST", &format!("/api/queue/{}/cancel", id), b"").await;
        assert_eq!(cancelled.status, 200);
        assert_eq!(board.queue.get(&id).unwrap().status, QueueStatus::Cancelled);

        let cleared = board.route("POST", "/api/queue/clear", b"").await;
        assert_eq!(cleared.body["removed"], 1);
        assert_eq!(board.route("POST", "/api/queue/nope/cancel", b"").await.status, 404);
    }
}
