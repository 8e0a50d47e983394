// =============================================================================
// backend.rs — THE REST BACKEND AS A DOCUMENT PROCESSOR
// =============================================================================
//
// The backend does the actual fetching and extraction behind
// `POST /api/process-urls`. We send one URL per call, optionally with a
// proxy hint from the pool, and turn the answer into a DocumentRecord.
//
// Two kinds of failure, kept apart:
//   - transport (connect refused, timeout, 5xx): ArchiveError::Http, retried
//     by the queue and counted against the proxy's breaker.
//   - logical (`success: false`, 4xx, nothing extracted, a 2xx body that
//     isn't the expected JSON): ArchiveError::Backend,
//     never retried. The proxy did its job, so its breaker sees a success.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};
use crate::models::{DocumentRecord, ProxyType, QueueItem};
use crate::proxy_pool::ProxyPool;
use crate::queue::{DocumentProcessor, ProcessOptions};

#[derive(Debug, Serialize)]
struct ProcessUrlsRequest<'a> {
    urls: [&'a str; 1],
    use_proxy: bool,
    proxy: Option<ProxyHint<'a>>,
}

#[derive(Debug, Serialize)]
struct ProxyHint<'a> {
    id: &'a str,
    host: &'a str,
    port: u16,
    #[serde(rename = "type")]
    proxy_type: ProxyType,
}

#[derive(Debug, Deserialize)]
struct ProcessUrlsResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default, alias = "results", alias = "data")]
    documents: Vec<RemoteDocument>,
}

#[derive(Debug, Deserialize)]
struct RemoteDocument {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "text", alias = "body")]
    content: Option<String>,
    #[serde(default, alias = "source_url")]
    url: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: String,
    pool: Arc<ProxyPool>,
}

impl HttpProcessor {
    pub fn new(api_base: &str, timeout: Duration, pool: Arc<ProxyPool>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("LegalArchiveEngine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/process-urls", api_base.trim_end_matches('/')),
            pool,
        })
    }

    async fn call(&self, body: &ProcessUrlsRequest<'_>) -> Result<ProcessUrlsResponse> {
        let response = self.client.post(&self.endpoint).json(body).send().await?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(ArchiveError::Backend(format!("HTTP {}: {}", status, text.trim())));
        }
        let response = response.error_for_status()?;
        // An unreadable 2xx body means nothing was extracted, not a dead link
        response.json::<ProcessUrlsResponse>().await.map_err(|e| {
            if e.is_decode() {
                ArchiveError::Backend(format!("unreadable response: {}", e))
            } else {
                ArchiveError::Http(e)
            }
        })
    }
}

fn into_document(item: &QueueItem, reply: ProcessUrlsResponse, proxy_id: Option<String>) -> Result<DocumentRecord> {
    if !reply.success {
        return Err(ArchiveError::Backend(
            reply.message.unwrap_or_else(|| "processing failed".to_string()),
        ));
    }

    let remote = reply
        .documents
        .into_iter()
        .next()
        .ok_or_else(|| ArchiveError::Backend("response carried no document".to_string()))?;

    let mut document = DocumentRecord::new(
        remote.title.unwrap_or_else(|| item.title.clone()),
        remote.url.unwrap_or_else(|| item.url.clone()),
        remote.content.unwrap_or_default(),
    );
    document.category = remote.category.unwrap_or_default();
    document.proxy_id = proxy_id;
    Ok(document)
}

#[async_trait]
impl DocumentProcessor for HttpProcessor {
    async fn process(&self, item: &QueueItem, options: &ProcessOptions) -> Result<DocumentRecord> {
        let proxy = if options.use_proxy { self.pool.rotate() } else { None };
        if options.use_proxy && proxy.is_none() {
            debug!(url = %item.url, "No healthy proxy available, going direct");
        }

        let body = ProcessUrlsRequest {
            urls: [item.url.as_str()],
            use_proxy: proxy.is_some(),
            proxy: proxy.as_ref().map(|p| ProxyHint {
                id: &p.id,
                host: &p.host,
                port: p.port,
                proxy_type: p.proxy_type,
            }),
        };

        let result = self.call(&body).await;

        if let Some(p) = &proxy {
            let transport_failure = matches!(&result, Err(e) if e.is_transient());
            self.pool.record_outcome(&p.id, !transport_failure);
            if transport_failure {
                warn!(proxy = %p.id, url = %item.url, "Request through proxy failed");
            }
        }

        into_document(item, result?, proxy.map(|p| p.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, ProxyRecord, ProxyStatus};
    use crate::proxy_pool::BreakerSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Answer one HTTP request with `status` and `body`; hand back the
    /// request body that was received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let request_body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break String::from_utf8_lossy(&buf[end + 4..end + 4 + length]).to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(request_body);
        });

        (base, rx)
    }

    fn item() -> QueueItem {
        QueueItem::new("https://example.ir/law/1", "example.ir", Priority::Normal)
    }

    fn pool_with_active_proxy() -> Arc<ProxyPool> {
        let mut proxy = ProxyRecord::new("10.0.0.5", 3128, ProxyType::Http);
        proxy.status = ProxyStatus::Active;
        Arc::new(ProxyPool::new(vec![proxy], BreakerSettings::default()))
    }

    #[tokio::test]
    async fn test_success_becomes_document_with_proxy_hint() {
        let (base, request) = serve_once(
            "200 OK",
            r#"{"success":true,"documents":[{"title":"قانون مدنی","content":"ماده 1","category":"laws"}]}"#,
        )
        .await;
        let processor = HttpProcessor::new(&base, Duration::from_secs(5), pool_with_active_proxy()).unwrap();

        let doc = processor.process(&item(), &ProcessOptions { use_proxy: true }).await.unwrap();
        assert_eq!(doc.title, "قانون مدنی");
        assert_eq!(doc.url, "https://example.ir/law/1");
        assert_eq!(doc.category, "laws");
        assert_eq!(doc.proxy_id.as_deref(), Some("10.0.0.5:3128"));

        let sent: serde_json::Value = serde_json::from_str(&request.await.unwrap()).unwrap();
        assert_eq!(sent["urls"][0], "https://example.ir/law/1");
        assert_eq!(sent["use_proxy"], true);
        assert_eq!(sent["proxy"]["port"], 3128);
    }

    #[tokio::test]
    async fn test_success_false_is_a_logical_failure() {
        let (base, _request) = serve_once("200 OK", r#"{"success":false,"message":"blocked"}"#).await;
        let processor = HttpProcessor::new(&base, Duration::from_secs(5), pool_with_active_proxy()).unwrap();

        let err = processor.process(&item(), &ProcessOptions { use_proxy: false }).await.unwrap_err();
        assert!(matches!(&err, ArchiveError::Backend(m) if m == "blocked"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_logical_server_error_is_transient() {
        let (base, _r) = serve_once("404 Not Found", r#"{"detail":"no route"}"#).await;
        let processor = HttpProcessor::new(&base, Duration::from_secs(5), pool_with_active_proxy()).unwrap();
        let err = processor.process(&item(), &ProcessOptions { use_proxy: false }).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Backend(_)));

        let (base, _r) = serve_once("503 Service Unavailable", "{}").await;
        let processor = HttpProcessor::new(&base, Duration::from_secs(5), pool_with_active_proxy()).unwrap();
        let err = processor.process(&item(), &ProcessOptions { use_proxy: false }).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_success_body_is_logical_and_spares_the_proxy() {
        let pool = pool_with_active_proxy();
        for _ in 0..3 {
            let (base, _r) = serve_once("200 OK", "<html>gateway page</html>").await;
            let processor = HttpProcessor::new(&base, Duration::from_secs(5), pool.clone()).unwrap();
            let err = processor.process(&item(), &ProcessOptions { use_proxy: true }).await.unwrap_err();
            assert!(matches!(err, ArchiveError::Backend(_)));
            assert!(!err.is_transient());
        }
        assert!(pool.rotate().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_backend_trips_the_proxy_breaker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let pool = pool_with_active_proxy();
        let processor = HttpProcessor::new(&base, Duration::from_secs(2), pool.clone()).unwrap();
        for _ in 0..3 {
            let err = processor.process(&item(), &ProcessOptions { use_proxy: true }).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(pool.rotate().is_none());
    }
}
