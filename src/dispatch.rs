// =============================================================================
// dispatch.rs — SERVER PUSHES INTO LOCAL STATE
// =============================================================================
//
// Sits on the event bus firehose and applies what the backend tells us:
//
//   metrics_update       -> gauge merge into the metrics store
//   proxy_status_update  -> upsert into the proxy pool
//   document_processed   -> scraping counters
//   model_loaded         -> AI counters
//   system_health        -> system gauges
//   scraping_progress    -> log only
//   error                -> log + error counter
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::metrics::{MetricsStore, ScrapingUpdate};
use crate::models::ServerMessage;
use crate::proxy_pool::ProxyPool;

pub struct Dispatcher {
    metrics: Arc<MetricsStore>,
    pool: Arc<ProxyPool>,
    applied: portable_atomic::AtomicU64,
}

impl Dispatcher {
    pub fn new(metrics: Arc<MetricsStore>, pool: Arc<ProxyPool>) -> Self {
        Self {
            metrics,
            pool,
            applied: portable_atomic::AtomicU64::new(0),
        }
    }

    pub fn apply(&self, message: ServerMessage) {
        self.applied.fetch_add(1, portable_atomic::Ordering::Relaxed);

        match message {
            ServerMessage::MetricsUpdate { data } | ServerMessage::SystemHealth { data } => {
                self.metrics.apply_remote(&data);
            }
            ServerMessage::ProxyStatusUpdate { proxies } => {
                let applied = self.pool.apply_remote(proxies);
                self.metrics.set_active_proxies(self.pool.active_count() as u32);
                debug!(applied, "Proxy status pushed by backend");
            }
            ServerMessage::DocumentProcessed { data } => {
                // Out-of-range values (negative, NaN, beyond Duration) count as 0ms
                let processing_time = data
                    .processing_time_ms
                    .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
                    .unwrap_or(Duration::ZERO);
                self.metrics.update_scraping_metrics(ScrapingUpdate {
                    success: data.success,
                    processing_time,
                    proxy_count: None,
                });
            }
            ServerMessage::ModelLoaded { model } => {
                info!(model = model.as_deref().unwrap_or("unknown"), "Backend loaded a model");
                self.metrics.record_model_loaded();
            }
            ServerMessage::ScrapingProgress { data } => {
                info!(
                    processed = data.processed,
                    total = data.total,
                    current_url = data.current_url.as_deref().unwrap_or("-"),
                    "Backend scraping progress"
                );
            }
            ServerMessage::Error { message } => {
                warn!(message = %message, "Backend reported an error");
                self.metrics.record_error();
            }
        }
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(portable_atomic::Ordering::Relaxed)
    }

    pub async fn run(&self, mut events: broadcast::Receiver<ServerMessage>, shutdown: &mut watch::Receiver<bool>) {
        info!("Dispatcher online");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(message) => self.apply(message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Dispatcher fell behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, dispatcher exiting");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!(applied = self.applied_count(), "Dispatcher: shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::models::{DocumentEvent, ProxyRecord, ProxyStatus, ProxyType, RemoteGauges};
    use crate::proxy_pool::BreakerSettings;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(MetricsStore::in_memory()),
            Arc::new(ProxyPool::new(vec![], BreakerSettings::default())),
        )
    }

    #[test]
    fn test_metrics_update_merges_gauges() {
        let d = dispatcher();
        d.apply(ServerMessage::MetricsUpdate {
            data: RemoteGauges {
                cpu_usage: Some(42.0),
                total_records: Some(1200),
                ..RemoteGauges::default()
            },
        });
        let bundle = d.metrics.bundle();
        assert_eq!(bundle.system.cpu_usage, 42.0);
        assert_eq!(bundle.database.total_records, 1200);
    }

    #[test]
    fn test_proxy_update_reaches_pool_and_metrics() {
        let d = dispatcher();
        let mut proxy = ProxyRecord::new("10.0.0.9", 1080, ProxyType::Socks5);
        proxy.status = ProxyStatus::Active;
        d.apply(ServerMessage::ProxyStatusUpdate { proxies: vec![proxy] });

        assert_eq!(d.pool.len(), 1);
        assert_eq!(d.metrics.bundle().scraping.active_proxies, 1);
    }

    #[test]
    fn test_document_and_error_counters() {
        let d = dispatcher();
        d.apply(ServerMessage::DocumentProcessed {
            data: DocumentEvent {
                processing_time_ms: Some(250.0),
                ..DocumentEvent::default()
            },
        });
        d.apply(ServerMessage::DocumentProcessed {
            data: DocumentEvent {
                success: false,
                ..DocumentEvent::default()
            },
        });
        d.apply(ServerMessage::ModelLoaded { model: Some("parsbert".into()) });
        d.apply(ServerMessage::Error { message: "disk full".into() });

        let bundle = d.metrics.bundle();
        assert_eq!(bundle.scraping.total_documents, 1);
        assert_eq!(bundle.scraping.failed_attempts, 1);
        assert_eq!(bundle.scraping.success_rate, 50);
        assert_eq!(bundle.ai.models_loaded, 1);
        assert_eq!(bundle.system.error_count, 1);
        assert_eq!(d.applied_count(), 4);
    }

    #[test]
    fn test_absurd_processing_time_counts_as_zero() {
        let d = dispatcher();
        for raw in [
            r#"{"type":"document_processed","data":{"success":true,"processing_time":1e30}}"#,
            r#"{"type":"document_processed","data":{"success":true,"processing_time":-5}}"#,
        ] {
            let message = ServerMessage::parse(raw).unwrap().unwrap();
            d.apply(message);
        }

        let bundle = d.metrics.bundle();
        assert_eq!(bundle.scraping.total_documents, 2);
        assert_eq!(bundle.scraping.average_processing_time_ms, 0.0);
    }

    #[tokio::test]
    async fn test_run_consumes_bus_until_shutdown() {
        let bus = EventBus::new(16);
        let d = Arc::new(dispatcher());
        let (tx, mut shutdown) = watch::channel(false);

        let events = bus.subscribe_all();
        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.run(events, &mut shutdown).await })
        };

        bus.publish(ServerMessage::Error { message: "one".into() });
        bus.publish(ServerMessage::ModelLoaded { model: None });

        for _ in 0..100 {
            if d.applied_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(d.applied_count(), 2);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
