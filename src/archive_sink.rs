// =============================================================================
// archive_sink.rs — CLASSIFIED DOCUMENTS INTO REDIS
// =============================================================================
//
// Takes DocumentRecords off the crossbeam channel the queue feeds, and for
// each one:
//   1. PUBLISHes the JSON on a pub/sub channel for anything live-listening
//   2. ZADDs the same JSON to a sorted set scored by document timestamp, so
//      consumers that were down can catch up
//
// Both commands for a whole batch go out in one pipeline. Whatever is still
// in the channel at shutdown is flushed before the task exits.
// =============================================================================

use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ArchiveError;
use crate::metrics::{DatabaseUpdate, MetricsStore};
use crate::models::DocumentRecord;

const BATCH_SIZE: usize = 50;

pub struct ArchiveSink {
    config: Arc<Config>,
    receiver: Receiver<DocumentRecord>,
    metrics: Arc<MetricsStore>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<SinkStats>,
}

pub struct SinkStats {
    pub documents_published: portable_atomic::AtomicU64,
    pub documents_archived: portable_atomic::AtomicU64,
    pub write_errors: portable_atomic::AtomicU64,
    pub batches_sent: portable_atomic::AtomicU64,
    pub bytes_written: portable_atomic::AtomicU64,
}

impl SinkStats {
    pub fn new() -> Self {
        Self {
            documents_published: portable_atomic::AtomicU64::new(0),
            documents_archived: portable_atomic::AtomicU64::new(0),
            write_errors: portable_atomic::AtomicU64::new(0),
            batches_sent: portable_atomic::AtomicU64::new(0),
            bytes_written: portable_atomic::AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        use portable_atomic::Ordering;
        SinkSnapshot {
            documents_published: self.documents_published.load(Ordering::Relaxed),
            documents_archived: self.documents_archived.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Default for SinkStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SinkSnapshot {
    pub documents_published: u64,
    pub documents_archived: u64,
    pub write_errors: u64,
    pub batches_sent: u64,
    pub bytes_written: u64,
}

/// Sorted-set score: the document timestamp in fractional seconds.
pub fn archive_score(document: &DocumentRecord) -> f64 {
    document.timestamp.timestamp_millis() as f64 / 1000.0
}

/// Pull up to `max` documents without blocking. `Err` once the channel is
/// disconnected and empty.
pub fn drain_batch(receiver: &Receiver<DocumentRecord>, max: usize, batch: &mut Vec<DocumentRecord>) -> std::result::Result<(), TryRecvError> {
    while batch.len() < max {
        match receiver.try_recv() {
            Ok(doc) => batch.push(doc),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) if batch.is_empty() => return Err(TryRecvError::Disconnected),
            Err(TryRecvError::Disconnected) => break,
        }
    }
    Ok(())
}

impl ArchiveSink {
    pub fn new(
        config: Arc<Config>,
        receiver: Receiver<DocumentRecord>,
        metrics: Arc<MetricsStore>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Arc<SinkStats>) {
        let stats = Arc::new(SinkStats::new());
        (
            Self {
                config,
                receiver,
                metrics,
                shutdown,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    pub async fn run(self) -> Result<()> {
        info!(
            channel = %self.config.redis_channel,
            sorted_set = %self.config.redis_sorted_set,
            "Archive sink starting"
        );

        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut con = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(con) => {
                    info!("Redis connection established");
                    break con;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis, retrying in 5 seconds");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if *self.shutdown.borrow() {
                        let stranded = self.receiver.len();
                        if stranded > 0 {
                            error!(stranded, "Shutdown before Redis came up, documents not archived");
                        }
                        return Ok(());
                    }
                }
            }
        };

        let mut batch: Vec<DocumentRecord> = Vec::with_capacity(BATCH_SIZE);

        loop {
            if *self.shutdown.borrow() {
                info!("Shutdown signal received, flushing archive channel");
                loop {
                    batch.clear();
                    if drain_batch(&self.receiver, BATCH_SIZE, &mut batch).is_err() || batch.is_empty() {
                        break;
                    }
                    self.write_batch(&mut con, &batch).await;
                }
                info!(stats = ?self.stats.snapshot(), "Archive sink shutting down");
                return Ok(());
            }

            batch.clear();
            if drain_batch(&self.receiver, BATCH_SIZE, &mut batch).is_err() {
                info!("Archive channel disconnected, sink shutting down");
                return Ok(());
            }

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            self.write_batch(&mut con, &batch).await;
        }
    }

    async fn write_batch(&self, con: &mut redis::aio::MultiplexedConnection, batch: &[DocumentRecord]) {
        use portable_atomic::Ordering;

        let started = Instant::now();
        let mut pipe = redis::pipe();
        let mut bytes = 0u64;
        let mut encoded = 0u64;

        for document in batch {
            let json = match serde_json::to_string(document) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, id = %document.id, "Failed to encode document");
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            bytes += json.len() as u64;
            encoded += 1;
            pipe.publish(&self.config.redis_channel, &json).ignore();
            pipe.zadd(&self.config.redis_sorted_set, &json, archive_score(document)).ignore();
        }
        if encoded == 0 {
            return;
        }

        match send_pipeline(con, &pipe).await {
            Ok(()) => {
                self.stats.documents_published.fetch_add(encoded, Ordering::Relaxed);
                self.stats.documents_archived.fetch_add(encoded, Ordering::Relaxed);
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                let total_bytes = self.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed) + bytes;

                self.metrics.update_database_metrics(DatabaseUpdate {
                    records_added: encoded,
                    query_time: started.elapsed(),
                    storage_bytes: Some(total_bytes),
                });
                debug!(
                    batch_size = encoded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch archived"
                );
            }
            Err(e) => {
                error!(error = %e, batch_size = encoded, "Failed to archive batch, documents lost");
                self.stats.write_errors.fetch_add(encoded, Ordering::Relaxed);
                self.metrics.record_error();
            }
        }
    }
}

async fn send_pipeline(con: &mut redis::aio::MultiplexedConnection, pipe: &redis::Pipeline) -> crate::error::Result<()> {
    let _: () = pipe.query_async(con).await.map_err(ArchiveError::Redis)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_score_is_timestamp_seconds() {
        let mut doc = DocumentRecord::new("t", "https://example.ir", "");
        doc.timestamp = chrono::Utc.timestamp_millis_opt(1_700_000_000_500).unwrap();
        assert_eq!(archive_score(&doc), 1_700_000_000.5);
    }

    #[test]
    fn test_drain_batch_respects_max() {
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..5 {
            tx.send(DocumentRecord::new(format!("doc {}", i), "https://example.ir", "")).unwrap();
        }

        let mut batch = Vec::new();
        drain_batch(&rx, 3, &mut batch).unwrap();
        assert_eq!(batch.len(), 3);

        batch.clear();
        drain_batch(&rx, 3, &mut batch).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].title, "doc 4");
    }

    #[test]
    fn test_drain_batch_reports_disconnect_only_when_empty() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(DocumentRecord::new("last", "https://example.ir", "")).unwrap();
        drop(tx);

        let mut batch = Vec::new();
        assert!(drain_batch(&rx, 10, &mut batch).is_ok());
        assert_eq!(batch.len(), 1);

        batch.clear();
        assert!(drain_batch(&rx, 10, &mut batch).is_err());
    }

    #[test]
    fn test_stats_snapshot_starts_at_zero() {
        let snap = SinkStats::new().snapshot();
        assert_eq!(snap.documents_archived, 0);
        assert_eq!(snap.bytes_written, 0);
    }
}
