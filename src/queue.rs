// =============================================================================
// queue.rs — THE DOCUMENT PROCESSING QUEUE
// =============================================================================
//
// URLs go in, classified documents come out the other end on the archive
// channel. One item is processed at a time:
//
//     pending ──> processing ──> completed
//        ^            │
//        └── retry ───┤ (transient failure, attempts left)
//                     ├──> error      (out of attempts, or the backend said no)
//                     └──> cancelled  (cancel(id) or shutdown mid-flight)
//
// Progress is reported per item: 10 when picked up, 50 once the backend has
// answered, 90 once classified, 100 when handed to the archive.
//
// State is in memory only. A restart loses the queue.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::classifier;
use crate::dedup::DedupEngine;
use crate::error::{ArchiveError, Result};
use crate::metrics::{AiUpdate, MetricsStore, ScrapingUpdate};
use crate::models::{DocumentRecord, Priority, QueueItem, QueueStatus};

/// Per-call knobs handed to the processor.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    /// Route the fetch through a proxy from the pool.
    pub use_proxy: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { use_proxy: true }
    }
}

/// Turns a queued URL into a document. The production implementation is
/// [`crate::backend::HttpProcessor`].
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(&self, item: &QueueItem, options: &ProcessOptions) -> Result<DocumentRecord>;
}

/// What a processed item feeds.
pub struct ProcessingContext {
    pub metrics: Arc<MetricsStore>,
    pub archive: Sender<DocumentRecord>,
    pub options: ProcessOptions,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

pub struct DocumentQueue {
    items: RwLock<Vec<QueueItem>>,
    dedup: Arc<DedupEngine>,
    max_attempts: u32,
    /// Id and abort switch of the item currently being processed.
    in_flight: Mutex<Option<(String, watch::Sender<bool>)>>,
}

impl DocumentQueue {
    pub fn new(dedup: Arc<DedupEngine>, max_attempts: u32) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            dedup,
            max_attempts: max_attempts.max(1),
            in_flight: Mutex::new(None),
        }
    }

    /// Validate and queue a URL. Returns the new item's id.
    pub fn enqueue(&self, url: &str, title: Option<&str>, priority: Priority) -> Result<String> {
        let parsed = url::Url::parse(url.trim()).map_err(|e| ArchiveError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ArchiveError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if !self.dedup.check_and_insert(parsed.as_str()) {
            return Err(ArchiveError::DuplicateUrl(parsed.to_string()));
        }

        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| parsed.host_str().unwrap_or_default().to_string());
        let item = QueueItem::new(parsed.to_string(), title, priority);
        let id = item.id.clone();

        debug!(id = %id, url = %item.url, priority = ?priority, "URL queued");
        self.items.write().push(item);
        Ok(id)
    }

    /// Highest priority first, oldest first within a priority.
    pub fn next_pending(&self) -> Option<QueueItem> {
        let items = self.items.read();
        Self::next_pending_index(&items).map(|i| items[i].clone())
    }

    fn next_pending_index(items: &[QueueItem]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, item) in items.iter().enumerate() {
            if item.status != QueueStatus::Pending {
                continue;
            }
            match best {
                Some(b) if items[b].priority >= item.priority => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Claim the next pending item: `pending -> processing`, progress 10.
    /// The abort switch is registered under the same lock, so a cancel can
    /// never see a processing item without one.
    fn claim_next(&self) -> Option<(QueueItem, watch::Receiver<bool>)> {
        let mut items = self.items.write();
        let idx = Self::next_pending_index(&items)?;
        let item = &mut items[idx];
        item.status = QueueStatus::Processing;
        item.progress = 10;
        item.attempts += 1;
        item.error = None;

        let (abort_tx, abort_rx) = watch::channel(false);
        *self.in_flight.lock() = Some((item.id.clone(), abort_tx));
        Some((item.clone(), abort_rx))
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut QueueItem)) {
        if let Some(item) = self.items.write().iter_mut().find(|i| i.id == id) {
            f(item);
        }
    }

    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.items.read().iter().find(|i| i.id == id).cloned()
    }

    /// Process one item end to end. Returns `None` when nothing is pending,
    /// otherwise the item as it stands afterwards.
    ///
    /// `shutdown` flipping mid-flight aborts the processor call and cancels
    /// the item, as does [`DocumentQueue::cancel`] on the in-flight id.
    pub async fn process_next(
        &self,
        processor: &dyn DocumentProcessor,
        ctx: &ProcessingContext,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<QueueItem> {
        let (item, mut abort_rx) = self.claim_next()?;

        info!(id = %item.id, url = %item.url, attempt = item.attempts, "Processing document");
        let started = Instant::now();

        let outcome = tokio::select! {
            result = processor.process(&item, &ctx.options) => Some(result),
            _ = abort_rx.changed() => None,
            _ = shutdown.changed() => None,
        };
        *self.in_flight.lock() = None;

        match outcome {
            None => {
                warn!(id = %item.id, "Processing cancelled");
                self.update(&item.id, |i| {
                    i.status = QueueStatus::Cancelled;
                    i.error = Some(ArchiveError::Cancelled.to_string());
                });
                self.dedup.forget(&item.url);
            }
            Some(Ok(document)) => {
                self.update(&item.id, |i| i.progress = 50);
                let fetch_time = started.elapsed();
                if let Err(e) = self.complete(&item, document, fetch_time, ctx) {
                    ctx.metrics.update_scraping_metrics(ScrapingUpdate {
                        success: false,
                        processing_time: fetch_time,
                        proxy_count: None,
                    });
                    self.fail(&item, e);
                }
            }
            Some(Err(e)) => {
                ctx.metrics.update_scraping_metrics(ScrapingUpdate {
                    success: false,
                    processing_time: started.elapsed(),
                    proxy_count: None,
                });
                self.fail(&item, e);
            }
        }

        self.get(&item.id)
    }

    /// Classify and hand off to the archive. Only a document the archive
    /// channel accepted makes the item completed.
    fn complete(
        &self,
        item: &QueueItem,
        mut document: DocumentRecord,
        fetch_time: Duration,
        ctx: &ProcessingContext,
    ) -> Result<()> {
        let classify_started = Instant::now();
        let text = format!("{}\n{}", document.title, document.content);
        let analysis = classifier::analyze(&text);
        let classify_time = classify_started.elapsed();

        if document.title.is_empty() {
            document.title = item.title.clone();
        }
        if document.url.is_empty() {
            document.url = item.url.clone();
        }
        document.classification = analysis.category;
        document.confidence = analysis.confidence;
        document.topics = analysis.topics;
        document.quality_score = analysis.quality_score;
        self.update(&item.id, |i| i.progress = 90);

        ctx.metrics.update_ai_metrics(AiUpdate {
            confidence: analysis.confidence,
            processing_time: classify_time,
        });

        info!(
            id = %item.id,
            category = %document.classification,
            confidence = document.confidence,
            quality = document.quality_score,
            bucket = ?document.quality_bucket(),
            "Document classified"
        );

        match ctx.archive.try_send(document) {
            Ok(()) => {}
            Err(TrySendError::Full(doc)) => {
                warn!(id = %doc.id, "Archive channel full, document not archived");
                return Err(ArchiveError::ArchiveUnavailable("full"));
            }
            Err(TrySendError::Disconnected(doc)) => {
                error!(id = %doc.id, "Archive channel disconnected, document not archived");
                return Err(ArchiveError::ArchiveUnavailable("disconnected"));
            }
        }

        ctx.metrics.update_scraping_metrics(ScrapingUpdate {
            success: true,
            processing_time: fetch_time,
            proxy_count: None,
        });
        self.update(&item.id, |i| {
            i.status = QueueStatus::Completed;
            i.progress = 100;
        });
        Ok(())
    }

    fn fail(&self, item: &QueueItem, e: ArchiveError) {
        let retry = e.is_transient() && item.attempts < self.max_attempts;
        if retry {
            warn!(id = %item.id, attempt = item.attempts, error = %e, "Processing failed, will retry");
        } else {
            error!(id = %item.id, attempts = item.attempts, error = %e, "Processing failed for good");
            self.dedup.forget(&item.url);
        }
        self.update(&item.id, |i| {
            i.error = Some(e.to_string());
            i.progress = 0;
            i.status = if retry { QueueStatus::Pending } else { QueueStatus::Error };
        });
    }

    /// Cancel an item. A pending item is cancelled on the spot; the
    /// in-flight item is aborted and becomes cancelled once its call
    /// unwinds. Finished items are left alone. Returns the status after the
    /// call.
    pub fn cancel(&self, id: &str) -> Result<QueueStatus> {
        let mut items = self.items.write();
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| ArchiveError::ItemNotFound(id.to_string()))?;

        match item.status {
            QueueStatus::Pending => {
                item.status = QueueStatus::Cancelled;
                self.dedup.forget(&item.url);
                info!(id = %id, "Pending item cancelled");
            }
            QueueStatus::Processing => {
                if let Some((flight_id, abort)) = self.in_flight.lock().as_ref() {
                    if flight_id == id {
                        let _ = abort.send(true);
                    }
                }
            }
            _ => {}
        }
        Ok(item.status)
    }

    pub fn stats(&self) -> QueueStats {
        let items = self.items.read();
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in items.iter() {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Error => stats.error += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.items.read().clone()
    }

    /// Drop every completed, errored and cancelled item.
    pub fn clear_finished(&self) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|i| !i.status.is_terminal());
        before - items.len()
    }

    /// Work the queue until shutdown, sleeping `poll_interval` when idle.
    pub async fn run(
        &self,
        processor: Arc<dyn DocumentProcessor>,
        ctx: ProcessingContext,
        poll_interval: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        info!(max_attempts = self.max_attempts, "Document queue online");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next(processor.as_ref(), &ctx, shutdown).await.is_some() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        let stats = self.stats();
        info!(
            pending = stats.pending,
            completed = stats.completed,
            errors = stats.error,
            "Document queue: shutting down"
        );
    }
}
