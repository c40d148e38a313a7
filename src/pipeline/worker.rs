//! Per-partition worker loop.
//!
//! One worker owns one partition queue and drains it strictly front to
//! back. Item failures are recorded and never break the loop; only a
//! shutdown signal stops a worker early.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::controller::ClaimedItem;
use crate::error::WorkError;
use crate::freshness::{self, FreshnessGate, FreshnessVerdict};
use crate::store::{CompletionMeta, HistoryStore};

use super::{ArticleExtractor, OutputSink, Rewriter};

/// Events a worker streams back to the controller.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Duration of one successful rewrite call.
    RewriteSample(Duration),
    /// One item failed; already persisted to the store.
    Failure {
        url: String,
        class: String,
        reason: String,
    },
}

/// Progress counters shared between a worker and the controller.
///
/// `index` is the position of the item currently being processed;
/// `last_sequence` is the sequence of the last item that reached a
/// terminal outcome, used for interruption points.
#[derive(Debug, Default)]
pub struct WorkerProgress {
    pub index: AtomicUsize,
    pub last_sequence: AtomicU64,
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
    pub skipped: AtomicUsize,
}

impl WorkerProgress {
    /// Sequence of the last settled item, if any item settled.
    pub fn last_settled_sequence(&self) -> Option<u64> {
        match self.last_sequence.load(Ordering::SeqCst) {
            0 => None,
            s => Some(s),
        }
    }
}

/// Everything a worker needs besides its queue.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: HistoryStore,
    pub gate: FreshnessGate,
    pub extractor: Arc<dyn ArticleExtractor>,
    pub rewriter: Arc<dyn Rewriter>,
    pub sink: Arc<dyn OutputSink>,
    pub session: String,
    pub max_age_days: i64,
    pub rewrite_timeout: Duration,
}

enum ItemFate {
    Completed,
    Skipped(String),
}

pub struct Worker {
    pub partition: String,
    pub items: Arc<Vec<ClaimedItem>>,
    pub progress: Arc<WorkerProgress>,
    pub ctx: WorkerContext,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub shutdown: broadcast::Receiver<()>,
}

impl Worker {
    pub async fn run(mut self) {
        tracing::info!(
            partition = %self.partition,
            items = self.items.len(),
            "worker started"
        );

        for (idx, item) in self.items.iter().enumerate() {
            if self.shutdown.try_recv().is_ok() {
                tracing::info!(partition = %self.partition, "worker shutting down");
                return;
            }
            self.progress.index.store(idx, Ordering::SeqCst);

            match self.process_item(item).await {
                Ok(ItemFate::Completed) => {
                    self.progress.succeeded.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(
                        partition = %self.partition,
                        url = %item.url,
                        sequence = item.sequence,
                        "item completed"
                    );
                }
                Ok(ItemFate::Skipped(reason)) => {
                    self.progress.skipped.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(
                        partition = %self.partition,
                        url = %item.url,
                        reason = %reason,
                        "item skipped"
                    );
                    if let Err(e) = self.ctx.store.record_skipped(&item.url, &reason).await {
                        tracing::error!(url = %item.url, error = %e, "failed to record skip");
                    }
                }
                Err(err) => {
                    self.progress.failed.fetch_add(1, Ordering::SeqCst);
                    let reason = err.to_string();
                    let class = err.class();
                    tracing::warn!(
                        partition = %self.partition,
                        url = %item.url,
                        class = %class,
                        error = %reason,
                        "item failed"
                    );
                    if let Err(e) = self
                        .ctx
                        .store
                        .record_failure_class(&item.url, &reason, class)
                        .await
                    {
                        tracing::error!(url = %item.url, error = %e, "failed to record failure");
                    }
                    let _ = self.events.send(WorkerEvent::Failure {
                        url: item.url.clone(),
                        class: class.as_str().to_string(),
                        reason,
                    });
                }
            }
            self.progress
                .last_sequence
                .store(item.sequence, Ordering::SeqCst);
        }

        tracing::info!(partition = %self.partition, "worker drained its queue");
    }

    async fn process_item(&self, item: &ClaimedItem) -> Result<ItemFate, WorkError> {
        let extracted = self.ctx.extractor.extract(&item.url).await?;

        if !freshness::is_recently_published(
            extracted.publish_date.as_deref(),
            self.ctx.max_age_days,
        ) {
            return Ok(ItemFate::Skipped(format!(
                "stale publish date: {}",
                extracted.publish_date.as_deref().unwrap_or("unknown")
            )));
        }

        match self
            .ctx
            .gate
            .check(&extracted.title, &extracted.body, self.ctx.sink.as_ref())
            .await
        {
            Ok(FreshnessVerdict::Fresh) => {}
            Ok(FreshnessVerdict::Duplicate { original_url, .. }) => {
                return Ok(ItemFate::Skipped(format!(
                    "content duplicate of {}",
                    original_url
                )));
            }
            Err(e) => return Err(WorkError::Other(format!("freshness check: {}", e))),
        }

        let started = Instant::now();
        let rewritten =
            match tokio::time::timeout(self.ctx.rewrite_timeout, self.ctx.rewriter.rewrite(&extracted))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(WorkError::RewriteTimeout {
                        seconds: self.ctx.rewrite_timeout.as_secs(),
                    })
                }
            };
        let _ = self
            .events
            .send(WorkerEvent::RewriteSample(started.elapsed()));

        if rewritten.title.trim().is_empty() || rewritten.body.trim().is_empty() {
            return Err(WorkError::RewriteInvalidOutput("empty output".into()));
        }

        self.ctx
            .sink
            .write(&self.ctx.session, item.sequence, &rewritten)
            .await?;

        let meta = CompletionMeta {
            title: Some(extracted.title.clone()),
            content_hash: Some(freshness::content_fingerprint(
                &extracted.title,
                &extracted.body,
            )),
            title_hash: Some(freshness::title_fingerprint(&extracted.title)),
            publish_date: extracted.publish_date.clone(),
            content_length: Some(extracted.body.len()),
        };
        self.ctx
            .store
            .record_completion(&item.url, item.sequence, meta)
            .await
            .map_err(|e| WorkError::Save(format!("record completion: {}", e)))?;

        Ok(ItemFate::Completed)
    }
}
