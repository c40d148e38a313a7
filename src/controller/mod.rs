//! Adaptive concurrency controller.
//!
//! Owns one processing run end to end: dedup-checks and claims the
//! input, partitions it by source host, and supervises one worker task
//! per partition. Worker count follows measured rewrite latency through
//! [`LatencyWindow`], so a fast backend gets more parallelism and a
//! saturated one is backed off to a single worker. Workers that exceed
//! their deadline are checkpointed and aborted; panics trigger a
//! recovery cycle with a crash-loop breaker.

pub mod latency;
pub mod partition;
pub mod report;
pub mod state;

pub use latency::LatencyWindow;
pub use partition::{partition_of, ClaimedItem, PartitionQueue};
pub use report::{ProcessingReport, ReportedError};
pub use state::ControllerState;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::ControllerError;
use crate::freshness::FreshnessGate;
use crate::pipeline::worker::{Worker, WorkerContext, WorkerEvent, WorkerProgress};
use crate::pipeline::{ArticleExtractor, OutputSink, Rewriter};
use crate::store::{ClaimOutcome, HistoryStore};

/// Tuning knobs for a controller run.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often the scheduling loop wakes up.
    pub recheck_interval: Duration,
    /// Consecutive idle ticks before the run is declared finished.
    pub idle_threshold: u32,
    /// Publish dates older than this many days disqualify an article.
    pub max_age_days: i64,
    /// Deadline for a single rewrite call.
    pub rewrite_timeout: Duration,
    /// Pause before restarting workers after a crash.
    pub recovery_pause: Duration,
    /// Crash recoveries allowed per run before giving up.
    pub max_recovery_attempts: u32,
    /// Re-claim previously failed URLs instead of skipping them.
    pub retry_failed: bool,
    /// Fixed per-worker deadline; `None` derives it from queue length.
    pub worker_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(10),
            idle_threshold: 10,
            max_age_days: crate::freshness::DEFAULT_MAX_AGE_DAYS,
            rewrite_timeout: partition::PER_ITEM_ALLOWANCE,
            recovery_pause: Duration::from_secs(5),
            max_recovery_attempts: 5,
            retry_failed: false,
            worker_timeout: None,
        }
    }
}

impl ControllerConfig {
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, ticks: u32) -> Self {
        self.idle_threshold = ticks;
        self
    }

    pub fn with_max_age_days(mut self, days: i64) -> Self {
        self.max_age_days = days;
        self
    }

    pub fn with_rewrite_timeout(mut self, timeout: Duration) -> Self {
        self.rewrite_timeout = timeout;
        self
    }

    pub fn with_recovery_pause(mut self, pause: Duration) -> Self {
        self.recovery_pause = pause;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    pub fn with_retry_failed(mut self, retry: bool) -> Self {
        self.retry_failed = retry;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = Some(timeout);
        self
    }
}

struct ActiveWorker {
    partition: String,
    items: Arc<Vec<ClaimedItem>>,
    progress: Arc<WorkerProgress>,
    handle: JoinHandle<()>,
    started: Instant,
    timeout: Duration,
}

/// One coherent read of a worker's counters. Taken exactly once per
/// reap or abort: the same snapshot feeds the report roll-up and the
/// requeue slice, so an item settling between two separate reads can
/// never fall through unaccounted.
#[derive(Debug, Clone, Copy)]
struct ProgressSnapshot {
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

impl ProgressSnapshot {
    fn settled(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

impl ActiveWorker {
    fn snapshot(&self) -> ProgressSnapshot {
        use std::sync::atomic::Ordering;
        ProgressSnapshot {
            succeeded: self.progress.succeeded.load(Ordering::SeqCst),
            failed: self.progress.failed.load(Ordering::SeqCst),
            skipped: self.progress.skipped.load(Ordering::SeqCst),
        }
    }

    /// Items past the snapshot's settled prefix, preserving order.
    fn unsettled_queue(&self, snapshot: ProgressSnapshot) -> PartitionQueue {
        PartitionQueue {
            name: self.partition.clone(),
            items: self.items[snapshot.settled()..].to_vec(),
        }
    }
}

pub struct Controller {
    store: HistoryStore,
    extractor: Arc<dyn ArticleExtractor>,
    rewriter: Arc<dyn Rewriter>,
    sink: Arc<dyn OutputSink>,
    session: String,
    config: ControllerConfig,
    state: ControllerState,
    shutdown: broadcast::Sender<()>,
    run_id: uuid::Uuid,
}

impl Controller {
    pub fn new(
        store: HistoryStore,
        extractor: Arc<dyn ArticleExtractor>,
        rewriter: Arc<dyn Rewriter>,
        sink: Arc<dyn OutputSink>,
        session: impl Into<String>,
        config: ControllerConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            store,
            extractor,
            rewriter,
            sink,
            session: session.into(),
            config,
            state: ControllerState::Idle,
            shutdown,
            run_id: uuid::Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Handle for requesting a graceful drain from outside the run.
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    fn transition(&mut self, to: ControllerState) -> Result<(), ControllerError> {
        if !self.state.can_transition_to(to) {
            return Err(ControllerError::InvalidState {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        tracing::debug!(from = %self.state, to = %to, "controller state change");
        self.state = to;
        Ok(())
    }

    /// Run the full pipeline over `urls` and return the final accounting.
    pub async fn run(&mut self, urls: &[String]) -> Result<ProcessingReport, ControllerError> {
        if self.state != ControllerState::Idle {
            return Err(ControllerError::AlreadyRunning);
        }
        self.transition(ControllerState::Running)?;

        let mut report = ProcessingReport {
            total_input: urls.len(),
            ..Default::default()
        };

        let mut pending = self.build_queues(urls, &mut report).await?;
        tracing::info!(
            run_id = %self.run_id,
            session = %self.session,
            input = report.total_input,
            duplicates = report.duplicates_skipped,
            partitions = pending.len(),
            "run starting"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut window = LatencyWindow::default();
        let mut active: Vec<ActiveWorker> = Vec::new();
        let mut interval = tokio::time::interval(self.config.recheck_interval);
        let mut idle_ticks = 0u32;
        let mut recovery_attempts = 0u32;

        loop {
            interval.tick().await;

            if self.state == ControllerState::Running && shutdown_rx.try_recv().is_ok() {
                tracing::info!("shutdown requested, draining");
                self.transition(ControllerState::Draining)?;
                pending.clear();
                // Workers see the same broadcast and stop between items.
            }

            while let Ok(event) = events_rx.try_recv() {
                match event {
                    WorkerEvent::RewriteSample(d) => window.record(d),
                    WorkerEvent::Failure { url, class, reason } => {
                        report.push_error(url, class, reason)
                    }
                }
            }

            // Reap finished workers, enforce deadlines, detect panics.
            let mut crashed = false;
            let mut survivors = Vec::with_capacity(active.len());
            for mut worker in active.drain(..) {
                if worker.handle.is_finished() {
                    let join = (&mut worker.handle).await;
                    let panicked = matches!(&join, Err(e) if e.is_panic());
                    let snapshot = worker.snapshot();
                    collect_progress(snapshot, &mut report);
                    if panicked {
                        tracing::error!(partition = %worker.partition, "worker panicked");
                        let remainder = worker.unsettled_queue(snapshot);
                        if !remainder.is_empty() {
                            pending.push_front(remainder);
                        }
                        crashed = true;
                    }
                } else if worker.started.elapsed() >= worker.timeout {
                    tracing::warn!(
                        partition = %worker.partition,
                        elapsed_secs = worker.started.elapsed().as_secs(),
                        item_index = worker.progress.index.load(std::sync::atomic::Ordering::SeqCst),
                        "worker deadline exceeded, checkpointing and aborting"
                    );
                    self.store
                        .save_interruption(
                            &worker.partition,
                            worker.progress.last_settled_sequence(),
                            "worker deadline exceeded",
                        )
                        .await?;
                    worker.handle.abort();
                    let snapshot = worker.snapshot();
                    collect_progress(snapshot, &mut report);
                    // The in-flight item stays claimed; the staleness rule
                    // re-offers it if this requeue never reaches it.
                    let remainder = worker.unsettled_queue(snapshot);
                    if !remainder.is_empty() {
                        pending.push_back(remainder);
                    }
                } else {
                    survivors.push(worker);
                }
            }
            active = survivors;

            if crashed {
                recovery_attempts += 1;
                if recovery_attempts > self.config.max_recovery_attempts {
                    for worker in &active {
                        worker.handle.abort();
                    }
                    tracing::error!(attempts = recovery_attempts - 1, "crash loop, giving up");
                    return Err(ControllerError::CrashLoop {
                        attempts: recovery_attempts - 1,
                    });
                }
                self.transition(ControllerState::Recovering)?;
                tracing::warn!(
                    attempt = recovery_attempts,
                    max = self.config.max_recovery_attempts,
                    "recovering from worker crash"
                );
                // Stop the whole worker set and restart from claim state.
                for worker in active.drain(..) {
                    worker.handle.abort();
                    let snapshot = worker.snapshot();
                    collect_progress(snapshot, &mut report);
                    let remainder = worker.unsettled_queue(snapshot);
                    if !remainder.is_empty() {
                        pending.push_back(remainder);
                    }
                }
                tokio::time::sleep(self.config.recovery_pause).await;
                self.transition(ControllerState::Running)?;
            }

            // Scale toward the latency-derived target, staggering launches.
            if self.state == ControllerState::Running {
                let target = window.target_concurrency(active.len());
                let mut launched = 0;
                while active.len() < target {
                    let Some(queue) = pending.pop_front() else { break };
                    if queue.is_empty() {
                        continue;
                    }
                    if launched > 0 {
                        tokio::time::sleep(window.stagger()).await;
                    }
                    tracing::info!(
                        partition = %queue.name,
                        items = queue.len(),
                        active = active.len() + 1,
                        target = target,
                        "starting worker"
                    );
                    active.push(self.spawn_worker(queue, &events_tx));
                    launched += 1;
                }
            }

            if active.is_empty() && pending.is_empty() {
                idle_ticks += 1;
                if idle_ticks >= self.config.idle_threshold {
                    break;
                }
            } else {
                idle_ticks = 0;
            }
        }

        // Late events from the final tick.
        while let Ok(event) = events_rx.try_recv() {
            if let WorkerEvent::Failure { url, class, reason } = event {
                report.push_error(url, class, reason);
            }
        }

        let drained = self.state == ControllerState::Draining;
        self.transition(ControllerState::Finished)?;

        if !drained && !report.is_consistent() {
            tracing::error!(
                total = report.total_input,
                succeeded = report.succeeded,
                failed = report.failed,
                duplicates = report.duplicates_skipped,
                "final report does not balance"
            );
        }
        tracing::info!(report = %report, "run finished");
        Ok(report)
    }

    /// Dedup-check and claim the input, grouped into per-host queues.
    /// Partitions with a recorded interruption point resume first.
    async fn build_queues(
        &self,
        urls: &[String],
        report: &mut ProcessingReport,
    ) -> Result<VecDeque<PartitionQueue>, ControllerError> {
        let check = self.store.batch_check(urls).await?;
        let mut candidates: Vec<(String, bool)> =
            check.new.iter().map(|u| (u.clone(), false)).collect();
        if self.config.retry_failed {
            for dup in &check.duplicates {
                if dup.status == crate::store::WorkStatus::Failed
                    && crate::error::retryable_reason(&dup.reason)
                {
                    candidates.push((dup.url.clone(), true));
                }
            }
        }
        // Everything not offered for claiming (known duplicates and
        // intra-batch repeats) is accounted as skipped.
        report.duplicates_skipped += urls.len() - candidates.len();

        let mut order: Vec<String> = Vec::new();
        let mut queues: HashMap<String, PartitionQueue> = HashMap::new();
        for (url, retry) in &candidates {
            let partition = partition_of(url);
            match self
                .store
                .claim_or_reuse(url, &partition, &self.session, *retry)
                .await?
            {
                ClaimOutcome::Claimed { sequence } => {
                    queues
                        .entry(partition.clone())
                        .or_insert_with(|| {
                            order.push(partition.clone());
                            PartitionQueue::new(partition.clone())
                        })
                        .items
                        .push(ClaimedItem {
                            url: url.clone(),
                            sequence,
                        });
                }
                ClaimOutcome::AlreadyProcessed { status, .. } => {
                    tracing::debug!(url = %url, status = %status, "claim refused, skipping");
                    report.duplicates_skipped += 1;
                }
            }
        }

        let interrupted = self.store.take_interruptions().await?;
        let mut pending = VecDeque::with_capacity(queues.len());
        for point in &interrupted {
            if let Some(queue) = queues.remove(&point.partition) {
                tracing::info!(
                    partition = %point.partition,
                    after_sequence = ?point.last_sequence,
                    "resuming interrupted partition first"
                );
                pending.push_back(queue);
            }
        }
        for name in &order {
            if let Some(queue) = queues.remove(name) {
                pending.push_back(queue);
            }
        }
        Ok(pending)
    }

    fn spawn_worker(
        &self,
        queue: PartitionQueue,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> ActiveWorker {
        let timeout = self
            .config
            .worker_timeout
            .unwrap_or_else(|| queue.worker_timeout());
        let items = Arc::new(queue.items);
        let progress = Arc::new(WorkerProgress::default());
        let worker = Worker {
            partition: queue.name.clone(),
            items: Arc::clone(&items),
            progress: Arc::clone(&progress),
            ctx: WorkerContext {
                store: self.store.clone(),
                gate: FreshnessGate::new(self.store.clone()),
                extractor: Arc::clone(&self.extractor),
                rewriter: Arc::clone(&self.rewriter),
                sink: Arc::clone(&self.sink),
                session: self.session.clone(),
                max_age_days: self.config.max_age_days,
                rewrite_timeout: self.config.rewrite_timeout,
            },
            events: events.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        ActiveWorker {
            partition: queue.name,
            items,
            progress,
            handle: tokio::spawn(worker.run()),
            started: Instant::now(),
            timeout,
        }
    }
}

fn collect_progress(snapshot: ProgressSnapshot, report: &mut ProcessingReport) {
    report.succeeded += snapshot.succeeded;
    report.failed += snapshot.failed;
    report.duplicates_skipped += snapshot.skipped;
}
