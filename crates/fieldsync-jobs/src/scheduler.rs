//! Background upload scheduler.
//!
//! One logical worker drives the remote-sync primitive until nothing is
//! left to upload. A run is a loop of iterations: count the queue, call the
//! primitive once, count again, report progress, wait, repeat. Runs never
//! overlap. A supervisor task starts a run on every trigger (new capture,
//! foreground resume, explicit check) and re-triggers failed runs with
//! exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use fieldsync_core::defaults::{
    EVENT_BUS_CAPACITY, SYNC_INTERVAL_MS, SYNC_MAX_CONSECUTIVE_FAILURES, SYNC_RETRY_BACKOFF_MAX_MS,
    SYNC_RETRY_BACKOFF_MS,
};
use fieldsync_core::{
    AttachmentState, Error, Result, SyncPrimitive, UploadProgress, UploadStatus,
};
use fieldsync_db::{Database, DeleteReconciler};

/// Configuration for the upload scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wait between iterations while uploads remain pending.
    pub interval_ms: u64,
    /// First re-trigger delay after a failed run.
    pub retry_backoff_ms: u64,
    /// Upper bound on the re-trigger delay.
    pub retry_backoff_max_ms: u64,
    /// Failed runs in a row before automatic re-triggering stops.
    pub max_consecutive_failures: u32,
    /// Whether the supervisor runs at all.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: SYNC_INTERVAL_MS,
            retry_backoff_ms: SYNC_RETRY_BACKOFF_MS,
            retry_backoff_max_ms: SYNC_RETRY_BACKOFF_MAX_MS,
            max_consecutive_failures: SYNC_MAX_CONSECUTIVE_FAILURES,
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `FIELDSYNC_SCHEDULER_ENABLED` | `true` | Enable/disable background uploads |
    /// | `FIELDSYNC_SYNC_INTERVAL_MS` | `2000` | Wait between iterations |
    /// | `FIELDSYNC_RETRY_BACKOFF_MS` | `5000` | First retry delay after a failed run |
    /// | `FIELDSYNC_MAX_SYNC_FAILURES` | `5` | Failed runs before retries stop |
    pub fn from_env() -> Self {
        let enabled = std::env::var("FIELDSYNC_SCHEDULER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let interval_ms = std::env::var("FIELDSYNC_SYNC_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(SYNC_INTERVAL_MS);

        let retry_backoff_ms = std::env::var("FIELDSYNC_RETRY_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(SYNC_RETRY_BACKOFF_MS);

        let max_consecutive_failures = std::env::var("FIELDSYNC_MAX_SYNC_FAILURES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(SYNC_MAX_CONSECUTIVE_FAILURES);

        Self {
            interval_ms,
            retry_backoff_ms,
            retry_backoff_max_ms: SYNC_RETRY_BACKOFF_MAX_MS.max(retry_backoff_ms),
            max_consecutive_failures,
            enabled,
        }
    }

    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    /// Set the base and cap of the retry backoff.
    pub fn with_retry_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_backoff_ms = base_ms;
        self.retry_backoff_max_ms = max_ms.max(base_ms);
        self
    }

    pub fn with_max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Delay before the re-trigger that follows the `failures`-th failed run
    /// in a row.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Event emitted by the upload scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A run began.
    RunStarted,
    /// Progress within the current cycle.
    Progress(UploadProgress),
    /// Snapshot for the UI, published after every iteration.
    Status(UploadStatus),
    /// The remote-sync primitive failed as a whole; the run stopped.
    UploadError { error: String },
    /// Nothing left to upload; the run stopped.
    Quiescent { iterations: u32 },
    /// The run stopped on request between iterations.
    Cancelled,
    /// The supervisor will start another run after `delay_ms` without an
    /// external trigger.
    RetryScheduled { attempt: u32, delay_ms: u64 },
    /// Automatic retries used up; only a trigger starts the next run.
    RetriesExhausted { attempts: u32 },
    /// Supervisor started.
    SchedulerStarted,
    /// Supervisor stopped.
    SchedulerStopped,
}

/// How a call to [`UploadScheduler::run_once`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was active; this call did nothing.
    AlreadyRunning,
    /// The queue drained.
    Quiescent { iterations: u32 },
    /// The primitive (or the store) failed; counters were reset.
    Failed { error: String },
    /// Stopped between iterations on request.
    Cancelled,
}

/// Counters carried across the iterations of one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CycleCounters {
    total_at_cycle_start: u64,
    uploaded_so_far: u64,
}

impl CycleCounters {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn begin_iteration(&mut self, pending: u64) {
        if self.total_at_cycle_start == 0 {
            self.total_at_cycle_start = pending;
        }
    }

    /// Fold one iteration's before/after counts into the cycle.
    ///
    /// Captures that land mid-iteration can make `after` exceed `before`;
    /// the delta then counts as zero and the total grows to keep
    /// `uploaded <= total`.
    fn observe(&mut self, before: u64, after: u64) -> UploadProgress {
        self.uploaded_so_far += before.saturating_sub(after);
        self.total_at_cycle_start = self
            .total_at_cycle_start
            .max(self.uploaded_so_far + after);
        UploadProgress {
            uploaded: self.uploaded_so_far,
            total: self.total_at_cycle_start,
        }
    }
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    scheduler: Arc<UploadScheduler>,
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Ask for a run. Returns immediately; coalesces with an active run.
    pub fn trigger(&self) {
        self.scheduler.trigger();
    }

    /// Stop the active run after its in-flight call completes.
    pub fn cancel_pending_uploads(&self) {
        self.scheduler.cancel();
    }

    /// Signal the supervisor to shut down gracefully.
    ///
    /// Succeeds if the supervisor already stopped (or never started
    /// because it is disabled).
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.cancel();
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Upload scheduler already stopped");
        }
        Ok(())
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_rx.resubscribe()
    }

    pub async fn status(&self) -> Result<UploadStatus> {
        self.scheduler.status().await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn scheduler(&self) -> &Arc<UploadScheduler> {
        &self.scheduler
    }
}

/// Drives the remote-sync primitive until the upload queue drains.
pub struct UploadScheduler {
    db: Database,
    deletes: DeleteReconciler,
    primitive: Arc<dyn SyncPrimitive>,
    config: SchedulerConfig,
    running: AtomicBool,
    counters: Mutex<CycleCounters>,
    cancel_requested: AtomicBool,
    cancel_signal: Notify,
    trigger: Arc<Notify>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl UploadScheduler {
    /// Create a scheduler. `trigger` is the signal the capture pipeline
    /// notifies when it stages new work.
    pub fn new(
        db: Database,
        deletes: DeleteReconciler,
        primitive: Arc<dyn SyncPrimitive>,
        config: SchedulerConfig,
        trigger: Arc<Notify>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            db,
            deletes,
            primitive,
            config,
            running: AtomicBool::new(false),
            counters: Mutex::new(CycleCounters::default()),
            cancel_requested: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            trigger,
            event_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the supervisor for a run.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the active run between iterations. No effect when idle.
    pub fn cancel(&self) {
        if self.is_running() {
            info!("Cancelling pending uploads");
            self.cancel_requested.store(true, Ordering::SeqCst);
            self.cancel_signal.notify_waiters();
        }
    }

    /// Current `{pending, failed, is_running}` snapshot.
    pub async fn status(&self) -> Result<UploadStatus> {
        Ok(UploadStatus {
            pending: self.db.attachments.count_pending().await?,
            failed: self
                .db
                .attachments
                .count_by_state(AttachmentState::Failed)
                .await?,
            is_running: self.is_running(),
        })
    }

    /// Upload progress of the current cycle.
    pub fn progress(&self) -> UploadProgress {
        let counters = self.lock_counters();
        UploadProgress {
            uploaded: counters.uploaded_so_far,
            total: counters.total_at_cycle_start,
        }
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, CycleCounters> {
        // Counters are plain integers; a panic mid-update cannot leave them unusable.
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn publish_status(&self) {
        match self.status().await {
            Ok(status) => self.emit(SchedulerEvent::Status(status)),
            Err(e) => warn!(error = %e, "Failed to read upload status"),
        }
    }

    /// Perform one run to quiescence, failure or cancellation.
    ///
    /// Returns [`RunOutcome::AlreadyRunning`] without doing anything when a
    /// run is already active.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> RunOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Upload run already active");
            return RunOutcome::AlreadyRunning;
        }
        let guard = RunningGuard(&self.running);
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.emit(SchedulerEvent::RunStarted);

        let outcome = match self.prepare().await {
            Ok(()) => self.iterate().await,
            Err(e) => {
                error!(error = %e, "Failed to prepare upload run");
                RunOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        match &outcome {
            RunOutcome::Failed { error } => {
                self.lock_counters().reset();
                self.emit(SchedulerEvent::UploadError {
                    error: error.clone(),
                });
            }
            RunOutcome::Quiescent { iterations } => {
                self.emit(SchedulerEvent::Quiescent {
                    iterations: *iterations,
                });
            }
            RunOutcome::Cancelled => self.emit(SchedulerEvent::Cancelled),
            RunOutcome::AlreadyRunning => {}
        }
        drop(guard);
        self.publish_status().await;
        outcome
    }

    /// Put the ledger back in a runnable shape: recover uploads interrupted
    /// by a crash, finish half-done deletes, requeue failed uploads.
    async fn prepare(&self) -> Result<()> {
        self.db.attachments.recover_interrupted().await?;
        self.deletes.sweep_released().await?;
        self.db.attachments.requeue_failed().await?;
        Ok(())
    }

    async fn iterate(&self) -> RunOutcome {
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut iterations = 0u32;
        let mut flushed_tombstones = false;

        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                self.lock_counters().reset();
                info!(iterations, "Upload run cancelled");
                return RunOutcome::Cancelled;
            }

            let pending = match self.count_queued().await {
                Ok(n) => n,
                Err(e) => return self.failed("count pending uploads", e),
            };

            if pending == 0 {
                let tombstones = match self.db.tombstones.count_unconsumed().await {
                    Ok(n) => n,
                    Err(e) => return self.failed("count tombstones", e),
                };
                if tombstones > 0 && !flushed_tombstones {
                    debug!(tombstones, "No uploads pending, flushing tombstones");
                    flushed_tombstones = true;
                    if let Err(e) = self.primitive.sync_pending().await {
                        return self.failed("sync", e);
                    }
                    continue;
                }
                self.lock_counters().reset();
                info!(iterations, "Upload queue drained");
                return RunOutcome::Quiescent { iterations };
            }

            self.lock_counters().begin_iteration(pending);
            iterations += 1;
            debug!(iteration = iterations, pending, "Upload iteration");

            if let Err(e) = self.primitive.sync_pending().await {
                return self.failed("sync", e);
            }

            let after = match self.count_queued().await {
                Ok(n) => n,
                Err(e) => return self.failed("count pending uploads", e),
            };
            let progress = self.lock_counters().observe(pending, after);
            self.emit(SchedulerEvent::Progress(progress));
            self.publish_status().await;

            if after == 0 {
                continue;
            }
            // Registered before the flag check so a cancel in between still wakes us.
            let cancelled = self.cancel_signal.notified();
            if self.cancel_requested.load(Ordering::SeqCst) {
                continue;
            }
            tokio::select! {
                _ = cancelled => {}
                _ = sleep(interval) => {}
            }
        }
    }

    async fn count_queued(&self) -> Result<u64> {
        self.db
            .attachments
            .count_by_state(AttachmentState::QueuedUpload)
            .await
    }

    fn failed(&self, op: &'static str, e: Error) -> RunOutcome {
        warn!(op, error = %e, "Upload run failed");
        RunOutcome::Failed {
            error: e.to_string(),
        }
    }

    /// Start the supervisor and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let scheduler = Arc::new(self);
        let supervisor = Arc::clone(&scheduler);

        tokio::spawn(async move {
            supervisor.supervise(&mut shutdown_rx).await;
        });

        SchedulerHandle {
            scheduler,
            shutdown_tx,
            event_rx,
        }
    }

    /// Run on every trigger; re-trigger failed runs with backoff.
    #[instrument(skip(self))]
    fn schedule_retry(&self, attempt: u32, delay: Duration) -> Option<Duration> {
        self.emit(SchedulerEvent::RetryScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        Some(delay)
    }

    /// After a run drains the queue, FAILED rows get another run after a
    /// backoff delay, up to `max_consecutive_failures` rounds.
    async fn retry_failed_rows(&self, failed_rounds: &mut u32) -> Option<Duration> {
        let failed = match self.db.attachments.count_by_state(AttachmentState::Failed).await {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "Could not count failed uploads");
                return None;
            }
        };
        if failed == 0 {
            *failed_rounds = 0;
            return None;
        }

        *failed_rounds += 1;
        if *failed_rounds > self.config.max_consecutive_failures {
            warn!(failed, rounds = *failed_rounds, "Failed uploads remain, waiting for an external trigger");
            self.emit(SchedulerEvent::RetriesExhausted {
                attempts: *failed_rounds,
            });
            return None;
        }
        let delay = self.config.backoff_for(*failed_rounds);
        info!(failed, retry_in_ms = delay.as_millis() as u64, "Failed uploads will be retried");
        self.schedule_retry(*failed_rounds, delay)
    }

    async fn supervise(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Upload scheduler is disabled, not starting");
            return;
        }

        info!(
            interval_ms = self.config.interval_ms,
            retry_backoff_ms = self.config.retry_backoff_ms,
            max_consecutive_failures = self.config.max_consecutive_failures,
            "Upload scheduler started"
        );
        self.emit(SchedulerEvent::SchedulerStarted);

        let mut failures = 0u32;
        // Consecutive quiescent runs that still left FAILED rows behind.
        let mut failed_rounds = 0u32;
        loop {
            // Work left over from a previous session is picked up on start.
            let retry_in = match self.run_once().await {
                RunOutcome::Failed { .. } => {
                    failures += 1;
                    if failures <= self.config.max_consecutive_failures {
                        let delay = self.config.backoff_for(failures);
                        warn!(failures, retry_in_ms = delay.as_millis() as u64, "Upload run failed, retry scheduled");
                        self.schedule_retry(failures, delay)
                    } else {
                        warn!(failures, "Upload run failed, waiting for an external trigger");
                        self.emit(SchedulerEvent::RetriesExhausted { attempts: failures });
                        None
                    }
                }
                RunOutcome::Cancelled => {
                    failures = 0;
                    // Triggers that arrived during the cancelled run must not restart it.
                    let _ = self.trigger.notified().now_or_never();
                    None
                }
                RunOutcome::Quiescent { .. } => {
                    failures = 0;
                    self.retry_failed_rows(&mut failed_rounds).await
                }
                RunOutcome::AlreadyRunning => None,
            };

            let retry = async {
                match retry_in {
                    Some(delay) => sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Upload scheduler received shutdown signal");
                    break;
                }
                _ = self.trigger.notified() => {
                    debug!("Upload run triggered");
                }
                _ = retry => {
                    debug!(failures, "Retrying failed upload run");
                }
            }
        }

        self.emit(SchedulerEvent::SchedulerStopped);
        info!("Upload scheduler stopped");
    }
}
