//! Periodic batch passes.
//!
//! Each pass is a short-lived invocation: reap + claim a batch, process the
//! claimed jobs one at a time with a courtesy delay between them, then run
//! the compensator. Overlapping passes are expected and safe; exclusivity
//! comes from the claim protocol, not from the scheduler being
//! single-instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::compensator::Compensator;
use crate::error::QueueError;
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::store::QueueStore;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum jobs claimed per pass.
    pub batch_limit: usize,
    /// Pause between two jobs in the same pass. Not a correctness measure;
    /// it keeps the external call volume under the provider's rate limits.
    pub inter_job_delay: Duration,
    /// Interval between periodic passes.
    pub interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            inter_job_delay: Duration::from_millis(500),
            interval: Duration::from_secs(60),
            name: "fulfillment-runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_inter_job_delay(mut self, delay: Duration) -> Self {
        self.inter_job_delay = delay;
        self
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PassSummary {
    /// True when the cheap existence checks found nothing to do and the pass
    /// skipped all work, including the reap scan.
    pub skipped: bool,
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub refunds_issued: usize,
}

/// Handle to a spawned periodic runner.
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Request graceful shutdown and wait for the runner to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Drives claim/process/compensate passes.
pub struct Runner {
    queue: Arc<dyn QueueStore>,
    processor: JobProcessor,
    compensator: Compensator,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        processor: JobProcessor,
        compensator: Compensator,
        config: RunnerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            compensator,
            config,
        }
    }

    /// One pass. This is also the manual "run now" operation; it has exactly
    /// the semantics of a periodic tick.
    pub async fn run_once(&self) -> Result<PassSummary, QueueError> {
        let now = Utc::now();
        let mut summary = PassSummary::default();

        // Quiet-period no-op: skip everything, including the reap scan.
        let refund_cutoff = self.compensator.cutoff(now);
        if !self.queue.has_runnable(now).await? && !self.queue.has_refundable(refund_cutoff).await?
        {
            summary.skipped = true;
            debug!(runner = %self.config.name, "nothing runnable; pass skipped");
            return Ok(summary);
        }

        let batch = self.queue.claim_batch(self.config.batch_limit, now).await?;
        summary.claimed = batch.len();
        debug!(runner = %self.config.name, claimed = batch.len(), "claimed batch");

        for (i, item) in batch.iter().enumerate() {
            if i > 0 && !self.config.inter_job_delay.is_zero() {
                tokio::time::sleep(self.config.inter_job_delay).await;
            }

            // One bad job never blocks the rest of the batch.
            match self.processor.process(item).await {
                Ok(ProcessOutcome::Completed) | Ok(ProcessOutcome::CompletedDuplicate) => {
                    summary.completed += 1;
                }
                Ok(ProcessOutcome::Rescheduled) => summary.rescheduled += 1,
                Ok(ProcessOutcome::Failed) => summary.failed += 1,
                Err(e) => {
                    error!(
                        runner = %self.config.name,
                        queue_id = %item.queue_id,
                        error = %e,
                        "could not record job outcome; row will be reaped"
                    );
                }
            }
        }

        summary.refunds_issued = self.compensator.run_once(now).await.unwrap_or_else(|e| {
            error!(runner = %self.config.name, error = %e, "compensator pass failed");
            0
        });

        info!(
            runner = %self.config.name,
            claimed = summary.claimed,
            completed = summary.completed,
            rescheduled = summary.rescheduled,
            failed = summary.failed,
            refunds = summary.refunds_issued,
            "pass finished"
        );
        Ok(summary)
    }

    /// Spawn the periodic driver on the current tokio runtime.
    pub fn spawn(self) -> RunnerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.config.name.clone();
        let interval = self.config.interval;

        let join = tokio::spawn(async move {
            info!(runner = %name, "runner started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(runner = %name, error = %e, "pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(runner = %name, "runner stopped");
        });

        RunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
