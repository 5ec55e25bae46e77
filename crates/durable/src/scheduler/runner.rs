//! Periodic driver for the reconciliation jobs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

use super::jobs::{JobKind, ReconciliationJobs};

/// Runs each reconciliation job on its own period until shutdown
///
/// The resume, timeout and retry jobs run every `tick`; cleanup runs every
/// `cleanup_interval`. Jobs never overlap themselves (see
/// [`ReconciliationJobs`]), so a slow run simply delays its next tick.
pub struct ReconciliationScheduler {
    jobs: Arc<ReconciliationJobs>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReconciliationScheduler {
    pub fn new(jobs: Arc<ReconciliationJobs>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { jobs, shutdown_tx }
    }

    pub fn jobs(&self) -> &Arc<ReconciliationJobs> {
        &self.jobs
    }

    /// Spawn one loop per job; the handle completes after [`Self::shutdown`]
    pub fn spawn(&self) -> JoinHandle<()> {
        let loops: Vec<_> = JobKind::ALL
            .into_iter()
            .map(|job| {
                let period = self.period(job);
                job_loop(
                    self.jobs.clone(),
                    job,
                    period,
                    self.shutdown_tx.subscribe(),
                )
            })
            .collect();

        tokio::spawn(async move {
            futures::future::join_all(loops).await;
            info!("Reconciliation scheduler stopped");
        })
    }

    /// Signal every job loop to stop after its current run
    pub fn shutdown(&self) {
        info!("Stopping reconciliation scheduler");
        let _ = self.shutdown_tx.send(true);
    }

    fn period(&self, job: JobKind) -> Duration {
        let config = self.jobs.config();
        match job {
            JobKind::CleanupOldExecutions => config.cleanup_interval,
            _ => config.tick,
        }
    }
}

async fn job_loop(
    jobs: Arc<ReconciliationJobs>,
    job: JobKind,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(%job, period_ms = period.as_millis() as u64, "Starting reconciliation job");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match jobs.run_job(job).await {
            Ok(report) if report.did_work() => info!(
                %job,
                scanned = report.scanned,
                applied = report.applied,
                raced = report.raced,
                errors = report.errors,
                "Reconciliation job ran"
            ),
            Ok(report) => trace!(%job, skipped = report.skipped, "Nothing due"),
            Err(err) => error!(%job, %err, "Reconciliation job failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}
