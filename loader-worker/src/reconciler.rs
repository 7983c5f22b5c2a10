use std::path::Path;
use std::sync::Arc;

use loader_common::batch::{BatchOutcome, BatchStatus};
use loader_common::mapping::RecordMapper;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::LoaderError;
use crate::output::{AppendLog, ATTEMPTED_FILE_NAME, FAILED_FILE_NAME};
use crate::tracker::DispatchTracker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub batches: u64,
    pub attempted: u64,
    pub failed: u64,
    pub partially_failed_batches: u64,
    pub fully_failed_batches: u64,
}

/// Records the disposition of every dispatched record: its natural key in the attempted log,
/// and, when the store did not accept it, its original line in the failed log.
pub struct Reconciler {
    mapper: RecordMapper,
    attempted: AppendLog,
    failed: AppendLog,
    tracker: Arc<DispatchTracker>,
    summary: ReconcileSummary,
}

impl Reconciler {
    pub async fn open(
        output_dir: &Path,
        mapper: RecordMapper,
        tracker: Arc<DispatchTracker>,
    ) -> Result<Self, LoaderError> {
        let attempted = AppendLog::open(output_dir.join(ATTEMPTED_FILE_NAME)).await?;
        let failed = AppendLog::open(output_dir.join(FAILED_FILE_NAME)).await?;

        Ok(Self {
            mapper,
            attempted,
            failed,
            tracker,
            summary: ReconcileSummary::default(),
        })
    }

    /// Reconcile outcomes in the order they arrive, until every sender has gone away.
    pub async fn run(
        mut self,
        mut outcomes: mpsc::Receiver<BatchOutcome>,
    ) -> Result<ReconcileSummary, LoaderError> {
        while let Some(outcome) = outcomes.recv().await {
            self.reconcile(&outcome).await?;
            self.tracker.reconciled();
        }

        info!(
            batches = self.summary.batches,
            attempted = self.summary.attempted,
            failed = self.summary.failed,
            "all batch outcomes reconciled"
        );

        Ok(self.summary)
    }

    /// Append one outcome to the logs. Both logs are flushed before returning.
    pub async fn reconcile(&mut self, outcome: &BatchOutcome) -> Result<(), LoaderError> {
        for record in outcome.attempted() {
            // A record without a natural key still gets a line, so that every attempt is counted.
            let key = self.mapper.natural_key(record).unwrap_or_default();
            self.attempted.append_line(key).await?;
        }

        let mut failed = 0;
        for record in outcome.rejected() {
            self.failed
                .append_line(&self.mapper.serialize(record))
                .await?;
            failed += 1;
        }

        self.attempted.flush().await?;
        self.failed.flush().await?;

        let attempted = outcome.attempted().len() as u64;
        self.summary.batches += 1;
        self.summary.attempted += attempted;
        self.summary.failed += failed;
        match outcome.status() {
            BatchStatus::Succeeded => {}
            BatchStatus::PartiallyFailed => self.summary.partially_failed_batches += 1,
            BatchStatus::FullyFailed => self.summary.fully_failed_batches += 1,
        }

        metrics::counter!("loader_records_attempted_total").increment(attempted);
        metrics::counter!("loader_records_failed_total").increment(failed);
        debug!(
            batch = outcome.batch().sequence(),
            status = outcome.status().as_str(),
            attempted,
            failed,
            "batch outcome reconciled"
        );

        Ok(())
    }
}
