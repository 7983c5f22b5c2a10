use std::sync::Arc;
use std::time;

use loader_common::batch::{Batch, BatchOutcome};
use loader_common::budget::WriteBudget;
use loader_common::store::BatchWriter;
use tokio::sync::{self, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::LoaderError;
use crate::tracker::DispatchTracker;

/// Paces batches against the write budget and dispatches each one to the store on its own task.
pub struct Submitter {
    /// The store every batch is written to.
    writer: Arc<dyn BatchWriter>,
    /// The table every batch is addressed to.
    table: Arc<str>,
    /// Minimum time between two dispatches.
    interval: time::Duration,
    /// Maximum number of dispatches in flight at once.
    max_in_flight: usize,
    tracker: Arc<DispatchTracker>,
}

impl Submitter {
    pub fn new(
        writer: Arc<dyn BatchWriter>,
        table: &str,
        budget: &WriteBudget,
        max_in_flight: usize,
        tracker: Arc<DispatchTracker>,
    ) -> Self {
        Self {
            writer,
            table: Arc::from(table),
            interval: budget.dispatch_interval(),
            max_in_flight,
            tracker,
        }
    }

    /// Dispatch every batch received on `batches`, one per clock tick, until the channel closes.
    /// Outcomes are sent on `outcomes` as the dispatches complete, in no particular order.
    /// Returns the number of batches dispatched.
    pub async fn run(
        self,
        mut batches: mpsc::Receiver<Batch>,
        outcomes: mpsc::Sender<BatchOutcome>,
    ) -> Result<u64, LoaderError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_in_flight));
        let report_semaphore_utilization = || {
            metrics::gauge!("loader_dispatch_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_in_flight as f64);
        };

        let mut clock = tokio::time::interval(self.interval);
        // A stalled loop must not catch up with a burst of dispatches.
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            max_in_flight = self.max_in_flight,
            table = %self.table,
            "starting submitter"
        );

        let mut dispatched = 0;
        loop {
            report_semaphore_utilization();
            clock.tick().await;

            let Some(batch) = batches.recv().await else {
                break;
            };

            if outcomes.is_closed() {
                return Err(LoaderError::ReconcilerClosed);
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| LoaderError::DispatchClosed)?;

            self.tracker.dispatched();
            dispatched += 1;
            spawn_dispatch_task(
                self.writer.clone(),
                self.table.clone(),
                batch,
                outcomes.clone(),
                permit,
            );
        }

        self.tracker.input_exhausted();
        info!(batches = dispatched, "all batches dispatched");

        Ok(dispatched)
    }
}

/// Spawn a Tokio task to write a batch to the store and report its outcome. The permit is held
/// until the outcome has been handed to the reconciler.
fn spawn_dispatch_task(
    writer: Arc<dyn BatchWriter>,
    table: Arc<str>,
    batch: Batch,
    outcomes: mpsc::Sender<BatchOutcome>,
    permit: sync::OwnedSemaphorePermit,
) -> tokio::task::JoinHandle<()> {
    metrics::counter!("loader_batches_dispatched_total").increment(1);

    tokio::spawn(async move {
        let sequence = batch.sequence();
        let outcome = dispatch_batch(writer.as_ref(), &table, batch).await;

        if outcomes.send(outcome).await.is_err() {
            error!(batch = sequence, "outcome of batch could not be reconciled");
        }
        drop(permit);
    })
}

/// Write one batch and classify the result. A failed call fails every record of the batch;
/// otherwise exactly the records left unprocessed by the store are failed.
pub async fn dispatch_batch(writer: &dyn BatchWriter, table: &str, batch: Batch) -> BatchOutcome {
    let now = tokio::time::Instant::now();
    let result = writer.write_batch(table, batch.records()).await;
    let elapsed = now.elapsed().as_secs_f64();

    let labels = [("table", table.to_owned())];
    metrics::histogram!("loader_batch_write_duration_seconds", &labels).record(elapsed);

    let outcome = match result {
        Ok(unprocessed) => BatchOutcome::with_unprocessed(batch, unprocessed),
        Err(error) => {
            error!(batch = batch.sequence(), %error, "Batch POST failed");
            BatchOutcome::failed(batch)
        }
    };

    if outcome.rejected_count() > 0 {
        warn!(
            batch = outcome.batch().sequence(),
            rejected = outcome.rejected_count(),
            status = outcome.status().as_str(),
            "store did not accept every record of the batch"
        );
    }

    let labels = [
        ("table", table.to_owned()),
        ("status", outcome.status().as_str().to_owned()),
    ];
    metrics::counter!("loader_batches_completed_total", &labels).increment(1);

    outcome
}
