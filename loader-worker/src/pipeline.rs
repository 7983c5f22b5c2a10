use std::sync::Arc;

use loader_common::batch::BatchAccumulator;
use loader_common::store::{BatchWriter, DryRunWriter};
use tokio::fs::File;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::PipelineSettings;
use crate::error::LoaderError;
use crate::ingest::{IngestSummary, Ingestor};
use crate::reconciler::{ReconcileSummary, Reconciler};
use crate::submitter::Submitter;
use crate::tracker::DispatchTracker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ingest: IngestSummary,
    pub dispatched: u64,
    pub reconciled: ReconcileSummary,
}

/// A fully set up load: the input and every output log are open, so nothing left to do can
/// fail for lack of a file.
pub struct Pipeline {
    settings: PipelineSettings,
    input: File,
    ingestor: Ingestor,
    submitter: Submitter,
    reconciler: Reconciler,
    tracker: Arc<DispatchTracker>,
}

impl Pipeline {
    /// Open the input and every output log. In a dry run `writer` is never called: batches go to
    /// a `DryRunWriter` instead.
    pub async fn open(
        settings: PipelineSettings,
        writer: Arc<dyn BatchWriter>,
    ) -> Result<Self, LoaderError> {
        let input = File::open(&settings.input_path)
            .await
            .map_err(|source| LoaderError::Open {
                path: settings.input_path.clone(),
                source,
            })?;

        let tracker = Arc::new(DispatchTracker::new());

        let ingestor = Ingestor::open(
            &settings.output_dir,
            settings.mapper.clone(),
            BatchAccumulator::new(settings.budget.batch_size()),
            settings.dry_run,
        )
        .await?;
        let reconciler =
            Reconciler::open(&settings.output_dir, settings.mapper.clone(), tracker.clone())
                .await?;
        let writer: Arc<dyn BatchWriter> = if settings.dry_run {
            Arc::new(DryRunWriter::new(settings.mapper.clone()))
        } else {
            writer
        };
        let submitter = Submitter::new(
            writer,
            &settings.table,
            &settings.budget,
            settings.max_in_flight,
            tracker.clone(),
        );

        Ok(Self {
            settings,
            input,
            ingestor,
            submitter,
            reconciler,
            tracker,
        })
    }

    /// Load the whole input, returning once every dispatched batch has been reconciled.
    pub async fn run(self) -> Result<RunSummary, LoaderError> {
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = mpsc::channel(self.settings.max_in_flight);

        let submitter = tokio::spawn(self.submitter.run(batch_rx, outcome_tx));
        let mut reconciler = tokio::spawn(self.reconciler.run(outcome_rx));

        info!(input = %self.settings.input_path.display(), "loading input");
        let ingested = self
            .ingestor
            .run(self.input, &self.settings.input_path, batch_tx)
            .await;

        // Batches already handed off are dispatched and reconciled even if reading failed.
        let dispatched = submitter.await?;

        let finished_early = tokio::select! {
            _ = self.tracker.wait_drained() => None,
            // Only finishes first when it failed, or when dispatching stopped early.
            result = &mut reconciler => Some(result),
        };
        let reconciled = match finished_early {
            Some(result) => result?,
            None => reconciler.await?,
        };

        // A failed reconciler stops the submitter, which in turn stops ingestion, so report the
        // errors starting from the end of the pipeline.
        let reconciled = reconciled?;
        let dispatched = dispatched?;
        let ingest = ingested?;

        Ok(RunSummary {
            ingest,
            dispatched,
            reconciled,
        })
    }
}
