//! Load a delimited file into a DynamoDB table, paced to a fixed write budget.
use std::path::PathBuf;
use std::sync::Arc;

use envconfig::Envconfig;
use loader_common::metrics::{serve, setup_metrics_router};
use loader_common::store::{BatchWriter, DryRunWriter, DynamoBatchWriter};
use loader_worker::config::Config;
use loader_worker::error::LoaderError;
use loader_worker::pipeline::Pipeline;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), LoaderError> {
    setup_tracing();

    let config = Config::init_from_env()?;
    let settings = config.pipeline_settings(std::env::args_os().nth(1).map(PathBuf::from))?;

    if settings.dry_run {
        info!(?settings, "dry run, nothing will be written to the table");
    }

    if config.export_prometheus {
        let router = setup_metrics_router().map_err(|e| LoaderError::Metrics(e.to_string()))?;
        let bind = config.bind();
        tokio::task::spawn(async move {
            if let Err(e) = serve(router, &bind).await {
                error!("failed to serve metrics on {}: {}", bind, e);
            }
        });
    }

    let writer: Arc<dyn BatchWriter> = if settings.dry_run {
        Arc::new(DryRunWriter::new(settings.mapper.clone()))
    } else {
        let store = config.store_settings();
        Arc::new(DynamoBatchWriter::from_settings(&store, settings.mapper.clone()).await)
    };

    let summary = Pipeline::open(settings, writer).await?.run().await?;

    info!(
        lines_read = summary.ingest.lines_read,
        malformed = summary.ingest.malformed,
        batches = summary.dispatched,
        attempted = summary.reconciled.attempted,
        failed = summary.reconciled.failed,
        partially_failed_batches = summary.reconciled.partially_failed_batches,
        fully_failed_batches = summary.reconciled.fully_failed_batches,
        "load finished"
    );

    Ok(())
}
