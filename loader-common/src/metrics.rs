use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_router`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router for a metrics endpoint, installing the global Prometheus recorder.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Store round trips are usually in the tens of milliseconds.
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}
