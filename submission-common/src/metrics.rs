use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const HTTP_DURATION_METRIC: &str = "http_requests_duration_seconds";

const HTTP_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Prometheus builder with latency buckets for the HTTP duration histogram
/// and the given buckets for every other named histogram. Histograms not
/// named here are rendered as summaries.
pub fn recorder_builder(histograms: &[(&str, &[f64])]) -> Result<PrometheusBuilder, BuildError> {
    let mut builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(HTTP_DURATION_METRIC.to_owned()),
        HTTP_DURATION_BUCKETS,
    )?;

    for (name, buckets) in histograms {
        builder = builder.set_buckets_for_metric(Matcher::Full((*name).to_owned()), buckets)?;
    }

    Ok(builder)
}

/// Install the global Prometheus recorder. Fails if one is already installed.
pub fn setup_metrics_recorder(
    histograms: &[(&str, &[f64])],
) -> Result<PrometheusHandle, BuildError> {
    recorder_builder(histograms)?.install_recorder()
}

/// Count every request and record its duration, labelled by route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!(HTTP_DURATION_METRIC, &labels).record(start.elapsed().as_secs_f64());

    response
}
