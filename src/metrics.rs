//! Prometheus metrics collector and HTTP exposition.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

use crate::{dispatcher::FollowerMetrics, parsers::SliMetrics, retrieve::Retrieve};

#[derive(Debug, Snafu)]
pub enum MetricsError {
    #[snafu(display("invalid histogram bucket '{value}'"))]
    BadBucket { value: String },

    #[snafu(display("unable to build metric '{name}': {source}"))]
    Build {
        name: String,
        source: prometheus::Error,
    },
}

/// Holds every metric series the shipper maintains. Shared freely across
/// tasks; the underlying vectors are thread-safe.
pub struct Collector {
    registry: Registry,

    http_request_count: IntCounterVec,
    http_request_total_count: IntCounterVec,
    http_request_time: HistogramVec,
    http_upstream_response_time_total: HistogramVec,
    log_message_count: IntCounterVec,
    throttling_delay: CounterVec,
}

const SLI_LABELS: &[&str] = &[
    "method",
    "service",
    "path",
    "protocol",
    "upstream_pod_name",
];
const CONTAINER_LABELS: &[&str] = &["namespace", "pod", "container"];

impl Collector {
    /// Builds the collector with histogram buckets parsed from the
    /// space-delimited `buckets` string.
    pub fn new(buckets: &str) -> Result<Self, MetricsError> {
        let buckets = parse_buckets(buckets)?;
        let registry = Registry::new();

        let http_request_count = IntCounterVec::new(
            Opts::new("http_request_count", "Count requests"),
            &[
                "method",
                "service",
                "path",
                "status",
                "protocol",
                "upstream_pod_name",
            ],
        )
        .context(BuildSnafu {
            name: "http_request_count",
        })?;

        let http_request_total_count = IntCounterVec::new(
            Opts::new(
                "http_request_total_count",
                "The total number of requests processed",
            ),
            &["service"],
        )
        .context(BuildSnafu {
            name: "http_request_total_count",
        })?;

        let http_request_time = HistogramVec::new(
            HistogramOpts::new("http_request_time", "Histogram for HTTP requests time")
                .buckets(buckets.clone()),
            SLI_LABELS,
        )
        .context(BuildSnafu {
            name: "http_request_time",
        })?;

        let http_upstream_response_time_total = HistogramVec::new(
            HistogramOpts::new(
                "http_upstream_response_time_total",
                "Histogram for HTTP upstream response time, all the upstreams",
            )
            .buckets(buckets),
            SLI_LABELS,
        )
        .context(BuildSnafu {
            name: "http_upstream_response_time_total",
        })?;

        let log_message_count = IntCounterVec::new(
            Opts::new(
                "log_message_count",
                "Store all processed log messages per one container",
            ),
            CONTAINER_LABELS,
        )
        .context(BuildSnafu {
            name: "log_message_count",
        })?;

        let throttling_delay = CounterVec::new(
            Opts::new(
                "container_throttling_delay_seconds_total",
                "Indicates particular container's total throttle time",
            ),
            CONTAINER_LABELS,
        )
        .context(BuildSnafu {
            name: "container_throttling_delay_seconds_total",
        })?;

        for collector in [
            Box::new(http_request_count.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_request_total_count.clone()),
            Box::new(http_request_time.clone()),
            Box::new(http_upstream_response_time_total.clone()),
            Box::new(log_message_count.clone()),
            Box::new(throttling_delay.clone()),
        ] {
            registry.register(collector).context(BuildSnafu {
                name: "registry",
            })?;
        }

        Ok(Self {
            registry,
            http_request_count,
            http_request_total_count,
            http_request_time,
            http_upstream_response_time_total,
            log_message_count,
            throttling_delay,
        })
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl FollowerMetrics for Collector {
    fn increment_log_message_count(&self, namespace: &str, pod: &str, container: &str) {
        self.log_message_count
            .with_label_values(&[namespace, pod, container])
            .inc();
    }

    fn increment_throttling_delay(&self, namespace: &str, pod: &str, container: &str, value: f64) {
        self.throttling_delay
            .with_label_values(&[namespace, pod, container])
            .inc_by(value);
    }

    fn delete_throttling_delay(&self, namespace: &str, pod: &str, container: &str) -> bool {
        self.throttling_delay
            .remove_label_values(&[namespace, pod, container])
            .is_ok()
    }
}

impl SliMetrics for Collector {
    fn increment_http_request_count(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        status: i64,
    ) {
        self.http_request_count
            .with_label_values(&[
                method,
                service,
                path,
                &status.to_string(),
                protocol,
                pod_name,
            ])
            .inc();
    }

    fn increment_http_requests_total_count(&self, service: &str) {
        self.http_request_total_count
            .with_label_values(&[service])
            .inc();
    }

    fn observe_http_request_time(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        value: f64,
    ) {
        self.http_request_time
            .with_label_values(&[method, service, path, protocol, pod_name])
            .observe(value);
    }

    fn observe_http_upstream_response_time_total(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        value: f64,
    ) {
        self.http_upstream_response_time_total
            .with_label_values(&[method, service, path, protocol, pod_name])
            .observe(value);
    }
}

#[async_trait]
impl Retrieve for Collector {
    /// Periodic wholesale reset, bounding series cardinality on long-lived
    /// nodes.
    async fn retrieve(&self) -> anyhow::Result<()> {
        self.http_request_count.reset();
        self.http_request_total_count.reset();
        self.http_request_time.reset();
        self.http_upstream_response_time_total.reset();
        self.log_message_count.reset();
        self.throttling_delay.reset();
        Ok(())
    }
}

fn parse_buckets(buckets: &str) -> Result<Vec<f64>, MetricsError> {
    buckets
        .split_whitespace()
        .map(|value| {
            value.parse().ok().context(BadBucketSnafu { value })
        })
        .collect()
}

/// Serves `GET /metrics` and `GET /healthcheck` until the token cancels.
pub async fn serve(addr: SocketAddr, collector: Arc<Collector>, token: CancellationToken) {
    info!(message = "Serving metrics.", %addr);

    let metrics = warp::path("metrics").and(warp::get()).map(move || {
        warp::reply::with_header(
            collector.render(),
            "content-type",
            "text/plain; version=0.0.4",
        )
    });
    let healthcheck = warp::path("healthcheck")
        .and(warp::get())
        .map(|| "Ok");

    let (_addr, server) = warp::serve(metrics.or(healthcheck))
        .bind_with_graceful_shutdown(addr, async move { token.cancelled().await });

    server.await;
}
