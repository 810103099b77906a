//! Service-level-indicator observer.
//!
//! Records carrying `sla == true` plus the HTTP request fields update the
//! SLI metrics as a side effect; the records themselves flow on unchanged.

use std::sync::Arc;

use serde_json::Value;

use super::{
    LOG_KEY_HOST, LOG_KEY_REQUEST_METHOD, LOG_KEY_REQUEST_TIME, LOG_KEY_REQUEST_URI,
    LOG_KEY_SERVER_PROTOCOL, LOG_KEY_SLA, LOG_KEY_STATUS, LOG_KEY_UPSTREAM_POD_NAME,
    UPSTREAM_RESPONSE_TIME_TOTAL,
};
use crate::{
    entry::{EntryMap, EntryMapExt},
    k8s::ServicesProvider,
};

/// Metrics surface the observer writes to.
pub trait SliMetrics: Send + Sync {
    fn increment_http_request_count(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        status: i64,
    );
    fn increment_http_requests_total_count(&self, service: &str);
    fn observe_http_request_time(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        value: f64,
    );
    fn observe_http_upstream_response_time_total(
        &self,
        pod_name: &str,
        method: &str,
        service: &str,
        path: &str,
        protocol: &str,
        value: f64,
    );
}

/// Pass-through hook the SLI stage calls for every record.
pub trait SliObserver: Send + Sync {
    fn observe(&self, record: &EntryMap);
}

/// An SLI-bearing record extracted from a parsed entry.
#[derive(Debug, PartialEq)]
pub struct SliMessage {
    pub host: String,
    pub pod_name: String,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub status: i64,
    pub request_time: f64,
    pub upstream_response_time_total: Option<f64>,
}

impl SliMessage {
    /// Extracts an SLI message, requiring the `sla` flag, non-empty request
    /// strings, and numeric-coercible `status` and `request_time`.
    pub fn from_record(record: &EntryMap) -> Option<Self> {
        if !record
            .get(LOG_KEY_SLA)
            .and_then(Value::as_bool)
            .unwrap_or_default()
        {
            return None;
        }

        let host = record.str_field(LOG_KEY_HOST);
        let method = record.str_field(LOG_KEY_REQUEST_METHOD);
        let uri = record.str_field(LOG_KEY_REQUEST_URI);
        let protocol = record.str_field(LOG_KEY_SERVER_PROTOCOL);

        if host.is_empty() || method.is_empty() || uri.is_empty() || protocol.is_empty() {
            return None;
        }

        let request_time = coerce_f64(record.get(LOG_KEY_REQUEST_TIME)?)?;
        let status = coerce_i64(record.get(LOG_KEY_STATUS)?)?;

        Some(Self {
            host: host.to_string(),
            pod_name: record.str_field(LOG_KEY_UPSTREAM_POD_NAME).to_string(),
            method: method.to_string(),
            uri: uri.to_string(),
            protocol: protocol.to_string(),
            status,
            request_time,
            upstream_response_time_total: record
                .get(UPSTREAM_RESPONSE_TIME_TOTAL)
                .and_then(Value::as_f64),
        })
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// Observer backed by the services provider and the metrics collector.
pub struct SliParser {
    services: Arc<dyn ServicesProvider>,
    metrics: Arc<dyn SliMetrics>,
}

impl SliParser {
    pub fn new(services: Arc<dyn ServicesProvider>, metrics: Arc<dyn SliMetrics>) -> Self {
        Self { services, metrics }
    }
}

impl SliObserver for SliParser {
    fn observe(&self, record: &EntryMap) {
        let Some(message) = SliMessage::from_record(record) else {
            return;
        };

        let Some(service) = self.services.service_by_host(&message.host) else {
            return;
        };

        self.metrics.increment_http_requests_total_count(&service.name);

        let Some(path_label) = service.label_by_path(&message.uri) else {
            return;
        };

        self.metrics.increment_http_request_count(
            &message.pod_name,
            &message.method,
            &service.name,
            path_label,
            &message.protocol,
            message.status,
        );
        self.metrics.observe_http_request_time(
            &message.pod_name,
            &message.method,
            &service.name,
            path_label,
            &message.protocol,
            message.request_time,
        );

        let Some(upstream_total) = message.upstream_response_time_total else {
            return;
        };

        self.metrics.observe_http_upstream_response_time_total(
            &message.pod_name,
            &message.method,
            &service.name,
            path_label,
            &message.protocol,
            upstream_total,
        );
    }
}

/// Observer used when the SLI exporter is disabled.
pub struct SliStub;

impl SliObserver for SliStub {
    fn observe(&self, _record: &EntryMap) {}
}
