use std::time::Duration;

use swarm_http::HttpResponse;
use swarm_metrics::{MetricId, MetricKind, Registry, TagSet};

use crate::Result;

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_BLOCKED: &str = "http_req_blocked";
pub const HTTP_REQ_CONNECTING: &str = "http_req_connecting";
pub const HTTP_REQ_TLS_HANDSHAKING: &str = "http_req_tls_handshaking";
pub const HTTP_REQ_SENDING: &str = "http_req_sending";
pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";

#[derive(Debug, Clone, Copy)]
pub struct RequestMetricIds {
    pub reqs: MetricId,
    /// `sending + waiting + receiving`, in milliseconds.
    pub duration: MetricId,
    pub blocked: MetricId,
    pub connecting: MetricId,
    pub tls_handshaking: MetricId,
    pub sending: MetricId,
    pub waiting: MetricId,
    pub receiving: MetricId,
    pub failed: MetricId,
    pub data_sent: MetricId,
    pub data_received: MetricId,
}

impl RequestMetricIds {
    pub fn register(metrics: &Registry) -> Result<Self> {
        Ok(Self {
            reqs: metrics.register(HTTP_REQS, MetricKind::Counter)?,
            duration: metrics.register(HTTP_REQ_DURATION, MetricKind::Trend)?,
            blocked: metrics.register(HTTP_REQ_BLOCKED, MetricKind::Trend)?,
            connecting: metrics.register(HTTP_REQ_CONNECTING, MetricKind::Trend)?,
            tls_handshaking: metrics.register(HTTP_REQ_TLS_HANDSHAKING, MetricKind::Trend)?,
            sending: metrics.register(HTTP_REQ_SENDING, MetricKind::Trend)?,
            waiting: metrics.register(HTTP_REQ_WAITING, MetricKind::Trend)?,
            receiving: metrics.register(HTTP_REQ_RECEIVING, MetricKind::Trend)?,
            failed: metrics.register(HTTP_REQ_FAILED, MetricKind::Rate)?,
            data_sent: metrics.register(DATA_SENT, MetricKind::Counter)?,
            data_received: metrics.register(DATA_RECEIVED, MetricKind::Counter)?,
        })
    }

    /// Emits the full per-request sample set under one tag set.
    pub fn record_request(&self, metrics: &Registry, res: &HttpResponse, tags: &TagSet) {
        let add = |id: MetricId, value: f64| {
            if let Some(h) = metrics.handle(id, tags.clone()) {
                h.add(value);
            }
        };

        let t = &res.timings;
        add(self.reqs, 1.0);
        add(self.duration, millis(t.duration()));
        add(self.blocked, millis(t.blocked));
        add(self.connecting, millis(t.connecting));
        add(self.tls_handshaking, millis(t.tls_handshaking));
        add(self.sending, millis(t.sending));
        add(self.waiting, millis(t.waiting));
        add(self.receiving, millis(t.receiving));
        add(self.failed, if res.is_success() { 0.0 } else { 1.0 });
        add(self.data_sent, res.bytes_sent as f64);
        add(self.data_received, res.bytes_received as f64);
    }
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
