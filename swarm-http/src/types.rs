use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{Error, HttpTransportErrorKind};

/// Per-phase durations of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Waiting for a usable connection (pool checkout, connection readiness).
    pub blocked: Duration,
    pub resolving: Duration,
    pub connecting: Duration,
    pub tls_handshaking: Duration,
    /// Request start to last byte written.
    pub sending: Duration,
    /// Last byte written to first byte read.
    pub waiting: Duration,
    /// First byte read to end of body.
    pub receiving: Duration,
}

impl Timings {
    /// Time on the wire for the exchange itself: `sending + waiting + receiving`.
    pub fn duration(&self) -> Duration {
        self.sending + self.waiting + self.receiving
    }

    /// Sum of every phase.
    pub fn total(&self) -> Duration {
        self.blocked + self.resolving + self.connecting + self.tls_handshaking + self.duration()
    }

    /// Adds the phases of an earlier exchange, e.g. a redirect hop.
    pub fn accumulate(&mut self, other: &Timings) {
        self.blocked += other.blocked;
        self.resolving += other.resolving;
        self.connecting += other.connecting;
        self.tls_handshaking += other.tls_handshaking;
        self.sending += other.sending;
        self.waiting += other.waiting;
        self.receiving += other.receiving;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub method: http::Method,
    /// Final URL, after any redirects.
    pub url: String,
    /// `0` when the request failed before a status line was received.
    pub status: u16,
    pub body: Bytes,
    /// Response headers (lowercased header names). Multiple values are joined with ", ".
    pub headers: Vec<(String, String)>,
    pub timings: Timings,
    /// Bytes written to the socket for this request, including TLS framing.
    pub bytes_sent: u64,
    /// Bytes read from the socket for this response, including TLS framing.
    pub bytes_received: u64,
    pub error: Option<String>,
    pub error_code: Option<HttpTransportErrorKind>,
    /// Redirects followed to reach this response. Timings and byte counts include every hop.
    pub redirects: u32,
}

impl HttpResponse {
    /// Response-shaped failure for a request that did not complete.
    ///
    /// The time spent before giving up counts as `waiting`, so it shows up in
    /// [`Timings::duration`] like the latency of a completed request.
    pub fn failed(method: http::Method, url: String, err: &Error, elapsed: Duration) -> Self {
        Self {
            method,
            url,
            status: 0,
            body: Bytes::new(),
            headers: Vec::new(),
            timings: Timings {
                waiting: elapsed,
                ..Timings::default()
            },
            bytes_sent: 0,
            bytes_received: 0,
            error: Some(err.to_string()),
            error_code: Some(err.transport_error_kind()),
            redirects: 0,
        }
    }

    pub fn body_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn json_value(&self) -> serde_json::Result<serde_json::Value> {
        self.json()
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Status in `200..=399` and no transport error.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..400).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: http::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(http::Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(http::Method::POST, url).with_body(body)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_excludes_connection_setup() {
        let t = Timings {
            blocked: Duration::from_millis(1),
            resolving: Duration::from_millis(2),
            connecting: Duration::from_millis(3),
            tls_handshaking: Duration::from_millis(4),
            sending: Duration::from_millis(5),
            waiting: Duration::from_millis(6),
            receiving: Duration::from_millis(7),
        };
        assert_eq!(t.duration(), Duration::from_millis(18));
        assert_eq!(t.total(), Duration::from_millis(28));
    }

    #[test]
    fn accumulate_adds_every_phase() {
        let hop = Timings {
            connecting: Duration::from_millis(2),
            waiting: Duration::from_millis(10),
            ..Timings::default()
        };
        let mut t = Timings {
            waiting: Duration::from_millis(5),
            receiving: Duration::from_millis(1),
            ..Timings::default()
        };
        t.accumulate(&hop);
        assert_eq!(t.connecting, Duration::from_millis(2));
        assert_eq!(t.duration(), Duration::from_millis(16));
    }

    #[test]
    fn failed_response_carries_error_code() {
        let err = Error::Timeout(Duration::from_millis(100));
        let res = HttpResponse::failed(
            http::Method::GET,
            "http://x/".to_string(),
            &err,
            Duration::from_millis(100),
        );
        assert_eq!(res.status, 0);
        assert!(!res.is_success());
        assert_eq!(res.error_code, Some(HttpTransportErrorKind::Timeout));
        assert!(res.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert_eq!(res.timings.total(), Duration::from_millis(100));
        assert_eq!(res.timings.duration(), Duration::from_millis(100));
    }

    #[test]
    fn header_lookup_and_json() {
        let res = HttpResponse {
            method: http::Method::GET,
            url: "http://x/".to_string(),
            status: 200,
            body: Bytes::from_static(br#"{"ok":true}"#),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            timings: Timings::default(),
            bytes_sent: 0,
            bytes_received: 0,
            error: None,
            error_code: None,
            redirects: 0,
        };
        assert!(res.is_success());
        assert_eq!(res.header("Content-Type"), Some("application/json"));
        let v = res.json_value().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(v["ok"], serde_json::Value::Bool(true));
    }
}
