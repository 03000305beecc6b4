use std::time::Duration;

use bytes::Bytes;
use http::Method;
use swarm_http::{HttpRequest, HttpResponse};
use tokio::time::Instant;

use crate::vu::VuContext;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub headers: Vec<(String, String)>,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
    /// Extra sample tags. A `name` tag replaces the URL as the request's name.
    pub tags: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Groups dynamic URLs under one `name` tag.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        self.tag("name", name)
    }

    fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Instrumented HTTP calls for one VU.
///
/// Every call returns a response, even on transport failure (status `0` with `error` set),
/// and records the request metrics tagged with the VU's scenario and group.
#[derive(Debug, Clone, Copy)]
pub struct Http<'a> {
    ctx: &'a VuContext,
}

impl<'a> Http<'a> {
    pub(crate) fn new(ctx: &'a VuContext) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, url: &str, params: &Params) -> HttpResponse {
        self.request(Method::GET, url, Bytes::new(), params).await
    }

    pub async fn head(&self, url: &str, params: &Params) -> HttpResponse {
        self.request(Method::HEAD, url, Bytes::new(), params).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>, params: &Params) -> HttpResponse {
        self.request(Method::POST, url, body, params).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Bytes>, params: &Params) -> HttpResponse {
        self.request(Method::PUT, url, body, params).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<Bytes>, params: &Params) -> HttpResponse {
        self.request(Method::PATCH, url, body, params).await
    }

    pub async fn del(&self, url: &str, body: impl Into<Bytes>, params: &Params) -> HttpResponse {
        self.request(Method::DELETE, url, body, params).await
    }

    pub async fn options(&self, url: &str, body: impl Into<Bytes>, params: &Params) -> HttpResponse {
        self.request(Method::OPTIONS, url, body, params).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: impl Into<Bytes>,
        params: &Params,
    ) -> HttpResponse {
        let req = HttpRequest {
            method: method.clone(),
            url: url.to_string(),
            headers: params.headers.clone(),
            body: body.into(),
            timeout: params.timeout,
        };

        let started = Instant::now();
        let res = match self.ctx.client.request(req).await {
            Ok(res) => res,
            Err(err) => {
                log::debug!("VU {}: {method} {url} failed: {err}", self.ctx.id());
                HttpResponse::failed(method, url.to_string(), &err, started.elapsed())
            }
        };

        self.record(&res, params);
        res
    }

    fn record(&self, res: &HttpResponse, params: &Params) {
        let name = params.tag_value("name").unwrap_or(&res.url);
        let status = res.status.to_string();
        let expected = if res.is_success() { "true" } else { "false" };
        let error_code = res.error_code.map(|c| c.to_string());

        // User tags first so the request's own tags win.
        let mut tags: Vec<(&str, &str)> = params
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        tags.extend([
            ("name", name),
            ("method", res.method.as_str()),
            ("status", status.as_str()),
            ("expected_response", expected),
        ]);
        if let Some(code) = error_code.as_deref() {
            tags.push(("error_code", code));
        }

        let tags = self.ctx.tags(&tags);
        self.ctx
            .shared
            .builtin
            .request
            .record_request(&self.ctx.shared.registry, res, &tags);
    }
}
