use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::{any, get};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

pub const PATH_HELLO: &str = "/hello";
pub const PATH_ECHO: &str = "/echo";
pub const PATH_SLOW: &str = "/slow";
pub const PATH_STATUS: &str = "/status";
pub const PATH_JSON: &str = "/json";
pub const PATH_QP: &str = "/qp";
pub const PATH_CLOSE: &str = "/close";
pub const PATH_REDIRECT: &str = "/redirect";

const DEFAULT_SLOW_MS: u64 = 50;

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    requests_total: Arc<AtomicU64>,
    saw_test_header: Arc<AtomicU64>,
    saw_json_content_type: Arc<AtomicU64>,
}

impl TestServerStats {
    fn inc_requests_total(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_headers(&self, headers: &HeaderMap) {
        if headers.get("x-test").and_then(|v| v.to_str().ok()) == Some("1") {
            self.saw_test_header.fetch_add(1, Ordering::Relaxed);
        }
        if headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().starts_with("application/json"))
        {
            self.saw_json_content_type.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn saw_test_header(&self) -> u64 {
        self.saw_test_header.load(Ordering::Relaxed)
    }

    pub fn saw_json_content_type(&self) -> u64 {
        self.saw_json_content_type.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct TestServerUrls {
    pub base_url: String,
    pub hello: String,
    pub echo: String,
    pub slow: String,
    pub json: String,
    pub qp: String,
    pub close: String,
}

impl TestServerUrls {
    pub fn new(base_url: String) -> Self {
        Self {
            hello: format!("{base_url}{PATH_HELLO}"),
            echo: format!("{base_url}{PATH_ECHO}"),
            slow: format!("{base_url}{PATH_SLOW}"),
            json: format!("{base_url}{PATH_JSON}"),
            qp: format!("{base_url}{PATH_QP}"),
            close: format!("{base_url}{PATH_CLOSE}"),
            base_url,
        }
    }

    /// `/slow?ms=<ms>`
    pub fn slow_ms(&self, ms: u64) -> String {
        format!("{}?ms={ms}", self.slow)
    }

    /// `/status/<code>`
    pub fn status(&self, code: u16) -> String {
        format!("{}{PATH_STATUS}/{code}", self.base_url)
    }

    /// `/redirect/<hops>`: `hops` 302 redirects ending at `/hello`.
    pub fn redirect(&self, hops: u32) -> String {
        format!("{}{PATH_REDIRECT}/{hops}", self.base_url)
    }

    /// `/redirect/<hops>?code=<code>&to=<path>`
    pub fn redirect_to(&self, hops: u32, code: u16, to: &str) -> String {
        format!("{}{PATH_REDIRECT}/{hops}?code={code}&to={to}", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    code: Option<u16>,
    to: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonBody {
    ok: bool,
    items: Vec<u32>,
    user: JsonUser,
}

#[derive(Debug, Serialize)]
struct JsonUser {
    id: u64,
    name: &'static str,
}

pub struct TestServer {
    addr: SocketAddr,
    base_url: String,
    urls: TestServerUrls,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

async fn handle_hello(State(stats): State<TestServerStats>) -> &'static str {
    stats.inc_requests_total();
    "Hello World!"
}

async fn handle_slow(
    State(stats): State<TestServerStats>,
    Query(params): Query<SlowParams>,
) -> &'static str {
    stats.inc_requests_total();
    sleep(Duration::from_millis(params.ms.unwrap_or(DEFAULT_SLOW_MS))).await;
    "slow"
}

async fn handle_echo(
    State(stats): State<TestServerStats>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    stats.inc_requests_total();
    stats.observe_headers(&headers);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        AppendHeaders([(header::SET_COOKIE, "a=1"), (header::SET_COOKIE, "b=2")]),
        body,
    )
}

async fn handle_status(
    State(stats): State<TestServerStats>,
    Path(code): Path<u16>,
) -> StatusCode {
    stats.inc_requests_total();
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn handle_json(State(stats): State<TestServerStats>) -> impl IntoResponse {
    stats.inc_requests_total();
    axum::Json(JsonBody {
        ok: true,
        items: vec![1, 2, 3],
        user: JsonUser {
            id: 42,
            name: "swarm",
        },
    })
}

async fn handle_qp(
    State(stats): State<TestServerStats>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    stats.inc_requests_total();

    if query.get("foo").map(String::as_str) == Some("bar") {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn handle_close(State(stats): State<TestServerStats>) -> impl IntoResponse {
    stats.inc_requests_total();
    ([(header::CONNECTION, "close")], "bye")
}

async fn handle_redirect(
    State(stats): State<TestServerStats>,
    Path(hops): Path<u32>,
    Query(params): Query<RedirectParams>,
) -> impl IntoResponse {
    stats.inc_requests_total();

    let code = params
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .filter(StatusCode::is_redirection)
        .unwrap_or(StatusCode::FOUND);
    let to = params.to.unwrap_or_else(|| PATH_HELLO.to_string());
    // Relative locations, so clients have to resolve them against the request URL.
    let location = if hops <= 1 {
        to
    } else {
        format!("{PATH_REDIRECT}/{}?code={}&to={to}", hops - 1, code.as_u16())
    };
    (code, [(header::LOCATION, location)])
}

pub fn router(stats: TestServerStats) -> Router {
    Router::new()
        .route(PATH_HELLO, get(handle_hello))
        .route(PATH_SLOW, get(handle_slow))
        .route(PATH_ECHO, any(handle_echo))
        .route("/status/{code}", any(handle_status))
        .route(PATH_JSON, get(handle_json))
        .route(PATH_QP, get(handle_qp))
        .route(PATH_CLOSE, get(handle_close))
        .route("/redirect/{hops}", any(handle_redirect))
        .with_state(stats)
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stats = TestServerStats::default();

        let app = router(stats.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        let base_url = format!("http://{addr}");
        let urls = TestServerUrls::new(base_url.clone());

        Ok(Self {
            addr,
            base_url,
            urls,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn urls(&self) -> &TestServerUrls {
        &self.urls
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
