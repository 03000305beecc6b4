use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::Request;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_rustls::{ConfigBuilderExt as _, HttpsConnectorBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tower_service::Service as _;

use super::connect::{ConnectError, TimedConnector};
use super::io::IoTrace;
use super::util::{has_header, host_header_value, merge_headers, origin_form};
use super::{Error, HttpRequest, HttpResponse, Result, Timings};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;
const MAX_IDLE_PER_HOST: usize = 16;

static USER_AGENT: &str = concat!("swarm/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Applies to each TCP connect attempt.
    pub connect_timeout: Option<Duration>,
    /// Applies to a whole request, redirects included, when [`HttpRequest::timeout`] is unset.
    pub request_timeout: Duration,
    /// Redirects followed per request. `0` returns 3xx responses as they are.
    pub max_redirects: u32,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    https: bool,
    host: String,
    port: u16,
}

struct PooledConn {
    sender: SendRequest<Full<Bytes>>,
    io: Arc<Mutex<IoTrace>>,
}

struct Checkout {
    conn: PooledConn,
    reused: bool,
    resolving: Duration,
    connecting: Duration,
    tls_handshaking: Duration,
}

struct Inner {
    options: HttpClientOptions,
    tls: rustls::ClientConfig,
    idle: Mutex<HashMap<PoolKey, Vec<PooledConn>>>,
}

/// HTTP/1.1 client with per-phase timings.
///
/// Each client owns its keep-alive pool, so connections are never shared between clients.
/// Give every virtual user its own client.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

fn tls_config() -> Result<rustls::ClientConfig> {
    static CONFIG: OnceLock<rustls::ClientConfig> = OnceLock::new();
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg.clone());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_webpki_roots()
        .with_no_client_auth();
    Ok(CONFIG.get_or_init(|| cfg).clone())
}

impl HttpClient {
    pub fn new(options: HttpClientOptions) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                options,
                tls: tls_config()?,
                idle: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> HttpClientOptions {
        self.inner.options
    }

    /// Number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().values().map(Vec::len).sum()
    }

    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse> {
        let timeout = req.timeout.unwrap_or(self.inner.options.request_timeout);
        match tokio::time::timeout(timeout, self.follow(req)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    /// Runs the exchange, following redirects up to `max_redirects` hops.
    async fn follow(&self, mut req: HttpRequest) -> Result<HttpResponse> {
        let max = self.inner.options.max_redirects;
        let mut hops = 0;
        let mut earlier = Timings::default();
        let (mut sent, mut received) = (0, 0);

        loop {
            let mut res = self.exchange(req.clone()).await?;

            let next = if hops < max && is_redirect(res.status) {
                res.header("location")
                    .and_then(|location| redirect_target(&res.url, location))
            } else {
                None
            };
            let Some(next) = next else {
                res.timings.accumulate(&earlier);
                res.bytes_sent += sent;
                res.bytes_received += received;
                res.redirects = hops;
                return Ok(res);
            };

            log::debug!("{} {} redirected ({}) to {next}", res.method, res.url, res.status);
            hops += 1;
            earlier.accumulate(&res.timings);
            sent += res.bytes_sent;
            received += res.bytes_received;
            req = redirected(req, res.status, next);
        }
    }

    async fn exchange(&self, req: HttpRequest) -> Result<HttpResponse> {
        let started = Instant::now();

        let parsed = url::Url::parse(&req.url).map_err(|_| Error::InvalidUrl(req.url.clone()))?;
        let https = match parsed.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(Error::UnsupportedScheme(req.url)),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(req.url.clone()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(req.url.clone()))?;

        let mut builder = Request::builder()
            .method(req.method.clone())
            .uri(origin_form(&parsed));

        if !has_header(&req.headers, "host")
            && let Some(host) = host_header_value(&parsed)
        {
            builder = builder.header(http::header::HOST, host);
        }
        if !has_header(&req.headers, "user-agent") {
            builder = builder.header(http::header::USER_AGENT, USER_AGENT);
        }
        if !req.body.is_empty() && !has_header(&req.headers, "content-length") {
            builder = builder.header(http::header::CONTENT_LENGTH, req.body.len());
        }

        for (k, v) in &req.headers {
            let name = http::header::HeaderName::from_bytes(k.as_bytes())?;
            let value = http::header::HeaderValue::from_str(v)?;
            builder = builder.header(name, value);
        }

        let request: Request<Full<Bytes>> = builder.body(Full::new(req.body))?;

        let key = PoolKey { https, host, port };
        let Checkout {
            mut conn,
            reused,
            resolving,
            connecting,
            tls_handshaking,
        } = self.checkout(&key).await?;

        let connected = Instant::now();
        let setup = resolving + connecting + tls_handshaking;
        let blocked = connected.saturating_duration_since(started).saturating_sub(setup);

        // Fresh connections report their handshake bytes with the first request.
        let (w0, r0) = {
            let mut io = conn.io.lock();
            io.arm();
            if reused { io.counts() } else { (0, 0) }
        };

        let send_start = Instant::now();
        let res = conn
            .sender
            .send_request(request)
            .await
            .map_err(Error::Request)?;
        let head_at = Instant::now();

        let (parts, body) = res.into_parts();
        let body = body.collect().await.map_err(Error::BodyRead)?.to_bytes();
        let done = Instant::now();

        let (last_write, first_read, (w1, r1)) = {
            let io = conn.io.lock();
            (io.last_write(), io.first_read(), io.counts())
        };
        let last_write = last_write.unwrap_or(send_start).max(send_start);
        let first_read = first_read.unwrap_or(head_at).max(last_write);

        let timings = Timings {
            blocked,
            resolving,
            connecting,
            tls_handshaking,
            sending: last_write - send_start,
            waiting: first_read - last_write,
            receiving: done.saturating_duration_since(first_read),
        };

        self.checkin(key, conn);

        Ok(HttpResponse {
            method: req.method,
            url: req.url,
            status: parts.status.as_u16(),
            body,
            headers: merge_headers(&parts.headers),
            timings,
            bytes_sent: w1.saturating_sub(w0),
            bytes_received: r1.saturating_sub(r0),
            error: None,
            error_code: None,
            redirects: 0,
        })
    }

    async fn checkout(&self, key: &PoolKey) -> Result<Checkout> {
        loop {
            let candidate = {
                let mut idle = self.inner.idle.lock();
                idle.get_mut(key).and_then(Vec::pop)
            };
            let Some(mut conn) = candidate else {
                break;
            };
            if conn.sender.is_closed() {
                continue;
            }
            if conn.sender.ready().await.is_ok() {
                return Ok(Checkout {
                    conn,
                    reused: true,
                    resolving: Duration::ZERO,
                    connecting: Duration::ZERO,
                    tls_handshaking: Duration::ZERO,
                });
            }
        }

        self.connect(key).await
    }

    fn checkin(&self, key: PoolKey, conn: PooledConn) {
        if conn.sender.is_closed() {
            return;
        }
        let mut idle = self.inner.idle.lock();
        let conns = idle.entry(key).or_default();
        if conns.len() < MAX_IDLE_PER_HOST {
            conns.push(conn);
        }
    }

    async fn connect(&self, key: &PoolKey) -> Result<Checkout> {
        let scheme = if key.https { "https" } else { "http" };
        let uri: http::Uri = format!("{scheme}://{}:{}", key.host, key.port)
            .parse()
            .map_err(|_| Error::InvalidUrl(key.host.clone()))?;

        let timed = TimedConnector::new(self.inner.options.connect_timeout);
        let trace = timed.trace();
        let mut connector = HttpsConnectorBuilder::new()
            .with_tls_config(self.inner.tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(timed);

        let started = Instant::now();
        let stream = connector
            .call(uri)
            .await
            .map_err(|err| map_connect_error(err, &key.host))?;
        let elapsed = started.elapsed();

        let (resolving, connecting, io) = {
            let mut trace = trace.lock();
            (trace.resolving, trace.connecting, trace.io.take())
        };
        let io = io.ok_or_else(|| Error::Connect("connection trace missing".to_string()))?;
        let tls_handshaking = if key.https {
            elapsed.saturating_sub(resolving + connecting)
        } else {
            Duration::ZERO
        };

        let (mut sender, conn) = http1::handshake::<_, Full<Bytes>>(stream)
            .await
            .map_err(Error::Request)?;
        let host = key.host.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("http connection to {host} closed with error: {err}");
            }
        });
        sender.ready().await.map_err(Error::Request)?;

        Ok(Checkout {
            conn: PooledConn { sender, io },
            reused: false,
            resolving,
            connecting,
            tls_handshaking,
        })
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Resolves `location` against `from`. Refuses non-HTTP targets and HTTPS to HTTP downgrades.
fn redirect_target(from: &str, location: &str) -> Option<String> {
    let from = url::Url::parse(from).ok()?;
    let to = from.join(location).ok()?;
    match (from.scheme(), to.scheme()) {
        ("https", "http") => None,
        (_, "http" | "https") => Some(to.into()),
        _ => None,
    }
}

/// The request for the next hop. 303, and 301/302 after a POST, switch to a body-less GET.
fn redirected(mut req: HttpRequest, status: u16, url: String) -> HttpRequest {
    let to_get = match status {
        303 => req.method != http::Method::HEAD,
        301 | 302 => req.method == http::Method::POST,
        _ => false,
    };
    if to_get {
        req.method = http::Method::GET;
        req.body = Bytes::new();
        req.headers.retain(|(k, _)| {
            !k.eq_ignore_ascii_case("content-type") && !k.eq_ignore_ascii_case("content-length")
        });
    }
    req.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("host"));
    req.url = url;
    req
}

fn map_connect_error(err: Box<dyn std::error::Error + Send + Sync>, host: &str) -> Error {
    match err.downcast::<ConnectError>() {
        Ok(err) => match *err {
            ConnectError::MissingHost => Error::InvalidUrl(host.to_string()),
            ConnectError::Dns { host, source } => Error::Dns {
                host,
                message: source.to_string(),
            },
            err @ (ConnectError::Connect(_) | ConnectError::Timeout(_)) => {
                Error::Connect(err.to_string())
            }
        },
        Err(other) => Error::Tls(other.to_string()),
    }
}
