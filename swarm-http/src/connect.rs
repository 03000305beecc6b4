use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::Uri;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::io::{IoTrace, TimedIo};

/// Phases observed while opening one connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectTrace {
    pub(crate) resolving: Duration,
    pub(crate) connecting: Duration,
    pub(crate) io: Option<Arc<Mutex<IoTrace>>>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    #[error("missing host in url")]
    MissingHost,

    #[error("{host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Connect(#[source] io::Error),

    #[error("tcp connect timed out after {0:?}")]
    Timeout(Duration),
}

/// TCP connector that times DNS resolution and connect separately.
///
/// Used as the inner connector of `hyper_rustls::HttpsConnector`, which adds the TLS
/// handshake on top for `https` URLs.
#[derive(Debug, Clone)]
pub(crate) struct TimedConnector {
    connect_timeout: Option<Duration>,
    trace: Arc<Mutex<ConnectTrace>>,
}

impl TimedConnector {
    pub(crate) fn new(connect_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            trace: Arc::default(),
        }
    }

    pub(crate) fn trace(&self) -> Arc<Mutex<ConnectTrace>> {
        self.trace.clone()
    }

    async fn connect(self, uri: Uri) -> Result<TimedIo, ConnectError> {
        let host = uri
            .host()
            .ok_or(ConnectError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        };
        let port = uri.port_u16().unwrap_or(default_port);

        let started = Instant::now();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| ConnectError::Dns {
                host: host.clone(),
                source,
            })?
            .collect();
        let resolved = Instant::now();
        self.trace.lock().resolving = resolved - started;

        if addrs.is_empty() {
            return Err(ConnectError::Dns {
                host,
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            let attempt = TcpStream::connect(addr);
            let res = match self.connect_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(res) => res,
                    Err(_) => {
                        last_err = Some(ConnectError::Timeout(timeout));
                        continue;
                    }
                },
                None => attempt.await,
            };

            match res {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {addr}: {err}");
                    }
                    let io = TimedIo::new(stream);
                    let mut trace = self.trace.lock();
                    trace.connecting = resolved.elapsed();
                    trace.io = Some(io.trace());
                    return Ok(io);
                }
                Err(err) => last_err = Some(ConnectError::Connect(err)),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ConnectError::Connect(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address could be connected",
            ))
        }))
    }
}

impl tower_service::Service<Uri> for TimedConnector {
    type Response = TimedIo;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<TimedIo, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tower_service::Service as _;

    #[tokio::test]
    async fn connect_records_phases_and_io_trace() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let mut connector = TimedConnector::new(Some(Duration::from_secs(1)));
        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let _io = connector.call(uri).await.unwrap();

        let trace = connector.trace();
        let trace = trace.lock();
        assert!(trace.io.is_some());
        assert!(trace.connecting > Duration::ZERO);
        drop(trace);

        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        // Bind then drop to get a port with no listener.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let mut connector = TimedConnector::new(Some(Duration::from_secs(1)));
        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let err = match connector.call(uri).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, ConnectError::Connect(_)));
    }
}
