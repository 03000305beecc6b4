use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use hyper_util::client::legacy::connect::{Connected, Connection};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 16 * 1024;

/// Socket-level byte counts and the write/read edges of the current exchange.
#[derive(Debug, Default)]
pub(crate) struct IoTrace {
    written: u64,
    read: u64,
    last_write: Option<Instant>,
    first_read: Option<Instant>,
}

impl IoTrace {
    /// Clears the exchange edges before a new request is sent.
    pub(crate) fn arm(&mut self) {
        self.last_write = None;
        self.first_read = None;
    }

    pub(crate) fn counts(&self) -> (u64, u64) {
        (self.written, self.read)
    }

    pub(crate) fn last_write(&self) -> Option<Instant> {
        self.last_write
    }

    pub(crate) fn first_read(&self) -> Option<Instant> {
        self.first_read
    }

    fn on_write(&mut self, n: usize) {
        self.written += n as u64;
        self.last_write = Some(Instant::now());
    }

    fn on_read(&mut self, n: usize) {
        self.read += n as u64;
        if self.first_read.is_none() {
            self.first_read = Some(Instant::now());
        }
    }
}

/// TCP stream that records traffic into a shared [`IoTrace`].
pub(crate) struct TimedIo {
    stream: TcpStream,
    trace: Arc<Mutex<IoTrace>>,
    scratch: Box<[u8]>,
}

impl TimedIo {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            trace: Arc::default(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    pub(crate) fn trace(&self) -> Arc<Mutex<IoTrace>> {
        self.trace.clone()
    }
}

impl std::fmt::Debug for TimedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedIo")
            .field("stream", &self.stream)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl hyper::rt::Read for TimedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = buf.remaining().min(this.scratch.len());
        let mut chunk = ReadBuf::new(&mut this.scratch[..n]);

        match Pin::new(&mut this.stream).poll_read(cx, &mut chunk) {
            Poll::Ready(Ok(())) => {
                let filled = chunk.filled();
                if !filled.is_empty() {
                    this.trace.lock().on_read(filled.len());
                }
                buf.put_slice(filled);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl hyper::rt::Write for TimedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.trace.lock().on_write(n);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Connection for TimedIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}
