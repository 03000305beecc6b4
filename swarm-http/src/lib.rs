//! Instrumented HTTP/1.1 transport.
//!
//! Every request reports how long it spent in each phase (pool checkout, DNS, TCP connect,
//! TLS handshake, sending, waiting, receiving) along with the bytes it moved on the socket.

#![forbid(unsafe_code)]

mod client;
mod connect;
mod error;
mod io;
mod types;
mod util;

pub use client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, HttpClient, HttpClientOptions};
pub use error::{Error, HttpTransportErrorKind, Result};
pub use types::{HttpRequest, HttpResponse, Timings};
