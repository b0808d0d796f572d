//! The transport contract consumed by the engine.
//!
//! A transport performs the actual byte transfer. The engine configures it (headers, timeout),
//! starts it once the request is admitted and then samples it on every tick. Transports are
//! polled: they never call back into the engine.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transport is asked to transfer.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub target: String,
    pub method: Method,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
}

/// A single byte transfer, sampled by the engine once per tick.
///
/// Contract:
/// - Every chunk of the response is queued for [`poll_chunk`](Transport::poll_chunk) before
///   [`is_done`](Transport::is_done) first reports `true`. The engine samples `is_done` before
///   draining chunks, so no byte is lost between the two calls.
/// - Progress values are fractions in `[0, 1]`.
/// - [`error`](Transport::error) is `None` on success, including for an empty body.
pub trait Transport: Send {
    fn set_header(&mut self, name: &str, value: &str);

    fn set_timeout(&mut self, timeout: Duration);

    /// Begin the transfer. Called once, right after admission.
    fn start(&mut self);

    fn upload_progress(&self) -> f32;

    fn download_progress(&self) -> f32;

    /// Expected response length, once known.
    fn content_length(&self) -> Option<u64>;

    /// Bytes that arrived since the previous call.
    fn poll_chunk(&mut self) -> Option<Bytes>;

    fn is_done(&self) -> bool;

    fn response_code(&self) -> i64;

    fn error(&self) -> Option<String>;

    /// Stop the transfer and release its resources. Must be idempotent.
    fn abort(&mut self);
}

/// Creates transports for requests.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, request: &TransportRequest) -> Box<dyn Transport>;
}
