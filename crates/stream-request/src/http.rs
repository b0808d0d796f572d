//! `reqwest`-backed transport.
//!
//! Each [`HttpTransport`] runs its transfer on a tokio task and exposes the results through a
//! small shared state the engine samples on every tick.
//!
//! Notes:
//! - Non-success statuses are reported as errors (`HTTP 404 Not Found`), but the body is still
//!   collected so the engine can annotate the error with it.
//! - Local targets (plain paths and `file://` URLs) are read from disk with the same chunked
//!   contract, so downloads and probes work uniformly for both.
//! - Virtual targets need a platform-specific transport and fail here.
//! - Upload progress is binary: `1.0` once the request was sent.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::target::Target;
use crate::transport::{Method, Transport, TransportFactory, TransportRequest};

const FILE_READ_CHUNK: usize = 64 * 1024;

/// Creates [`HttpTransport`]s sharing one `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: Client,
    runtime: Option<Handle>,
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransportFactory {
    /// Uses a default client and the current tokio runtime, if any.
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            runtime: Handle::try_current().ok(),
        }
    }

    /// Run transfers on `runtime` instead of the runtime current at construction.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, request: &TransportRequest) -> Box<dyn Transport> {
        Box::new(HttpTransport {
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            request: request.clone(),
            headers: HeaderMap::new(),
            timeout: None,
            state: Arc::new(Mutex::new(TransferState::default())),
            cancel: CancellationToken::new(),
            task: None,
        })
    }
}

#[derive(Debug, Default)]
struct TransferState {
    chunks: VecDeque<Bytes>,
    received: u64,
    content_length: Option<u64>,
    status: i64,
    error: Option<String>,
    sent: bool,
    done: bool,
}

impl TransferState {
    fn push(&mut self, chunk: Bytes) {
        self.received += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
        self.done = true;
    }
}

/// One transfer driven by a tokio task.
pub struct HttpTransport {
    client: Client,
    runtime: Option<Handle>,
    request: TransportRequest,
    headers: HeaderMap,
    timeout: Option<Duration>,
    state: Arc<Mutex<TransferState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HttpTransport {
    fn build(&self, url: reqwest::Url) -> RequestBuilder {
        let method = match self.request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, url)
            .headers(self.headers.clone());
        if let Some(content_type) = &self.request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        if let Some(body) = self.request.body.clone() {
            builder = builder.body(body);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn set_header(&mut self, name: &str, value: &str) {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                warn!("http: header rejected name='{}': {}", name, e);
                return;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => warn!("http: header rejected name='{}': {}", name, e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let Some(runtime) = self.runtime.clone() else {
            self.state
                .lock()
                .fail("no tokio runtime available for the transfer".to_owned());
            return;
        };

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let task = match Target::parse(&self.request.target) {
            Ok(Target::Remote(url)) => {
                let builder = self.build(url);
                runtime.spawn(run_remote(builder, state, cancel))
            }
            Ok(Target::Local(path)) => runtime.spawn(run_local(path, state, cancel)),
            Ok(Target::Virtual(target)) => {
                self.state
                    .lock()
                    .fail(format!("unsupported target `{target}`"));
                return;
            }
            Err(e) => {
                self.state.lock().fail(e.to_string());
                return;
            }
        };
        trace!(
            "http: start method={} target='{}'",
            self.request.method, self.request.target
        );
        self.task = Some(task);
    }

    fn upload_progress(&self) -> f32 {
        let state = self.state.lock();
        if state.sent || state.done { 1.0 } else { 0.0 }
    }

    fn download_progress(&self) -> f32 {
        let state = self.state.lock();
        if state.done {
            return 1.0;
        }
        match state.content_length {
            Some(len) if len > 0 => (state.received as f64 / len as f64).min(1.0) as f32,
            _ => 0.0,
        }
    }

    fn content_length(&self) -> Option<u64> {
        self.state.lock().content_length
    }

    fn poll_chunk(&mut self) -> Option<Bytes> {
        self.state.lock().chunks.pop_front()
    }

    fn is_done(&self) -> bool {
        self.state.lock().done
    }

    fn response_code(&self) -> i64 {
        self.state.lock().status
    }

    fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            trace!("http: abort target='{}'", self.request.target);
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn run_remote(
    builder: RequestBuilder,
    state: Arc<Mutex<TransferState>>,
    cancel: CancellationToken,
) {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        response = builder.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            debug!("http: send FAIL: {}", e);
            state.lock().fail(describe_reqwest_error(&e));
            return;
        }
    };

    let status = response.status();
    {
        let mut state = state.lock();
        state.sent = true;
        state.status = i64::from(status.as_u16());
        state.content_length = response.content_length();
        if !status.is_success() {
            state.error = Some(format!("HTTP {status}"));
        }
    }

    let mut body = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => state.lock().push(chunk),
            Some(Err(e)) => {
                debug!("http: body FAIL: {}", e);
                state.lock().fail(describe_reqwest_error(&e));
                return;
            }
            None => break,
        }
    }
    state.lock().done = true;
}

async fn run_local(path: PathBuf, state: Arc<Mutex<TransferState>>, cancel: CancellationToken) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let mut state = state.lock();
            if e.kind() == io::ErrorKind::NotFound {
                state.status = 404;
            }
            state.fail(format!("error opening '{}': {}", path.display(), e));
            return;
        }
    };

    {
        let len = file.metadata().await.ok().map(|m| m.len());
        let mut state = state.lock();
        state.sent = true;
        state.status = 200;
        state.content_length = len;
    }

    loop {
        let mut buf = BytesMut::with_capacity(FILE_READ_CHUNK);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = file.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => state.lock().push(buf.freeze()),
            Err(e) => {
                state
                    .lock()
                    .fail(format!("error reading '{}': {}", path.display(), e));
                return;
            }
        }
    }
    state.lock().done = true;
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_owned()
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}
