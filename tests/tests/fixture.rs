//! Test fixtures for `stream-request` integration tests.
//!
//! - [`MockTransportFactory`]: scripted in-memory transports. A [`Route`] releases one chunk per
//!   tick; a [`MockRemote`] is fed by the test itself, so the test controls exactly when bytes
//!   arrive and when the transfer ends.
//! - [`TransportLog`]: what the engine did with its transports (starts, aborts, headers,
//!   timeouts, peak concurrency).
//! - [`FixtureServer`]: a local `axum` server for the `reqwest` transport.
//! - PCM generators for audio tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};

use stream_request::{Engine, EngineSettings, Transport, TransportFactory, TransportRequest};

// ----------------------------
// Scripted responses
// ----------------------------

/// A scripted response released one chunk per tick.
#[derive(Debug, Clone)]
pub struct Route {
    pub status: i64,
    pub chunks: Vec<Bytes>,
    pub error: Option<String>,
    pub content_length: Option<u64>,
}

impl Route {
    /// `200` with `body` split into `chunk_size`-byte chunks.
    pub fn ok(body: impl AsRef<[u8]>, chunk_size: usize) -> Self {
        let chunks = body
            .as_ref()
            .chunks(chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        Self::from_chunks(200, chunks)
    }

    /// `200` delivering exactly these chunks.
    pub fn chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let chunks = chunks
            .into_iter()
            .map(|c| Bytes::copy_from_slice(c.as_ref()))
            .collect();
        Self::from_chunks(200, chunks)
    }

    /// Non-success status with the given body, reported as `HTTP <status>`.
    pub fn status(status: i64, body: impl AsRef<[u8]>) -> Self {
        let mut route = Self::ok(body, usize::MAX);
        route.status = status;
        route.error = Some(format!("HTTP {status}"));
        route
    }

    /// Report `message` as a transport error once every chunk was delivered.
    pub fn with_error(mut self, message: &str) -> Self {
        self.error = Some(message.to_owned());
        self
    }

    pub fn without_content_length(mut self) -> Self {
        self.content_length = None;
        self
    }

    fn from_chunks(status: i64, chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            status,
            chunks,
            error: None,
            content_length: Some(len),
        }
    }

    fn total_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }
}

/// A transfer fed by the test.
#[derive(Debug, Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

#[derive(Debug, Default)]
struct RemoteState {
    chunks: VecDeque<Bytes>,
    received: u64,
    content_length: Option<u64>,
    status: i64,
    error: Option<String>,
    done: bool,
}

impl MockRemote {
    pub fn push(&self, bytes: impl AsRef<[u8]>) {
        self.state
            .lock()
            .chunks
            .push_back(Bytes::copy_from_slice(bytes.as_ref()));
    }

    pub fn set_content_length(&self, len: u64) {
        self.state.lock().content_length = Some(len);
    }

    /// End the transfer successfully.
    pub fn finish(&self, status: i64) {
        let mut state = self.state.lock();
        state.status = status;
        state.done = true;
    }

    /// End the transfer with an error.
    pub fn fail(&self, status: i64, message: &str) {
        let mut state = self.state.lock();
        state.status = status;
        state.error = Some(message.to_owned());
        state.done = true;
    }
}

// ----------------------------
// Transport log
// ----------------------------

/// Observations shared by every transport of one factory.
#[derive(Debug, Default)]
pub struct TransportLog {
    started: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
    headers: Mutex<HashMap<String, Vec<(String, String)>>>,
    timeouts: Mutex<HashMap<String, Duration>>,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl TransportLog {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn was_started(&self, target: &str) -> bool {
        self.started.lock().iter().any(|t| t == target)
    }

    pub fn was_aborted(&self, target: &str) -> bool {
        self.aborted.lock().iter().any(|t| t == target)
    }

    pub fn headers(&self, target: &str) -> Vec<(String, String)> {
        self.headers.lock().get(target).cloned().unwrap_or_default()
    }

    pub fn timeout(&self, target: &str) -> Option<Duration> {
        self.timeouts.lock().get(target).copied()
    }

    /// Transports started and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live transports.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ----------------------------
// Factory / transport
// ----------------------------

/// Creates scripted transports. Unknown targets answer `HTTP 404`.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    routes: Mutex<HashMap<String, Route>>,
    remotes: Mutex<HashMap<String, MockRemote>>,
    log: Arc<TransportLog>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, target: &str, route: Route) {
        self.routes.lock().insert(target.to_owned(), route);
    }

    /// Register `target` as a test-fed transfer and return its handle.
    pub fn remote(&self, target: &str) -> MockRemote {
        self.remotes
            .lock()
            .entry(target.to_owned())
            .or_default()
            .clone()
    }

    pub fn log(&self) -> &TransportLog {
        &self.log
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, request: &TransportRequest) -> Box<dyn Transport> {
        let script = if let Some(remote) = self.remotes.lock().get(&request.target) {
            Script::Remote(remote.clone())
        } else {
            let route = self
                .routes
                .lock()
                .get(&request.target)
                .cloned()
                .unwrap_or_else(|| Route::status(404, ""));
            Script::Route {
                route,
                released: AtomicUsize::new(0),
                polled: 0,
            }
        };

        Box::new(MockTransport {
            target: request.target.clone(),
            log: Arc::clone(&self.log),
            script,
            started: false,
            aborted: false,
        })
    }
}

enum Script {
    Route {
        route: Route,
        released: AtomicUsize,
        polled: usize,
    },
    Remote(MockRemote),
}

struct MockTransport {
    target: String,
    log: Arc<TransportLog>,
    script: Script,
    started: bool,
    aborted: bool,
}

impl Transport for MockTransport {
    fn set_header(&mut self, name: &str, value: &str) {
        self.log
            .headers
            .lock()
            .entry(self.target.clone())
            .or_default()
            .push((name.to_owned(), value.to_owned()));
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.log.timeouts.lock().insert(self.target.clone(), timeout);
    }

    fn start(&mut self) {
        assert!(!self.started, "transport for '{}' started twice", self.target);
        self.started = true;
        self.log.started.lock().push(self.target.clone());
        let live = self.log.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn upload_progress(&self) -> f32 {
        if self.started { 1.0 } else { 0.0 }
    }

    fn download_progress(&self) -> f32 {
        match &self.script {
            Script::Route { route, polled, .. } => {
                let total = route.total_len();
                if total == 0 {
                    return 0.0;
                }
                let delivered: u64 = route.chunks[..*polled].iter().map(|c| c.len() as u64).sum();
                delivered as f32 / total as f32
            }
            Script::Remote(remote) => {
                let state = remote.state.lock();
                match state.content_length {
                    Some(len) if len > 0 => (state.received as f32 / len as f32).min(1.0),
                    _ => 0.0,
                }
            }
        }
    }

    fn content_length(&self) -> Option<u64> {
        match &self.script {
            Script::Route { route, .. } => route.content_length,
            Script::Remote(remote) => remote.state.lock().content_length,
        }
    }

    fn poll_chunk(&mut self) -> Option<Bytes> {
        match &mut self.script {
            Script::Route {
                route,
                released,
                polled,
            } => {
                if *polled >= released.load(Ordering::SeqCst) {
                    return None;
                }
                let chunk = route.chunks[*polled].clone();
                *polled += 1;
                Some(chunk)
            }
            Script::Remote(remote) => {
                let mut state = remote.state.lock();
                let chunk = state.chunks.pop_front()?;
                state.received += chunk.len() as u64;
                Some(chunk)
            }
        }
    }

    /// Scripted routes release one more chunk per call and report done together with the last.
    fn is_done(&self) -> bool {
        if !self.started {
            return false;
        }
        match &self.script {
            Script::Route {
                route, released, ..
            } => {
                let total = route.chunks.len();
                let next = (released.load(Ordering::SeqCst) + 1).min(total);
                released.store(next, Ordering::SeqCst);
                next >= total
            }
            Script::Remote(remote) => remote.state.lock().done,
        }
    }

    fn response_code(&self) -> i64 {
        match &self.script {
            Script::Route { route, .. } => route.status,
            Script::Remote(remote) => remote.state.lock().status,
        }
    }

    fn error(&self) -> Option<String> {
        match &self.script {
            Script::Route { route, .. } => route.error.clone(),
            Script::Remote(remote) => remote.state.lock().error.clone(),
        }
    }

    fn abort(&mut self) {
        if self.started && !self.aborted {
            self.aborted = true;
            self.log.aborted.lock().push(self.target.clone());
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if self.started {
            self.log.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ----------------------------
// Engine helpers
// ----------------------------

/// Engine over `factory` that polls quickly under the async driver.
pub fn engine(factory: &Arc<MockTransportFactory>, settings: EngineSettings) -> Engine {
    Engine::new(
        settings.with_poll_interval(Duration::from_millis(1)),
        factory.clone(),
    )
}

/// Tick until nothing is scheduled. Panics if that takes more than `max_ticks`.
pub fn run_to_idle(engine: &Engine, max_ticks: usize) -> usize {
    for ticks in 1..=max_ticks {
        if engine.tick() == 0 {
            return ticks;
        }
    }
    panic!("requests still running after {max_ticks} ticks");
}

/// Fresh per-test scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("stream-request-tests")
        .join(format!("{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

// ----------------------------
// Audio
// ----------------------------

/// Raw little-endian PCM16 sine wave (no container), same sample on every channel.
pub fn pcm16_sine(freq_hz: f32, duration_secs: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let frames = (sample_rate as f32 * duration_secs) as usize;
    let mut pcm = Vec::with_capacity(frames * channels as usize * 2);
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((2.0 * std::f32::consts::PI * freq_hz * t).sin() * i16::MAX as f32) as i16;
        for _ in 0..channels {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
    }
    pcm
}

/// At least 10% of samples are above a small threshold.
pub fn is_not_silence(samples: &[f32]) -> bool {
    if samples.is_empty() {
        return false;
    }
    let loud = samples.iter().filter(|s| s.abs() > 0.01).count();
    loud * 10 >= samples.len()
}

// ----------------------------
// HTTP fixture server
// ----------------------------

/// Local `axum` server for the `reqwest` transport.
///
/// Routes:
/// - `GET /hello` -> `hello world`
/// - `GET /config.json` -> a small JSON document
/// - `GET /missing` -> `404` with `{"error":"no such resource"}`
/// - `POST /echo` -> the JSON request body
/// - `GET /tone.raw` -> [`FixtureServer::tone`]
pub struct FixtureServer {
    base_url: String,
}

impl FixtureServer {
    pub const HELLO: &'static str = "hello world";

    pub fn tone() -> Vec<u8> {
        pcm16_sine(440.0, 0.25, 8_000, 1)
    }

    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture server");
        let addr = listener.local_addr().expect("fixture server address");
        tokio::spawn(async move {
            axum::serve(listener, Self::router())
                .await
                .expect("fixture server failed");
        });
        Self {
            base_url: format!("http://{addr}"),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn router() -> Router {
        let tone = Bytes::from(Self::tone());
        Router::new()
            .route("/hello", get(|| async { Self::HELLO }))
            .route(
                "/config.json",
                get(|| async { axum::Json(json!({ "name": "fixture", "version": 3 })) }),
            )
            .route(
                "/missing",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        axum::Json(json!({ "error": "no such resource" })),
                    )
                }),
            )
            .route(
                "/echo",
                post(|axum::Json(body): axum::Json<Value>| async move { axum::Json(body) }),
            )
            .route(
                "/tone.raw",
                get(move || {
                    let tone = tone.clone();
                    async move { tone }
                }),
            )
    }
}
