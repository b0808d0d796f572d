//! The caller-facing API: building requests, submitting them and a few helpers built on top.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::admission::AdmissionController;
use crate::atomic::AtomicFileWriter;
use crate::driver::{Scheduler, poll_until_complete};
use crate::error::{RequestError, RequestResult, SetupError, excerpt};
use crate::handler::{
    BufferHandler, DiscardHandler, DownloadHandler, FileHandler, StagedFileHandler,
};
use crate::request::Request;
use crate::settings::{EngineSettings, RequestSpec};
use crate::target::Target;
use crate::transport::{TransportFactory, TransportRequest};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Entry point for issuing requests.
///
/// Owns (or shares) an [`AdmissionController`], a [`TransportFactory`] and a cooperative
/// [`Scheduler`]. Requests submitted with [`send`](Engine::send) advance on
/// [`tick`](Engine::tick); requests awaited with [`send_async`](Engine::send_async) drive
/// themselves.
pub struct Engine {
    settings: EngineSettings,
    admission: Arc<AdmissionController>,
    transports: Arc<dyn TransportFactory>,
    scheduler: Scheduler,
    next_id: AtomicU64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("admission", &self.admission)
            .field("scheduled", &self.scheduler.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with its own admission controller.
    pub fn new(settings: EngineSettings, transports: Arc<dyn TransportFactory>) -> Self {
        let admission = Arc::new(AdmissionController::new(settings.max_active_requests));
        Self::with_admission(settings, transports, admission)
    }

    /// Create an engine sharing `admission` with other engines.
    /// `settings.max_active_requests` is ignored in favor of the shared controller's ceiling.
    pub fn with_admission(
        settings: EngineSettings,
        transports: Arc<dyn TransportFactory>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            settings,
            admission,
            transports,
            scheduler: Scheduler::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an engine backed by the HTTP transport. Must be called within a tokio runtime.
    #[cfg(feature = "http")]
    pub fn http(settings: EngineSettings) -> Self {
        Self::new(settings, Arc::new(crate::http::HttpTransportFactory::new()))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ----------------------------
    // Request construction
    // ----------------------------

    /// Build a request whose payload is produced by `handler` and turned into `T` by `decode`.
    ///
    /// `decode` runs once after a successful transfer. Errors it returns, and panics it raises,
    /// surface as [`RequestError::Decode`].
    pub fn request<H, F, T, E>(&self, spec: RequestSpec, handler: H, decode: F) -> Request<T>
    where
        H: DownloadHandler,
        F: FnOnce(H::Payload) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport_request = TransportRequest {
            target: spec.target.clone(),
            method: spec.method,
            body: spec.body,
            content_type: spec.content_type,
        };

        let mut transport = self.transports.create(&transport_request);
        for (name, value) in self.settings.default_headers.iter().chain(&spec.headers) {
            transport.set_header(name, value);
        }
        if let Some(timeout) = spec.timeout.or(self.settings.request_timeout) {
            transport.set_timeout(timeout);
        }

        debug!(id, method = %spec.method, target = %spec.target, "request created");
        Request::new(
            id,
            spec.target,
            spec.method,
            Arc::clone(&self.admission),
            transport,
            handler,
            decode,
        )
    }

    /// GET the raw body.
    pub fn get_bytes(&self, target: &str) -> Request<Bytes> {
        self.request(
            RequestSpec::get(target),
            BufferHandler::new(),
            Ok::<_, RequestError>,
        )
    }

    /// GET the body as UTF-8 text.
    pub fn get_text(&self, target: &str) -> Request<String> {
        self.request(RequestSpec::get(target), BufferHandler::new(), decode_text)
    }

    /// GET the body and deserialize it from JSON.
    pub fn get_json<T>(&self, target: &str) -> Request<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.request(
            RequestSpec::get(target),
            BufferHandler::new(),
            decode_json::<T>,
        )
    }

    /// POST `body` as JSON and deserialize the JSON response.
    pub fn post_json<B, T>(&self, target: &str, body: &B) -> RequestResult<Request<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        let body = serde_json::to_vec(body).map_err(|e| SetupError::InvalidBody(e.to_string()))?;
        let spec = RequestSpec::post(target)
            .body(body, JSON_CONTENT_TYPE)
            .header("Accept", JSON_CONTENT_TYPE);
        Ok(self.request(spec, BufferHandler::new(), decode_json::<T>))
    }

    /// HEAD `target`. The status is available from [`Request::response_code`] once complete.
    pub fn head(&self, target: &str) -> Request<()> {
        self.request(
            RequestSpec::head(target),
            DiscardHandler::default(),
            |_| Ok::<_, RequestError>(()),
        )
    }

    /// Download `target` into `destination` through a temporary sibling file.
    ///
    /// Setup failures (empty path, non-local destination, missing directory) are returned here,
    /// before any I/O happens.
    pub fn download(
        &self,
        target: &str,
        destination: impl AsRef<Path>,
    ) -> RequestResult<Request<PathBuf>> {
        let writer = AtomicFileWriter::prepare(destination)?;
        Ok(self.request(
            RequestSpec::get(target),
            FileHandler::new(writer),
            Ok::<_, RequestError>,
        ))
    }

    // ----------------------------
    // Submission
    // ----------------------------

    /// Submit `request` to the cooperative scheduler; `on_complete` fires exactly once.
    ///
    /// Returns `false` without starting anything if the request was already submitted.
    pub fn send<T, F>(&self, request: &Request<T>, on_complete: F) -> bool
    where
        T: Send + 'static,
        F: FnOnce(RequestResult<T>) + Send + 'static,
    {
        if !request.submit(Box::new(on_complete)) {
            return false;
        }
        self.scheduler.register(Box::new(request.clone()));
        true
    }

    /// Advance every request submitted with [`send`](Self::send) once.
    /// Returns how many are still running.
    pub fn tick(&self) -> usize {
        self.scheduler.tick()
    }

    /// Submit `request` and drive it to completion with the async poll driver.
    #[instrument(skip_all, fields(id = request.id()))]
    pub async fn send_async<T: Send + 'static>(&self, request: &Request<T>) -> RequestResult<T> {
        let (tx, rx) = oneshot::channel();
        if !request.submit(Box::new(move |result: RequestResult<T>| {
            let _ = tx.send(result);
        })) {
            return Err(SetupError::AlreadyInProgress.into());
        }

        poll_until_complete(request, self.settings.poll_interval).await;
        rx.await.unwrap_or(Err(RequestError::Cancelled))
    }

    // ----------------------------
    // Helpers
    // ----------------------------

    /// Check whether `target` exists.
    ///
    /// - remote URLs: HEAD request, exists on success;
    /// - virtual locations: GET that cancels itself as soon as any byte arrives;
    /// - local paths: file-system check.
    #[instrument(skip(self))]
    pub async fn file_exists(&self, target: &str) -> bool {
        match Target::parse(target) {
            Ok(Target::Local(path)) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Ok(Target::Remote(_)) => {
                let request = self.head(target);
                self.send_async(&request).await.is_ok()
            }
            Ok(Target::Virtual(_)) => {
                let request = self.request(
                    RequestSpec::get(target),
                    DiscardHandler::default(),
                    Ok::<_, RequestError>,
                );
                let token = request.cancellation_token();
                request.on_first_response(move || token.cancel());
                let result = self.send_async(&request).await;
                result.is_ok() || request.has_first_response()
            }
            Err(e) => {
                debug!("file_exists: {}", e);
                false
            }
        }
    }

    /// Download `target` into `destination` and await the result.
    ///
    /// Chunks are written from the driving task; the final publish runs on tokio's blocking pool.
    /// Dropping the returned future before it resolves removes the temporary file.
    pub async fn download_file(
        &self,
        target: &str,
        destination: impl AsRef<Path>,
    ) -> RequestResult<PathBuf> {
        let writer = AtomicFileWriter::prepare(destination)?;
        let request = self.request(
            RequestSpec::get(target),
            StagedFileHandler::new(writer),
            Ok::<_, RequestError>,
        );
        let staged = self.send_async(&request).await?;
        let destination = staged.destination().to_path_buf();
        staged.finalize_async(None).await?;
        Ok(destination)
    }
}

fn decode_text(bytes: Bytes) -> Result<String, String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        format!(
            "payload is not valid UTF-8 ({e}): {}",
            excerpt(&String::from_utf8_lossy(&bytes))
        )
    })
}

fn decode_json<T: DeserializeOwned>(bytes: Bytes) -> Result<T, String> {
    serde_json::from_slice(&bytes).map_err(|e| {
        format!(
            "invalid JSON ({e}): {}",
            excerpt(&String::from_utf8_lossy(&bytes))
        )
    })
}
