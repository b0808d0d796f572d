//! The request lifecycle state machine.
//!
//! States: `Idle -> Admitted -> Finalizing -> Complete`, plus `* -> Cancelling -> Complete`
//! from any non-terminal state. `first response` and `stream ready` are orthogonal flags set
//! while `Admitted`.
//!
//! A [`Request`] is a cheap, cloneable handle. All lifecycle work happens in
//! [`Request::tick`] (one advance step) and [`Request::cancel`]; the cooperative
//! [`Scheduler`](crate::Scheduler) and the async poll driver only differ in how they wait between
//! ticks.
//!
//! Notifications are collected while the state is locked and dispatched after the lock is
//! released, so callbacks may freely call back into the request (e.g. cancel it from a progress
//! callback). Ordering within one request: first-response, stream-ready, final progress (1.0),
//! completion. Completion fires exactly once; nothing fires after it.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::error::{
    CANCELLED_RESPONSE_CODE, RequestError, RequestResult, describe_transport_error,
};
use crate::handler::DownloadHandler;
use crate::transport::{Method, Transport};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Configured, waiting for submission or admission.
    Idle,
    /// Holding an admission slot; the transfer is running.
    Admitted,
    /// Computing the final result. Transient, within one tick.
    Finalizing,
    /// Tearing down after cancellation. Transient, within one cancel.
    Cancelling,
    /// Terminal.
    Complete,
}

/// Upload/download progress, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub upload: f32,
    pub download: f32,
}

impl Progress {
    pub const DONE: Progress = Progress {
        upload: 1.0,
        download: 1.0,
    };
}

/// Completion callback.
pub type CompletionFn<T> = Box<dyn FnOnce(RequestResult<T>) + Send>;
type ProgressFn = Box<dyn FnMut(Progress) + Send>;
type NotifyFn = Box<dyn FnOnce() + Send>;

enum RequestEvent<T> {
    Progress(Progress),
    FirstResponse,
    StreamReady,
    Completed(RequestResult<T>),
}

/// A payload handler fused with the caller's decode function.
trait Response<T>: Send {
    fn on_content_length(&mut self, len: u64);
    fn receive(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn on_transport_done(&mut self);
    fn stream_ready(&self) -> bool;
    fn stream_complete(&self) -> bool;
    fn error_body(&self) -> Option<&[u8]>;
    fn finish(&mut self, outcome: RequestResult<()>) -> RequestResult<T>;
    fn discard(&mut self, error: &RequestError);
}

struct Decoding<H, F> {
    handler: H,
    decode: Option<F>,
}

impl<H, F, T, E> Response<T> for Decoding<H, F>
where
    H: DownloadHandler,
    F: FnOnce(H::Payload) -> Result<T, E> + Send + 'static,
    E: fmt::Display,
{
    fn on_content_length(&mut self, len: u64) {
        self.handler.on_content_length(len);
    }

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.handler.receive(chunk)
    }

    fn on_transport_done(&mut self) {
        self.handler.on_transport_done();
    }

    fn stream_ready(&self) -> bool {
        self.handler.stream().is_some_and(|s| s.is_stream_ready())
    }

    fn stream_complete(&self) -> bool {
        self.handler.stream().is_none_or(|s| s.is_stream_complete())
    }

    fn error_body(&self) -> Option<&[u8]> {
        self.handler.error_body()
    }

    fn finish(&mut self, outcome: RequestResult<()>) -> RequestResult<T> {
        if let Err(e) = outcome {
            self.handler.discard(&e);
            return Err(e);
        }

        let payload = match self.handler.finish() {
            Ok(payload) => payload,
            Err(e) => {
                self.handler.discard(&e);
                return Err(e);
            }
        };

        let Some(decode) = self.decode.take() else {
            return Err(RequestError::decode("payload already consumed"));
        };

        match panic::catch_unwind(AssertUnwindSafe(move || decode(payload))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RequestError::decode(e.to_string())),
            Err(panic) => Err(RequestError::decode(format!(
                "decode function panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn discard(&mut self, error: &RequestError) {
        self.handler.discard(error);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

fn clamp_fraction(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

struct RequestCore<T> {
    state: RequestState,
    submitted: bool,
    admission: Arc<AdmissionController>,
    slot: Option<AdmissionSlot>,
    transport: Option<Box<dyn Transport>>,
    response: Option<Box<dyn Response<T>>>,
    progress: Progress,
    bytes_received: u64,
    content_length_seen: bool,
    transport_done: bool,
    receive_error: Option<RequestError>,
    response_code: i64,
    response_error: Option<RequestError>,
    has_first_response: bool,
    is_stream_ready: bool,
    is_complete: bool,
}

impl<T> RequestCore<T> {
    /// One advance step. Returns `true` once the request is finished.
    fn advance(&mut self, id: u64, events: &mut Vec<RequestEvent<T>>) -> bool {
        match self.state {
            RequestState::Idle => {
                if self.submitted {
                    self.try_admit(id);
                }
                false
            }
            RequestState::Admitted => self.poll_transfer(id, events),
            RequestState::Finalizing | RequestState::Cancelling | RequestState::Complete => true,
        }
    }

    fn try_admit(&mut self, id: u64) {
        let Some(slot) = self.admission.try_acquire() else {
            return;
        };
        self.slot = Some(slot);
        if let Some(transport) = self.transport.as_mut() {
            transport.start();
        }
        self.state = RequestState::Admitted;
        debug!(id, active = self.admission.active(), "request admitted");
    }

    fn poll_transfer(&mut self, id: u64, events: &mut Vec<RequestEvent<T>>) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };

        // Sampled before draining: every chunk of a finished transfer is already queued.
        let done = transport.is_done();
        let content_length = transport.content_length();
        let mut chunks: Vec<Bytes> = Vec::new();
        while let Some(chunk) = transport.poll_chunk() {
            chunks.push(chunk);
        }
        let (upload, download) = (transport.upload_progress(), transport.download_progress());

        let Some(response) = self.response.as_mut() else {
            return false;
        };

        if !self.content_length_seen {
            if let Some(len) = content_length {
                self.content_length_seen = true;
                response.on_content_length(len);
            }
        }

        for chunk in &chunks {
            self.bytes_received += chunk.len() as u64;
            if self.receive_error.is_some() {
                continue;
            }
            if let Err(e) = response.receive(chunk) {
                warn!(id, "request: storing response bytes failed: {}", e);
                self.receive_error = Some(RequestError::fs("error storing response bytes", e));
            }
        }

        if done && !self.transport_done {
            self.transport_done = true;
            response.on_transport_done();
        }
        let stream_ready = response.stream_ready();
        let stream_complete = response.stream_complete();

        if self.receive_error.is_some() {
            if let Some(transport) = self.transport.as_mut() {
                transport.abort();
            }
            self.finalize(id, events);
            return true;
        }

        self.raise_progress(upload, download, events);

        if !self.has_first_response && self.bytes_received > 0 {
            self.mark_first_response(id, events);
        }

        if !self.is_stream_ready && stream_ready {
            if !self.has_first_response {
                self.mark_first_response(id, events);
            }
            self.is_stream_ready = true;
            debug!(id, "request stream ready");
            events.push(RequestEvent::StreamReady);
        }

        if done && stream_complete {
            self.finalize(id, events);
            return true;
        }
        false
    }

    fn mark_first_response(&mut self, id: u64, events: &mut Vec<RequestEvent<T>>) {
        self.has_first_response = true;
        debug!(id, bytes = self.bytes_received, "request first response");
        events.push(RequestEvent::FirstResponse);
    }

    /// Progress never decreases; only increases are reported.
    fn raise_progress(&mut self, upload: f32, download: f32, events: &mut Vec<RequestEvent<T>>) {
        let next = Progress {
            upload: self.progress.upload.max(clamp_fraction(upload)),
            download: self.progress.download.max(clamp_fraction(download)),
        };
        if next != self.progress {
            self.progress = next;
            trace!(upload = next.upload, download = next.download, "request progress");
            events.push(RequestEvent::Progress(next));
        }
    }

    fn finalize(&mut self, id: u64, events: &mut Vec<RequestEvent<T>>) {
        self.state = RequestState::Finalizing;
        self.raise_progress(1.0, 1.0, events);

        let transport = self.transport.take();
        let (code, transport_error) = transport
            .as_ref()
            .map_or((0, None), |t| (t.response_code(), t.error()));
        self.response_code = code;

        let mut response = self.response.take();
        let outcome = if let Some(err) = self.receive_error.take() {
            Err(err)
        } else if let Some(message) = transport_error {
            let body = response.as_ref().and_then(|r| r.error_body());
            Err(RequestError::transport(
                code,
                describe_transport_error(&message, body),
            ))
        } else {
            Ok(())
        };

        let result = match response.as_mut() {
            Some(response) => response.finish(outcome),
            None => outcome.and(Err(RequestError::decode("no response handler"))),
        };

        match &result {
            Ok(_) => debug!(id, code, "request completed"),
            Err(e) => debug!(id, code, error = %e, "request failed"),
        }
        self.response_error = result.as_ref().err().cloned();
        events.push(RequestEvent::Completed(result));
        self.teardown();
    }

    fn cancel(&mut self, id: u64, events: &mut Vec<RequestEvent<T>>) {
        if matches!(
            self.state,
            RequestState::Complete | RequestState::Cancelling | RequestState::Finalizing
        ) {
            return;
        }

        let previous = self.state;
        self.state = RequestState::Cancelling;
        if let Some(mut transport) = self.transport.take() {
            transport.abort();
        }

        self.raise_progress(1.0, 1.0, events);
        self.response_code = CANCELLED_RESPONSE_CODE;
        let error = RequestError::Cancelled;
        if let Some(mut response) = self.response.take() {
            response.discard(&error);
        }
        self.response_error = Some(error.clone());

        debug!(id, from = ?previous, "request cancelled");
        events.push(RequestEvent::Completed(Err(error)));
        self.teardown();
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.response = None;
        // Releases the admission slot.
        self.slot = None;
        self.state = RequestState::Complete;
    }
}

struct Listeners<T> {
    progress: Option<ProgressFn>,
    first_response: Option<NotifyFn>,
    stream_ready: Option<NotifyFn>,
    complete: Option<CompletionFn<T>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            progress: None,
            first_response: None,
            stream_ready: None,
            complete: None,
        }
    }
}

struct Shared<T> {
    id: u64,
    target: String,
    method: Method,
    cancel: CancellationToken,
    /// Set when the completion notification is dispatched.
    terminal: AtomicBool,
    core: Mutex<RequestCore<T>>,
    listeners: Mutex<Listeners<T>>,
}

/// Handle to one network operation.
///
/// Cloning the handle does not clone the operation: all clones observe and drive the same
/// request.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("target", &self.shared.target)
            .field("state", &self.shared.core.lock().state)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request<T> {
    pub(crate) fn new<H, F, E>(
        id: u64,
        target: String,
        method: Method,
        admission: Arc<AdmissionController>,
        transport: Box<dyn Transport>,
        handler: H,
        decode: F,
    ) -> Self
    where
        H: DownloadHandler,
        F: FnOnce(H::Payload) -> Result<T, E> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let response: Box<dyn Response<T>> = Box::new(Decoding {
            handler,
            decode: Some(decode),
        });

        let core = RequestCore {
            state: RequestState::Idle,
            submitted: false,
            admission,
            slot: None,
            transport: Some(transport),
            response: Some(response),
            progress: Progress::default(),
            bytes_received: 0,
            content_length_seen: false,
            transport_done: false,
            receive_error: None,
            response_code: 0,
            response_error: None,
            has_first_response: false,
            is_stream_ready: false,
            is_complete: false,
        };

        Self {
            shared: Arc::new(Shared {
                id,
                target,
                method,
                cancel: CancellationToken::new(),
                terminal: AtomicBool::new(false),
                core: Mutex::new(core),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    /// Register the completion callback and mark the request submitted.
    ///
    /// Returns `false`, without touching the pending submission, when the request was already
    /// submitted or has already completed.
    pub(crate) fn submit(&self, on_complete: CompletionFn<T>) -> bool {
        let mut core = self.shared.core.lock();
        if core.submitted || core.state != RequestState::Idle {
            debug!(id = self.shared.id, "request already in progress");
            return false;
        }
        core.submitted = true;
        self.shared.listeners.lock().complete = Some(on_complete);
        trace!(id = self.shared.id, target = %self.shared.target, "request submitted");
        true
    }

    /// Advance the request by one step. Returns `true` once it is finished.
    ///
    /// Unsubmitted requests stay idle. A cancelled cancellation token is applied here.
    pub fn tick(&self) -> bool {
        let mut events = Vec::new();
        let finished = {
            let mut core = self.shared.core.lock();
            if self.shared.cancel.is_cancelled() {
                core.cancel(self.shared.id, &mut events);
                true
            } else {
                core.advance(self.shared.id, &mut events)
            }
        };
        self.dispatch(events);
        finished
    }

    /// Cancel the request. The completion callback (if submitted) fires before this returns.
    /// Idempotent; a no-op on completed requests.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        let mut events = Vec::new();
        self.shared.core.lock().cancel(self.shared.id, &mut events);
        self.dispatch(events);
    }

    /// Called with every progress increase, ending with `1.0` before completion.
    pub fn on_progress(&self, f: impl FnMut(Progress) + Send + 'static) -> &Self {
        self.shared.listeners.lock().progress = Some(Box::new(f));
        self
    }

    /// Called once when the first response bytes arrive.
    pub fn on_first_response(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.shared.listeners.lock().first_response = Some(Box::new(f));
        self
    }

    /// Called once when a streaming payload can be consumed before the transfer completes.
    pub fn on_stream_ready(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.shared.listeners.lock().stream_ready = Some(Box::new(f));
        self
    }

    fn dispatch(&self, events: Vec<RequestEvent<T>>) {
        for event in events {
            if self.shared.terminal.load(Ordering::Acquire) {
                return;
            }
            match event {
                RequestEvent::Progress(progress) => {
                    let callback = self.shared.listeners.lock().progress.take();
                    if let Some(mut callback) = callback {
                        callback(progress);
                        let mut listeners = self.shared.listeners.lock();
                        if listeners.progress.is_none()
                            && !self.shared.terminal.load(Ordering::Acquire)
                        {
                            listeners.progress = Some(callback);
                        }
                    }
                }
                RequestEvent::FirstResponse => {
                    let callback = self.shared.listeners.lock().first_response.take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                RequestEvent::StreamReady => {
                    let callback = self.shared.listeners.lock().stream_ready.take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                RequestEvent::Completed(result) => {
                    if self.shared.terminal.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    let listeners = std::mem::take(&mut *self.shared.listeners.lock());
                    if let Some(callback) = listeners.complete {
                        callback(result);
                    }
                    self.shared.core.lock().is_complete = true;
                }
            }
        }
    }
}

impl<T> Request<T> {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn method(&self) -> Method {
        self.shared.method
    }

    pub fn state(&self) -> RequestState {
        self.shared.core.lock().state
    }

    pub fn progress(&self) -> Progress {
        self.shared.core.lock().progress
    }

    pub fn upload_progress(&self) -> f32 {
        self.progress().upload
    }

    pub fn download_progress(&self) -> f32 {
        self.progress().download
    }

    /// Response code of the finished transfer, [`CANCELLED_RESPONSE_CODE`] after cancellation,
    /// 0 before completion.
    pub fn response_code(&self) -> i64 {
        self.shared.core.lock().response_code
    }

    pub fn response_error(&self) -> Option<RequestError> {
        self.shared.core.lock().response_error.clone()
    }

    /// Error text; empty unless the request failed.
    pub fn error_text(&self) -> String {
        self.response_error()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    pub fn has_first_response(&self) -> bool {
        self.shared.core.lock().has_first_response
    }

    pub fn is_stream_ready(&self) -> bool {
        self.shared.core.lock().is_stream_ready
    }

    /// `true` once the completion notification has been delivered.
    pub fn is_complete(&self) -> bool {
        self.shared.core.lock().is_complete
    }

    /// Submitted and not yet complete.
    pub fn is_in_progress(&self) -> bool {
        let core = self.shared.core.lock();
        core.submitted && core.state != RequestState::Complete
    }

    /// Token that cancels the request at its next tick (immediately under the async driver).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}
