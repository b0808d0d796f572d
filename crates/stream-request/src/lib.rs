//! Streaming network-request engine.
//!
//! Requests are cheap handles over a small state machine (`Idle -> Admitted -> Finalizing ->
//! Complete`, with `Cancelling` reachable from any non-terminal state). A shared
//! [`AdmissionController`] caps how many requests transfer at once; everything else waits idle
//! without holding transport resources.
//!
//! Every request ends with exactly one completion notification carrying a [`RequestResult`].
//! Progress is monotonic and reaches `1.0` before completion. Downloads are written to a
//! temporary sibling file and published atomically.
//!
//! This crate is composed of several modules:
//! - `engine`: [`Engine`], the caller-facing API (request constructors, `send`, helpers).
//! - `request`: [`Request`] handles and the lifecycle state machine.
//! - `admission`: the global concurrency ceiling.
//! - `driver`: the cooperative [`Scheduler`] and the async [`poll_until_complete`] driver.
//! - `handler`: payload handlers (memory buffer, discard, atomic file).
//! - `atomic`: crash-safe publishing of downloads.
//! - `transport`: the polled transport contract; `http` implements it with `reqwest`.
//! - `target`: classification of remote, virtual and local targets.
//! - `settings`: engine and per-request configuration.
//! - `error`: unified error types.
//!
//! This file (`lib.rs`) only wires modules and re-exports.

mod admission;
mod atomic;
mod driver;
mod engine;
mod error;
mod handler;
#[cfg(feature = "http")]
mod http;
mod request;
mod settings;
mod target;
mod transport;

pub use bytes::Bytes;

pub use crate::admission::{AdmissionController, AdmissionSlot};
pub use crate::atomic::{AtomicFileWriter, TEMP_SUFFIX};
pub use crate::driver::{Scheduler, Tick, poll_until_complete};
pub use crate::engine::Engine;
pub use crate::error::{
    CANCELLED_MESSAGE, CANCELLED_RESPONSE_CODE, RequestError, RequestResult, SetupError,
    WrapIoResult,
};
pub use crate::handler::{
    BufferHandler, DiscardHandler, DownloadHandler, FileHandler, StagedFileHandler, StreamCapable,
};
pub use crate::request::{CompletionFn, Progress, Request, RequestState};
pub use crate::settings::{EngineSettings, RequestSpec};
pub use crate::target::Target;
pub use crate::transport::{Method, Transport, TransportFactory, TransportRequest};

#[cfg(feature = "http")]
pub use crate::http::{HttpTransport, HttpTransportFactory};
