//! Crate-level error types.
//!
//! Every request concludes with exactly one [`RequestResult`]. The variants of [`RequestError`]
//! mirror the stages a request can fail in: setup (before any I/O), transport, decoding of the
//! received payload, synthetic cancellation, and file-system work during download finalization.
//!
//! Errors are `Clone` so a request can keep the surfaced error around for inspection after the
//! completion callback consumed its copy.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

/// Response code reported by a request that was cancelled.
pub const CANCELLED_RESPONSE_CODE: i64 = -1;

/// Error text reported by a request that was cancelled.
pub const CANCELLED_MESSAGE: &str = "request cancelled";

/// Maximum number of payload characters quoted in decode diagnostics.
pub(crate) const EXCERPT_CHARS: usize = 256;

/// Result type used by this crate.
pub type RequestResult<T> = Result<T, RequestError>;

/// Failures detected before a request touches the network or the file system.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// The request target is empty.
    #[error("request target is empty")]
    EmptyTarget,

    /// The target could not be interpreted.
    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// A download destination is empty.
    #[error("destination path is empty")]
    EmptyPath,

    /// A download destination resolves to a remote or virtual location.
    #[error("destination `{0}` is not a local file path")]
    NotLocal(String),

    /// The parent directory of a download destination does not exist.
    #[error("directory `{0}` does not exist")]
    MissingDirectory(String),

    /// The request object was already submitted.
    #[error("request already in progress")]
    AlreadyInProgress,

    /// The request body could not be serialized.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

/// Unified error type surfaced by requests.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// Fails fast, before any I/O. Never retried.
    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    /// Network failure, non-success status or timeout reported by the transport.
    #[error("{message}")]
    Transport {
        /// Response code reported by the transport (0 when no response was received).
        code: i64,
        /// Transport error text, possibly annotated with a detail from the response body.
        message: String,
    },

    /// Payload bytes arrived but could not be turned into the requested value.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The request was cancelled by its caller.
    #[error("request cancelled")]
    Cancelled,

    /// File-system failure while preparing or publishing a download.
    #[error("{context}: {source}")]
    FileSystem {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl RequestError {
    /// Construct a transport error.
    pub fn transport(code: i64, message: impl Into<String>) -> Self {
        RequestError::Transport {
            code,
            message: message.into(),
        }
    }

    /// Construct a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        RequestError::Decode(message.into())
    }

    /// Wrap an I/O error with static context.
    pub fn fs(context: &'static str, source: io::Error) -> Self {
        RequestError::FileSystem {
            context,
            source: Arc::new(source),
        }
    }

    /// Returns `true` for the synthetic cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }

    /// Response code associated with this error, if it carries one.
    pub fn response_code(&self) -> Option<i64> {
        match self {
            RequestError::Transport { code, .. } => Some(*code),
            RequestError::Cancelled => Some(CANCELLED_RESPONSE_CODE),
            _ => None,
        }
    }

    pub(crate) fn missing_directory(dir: &Path) -> Self {
        SetupError::MissingDirectory(dir.display().to_string()).into()
    }
}

/// Lift `io::Result` into [`RequestResult`] with a static context string.
pub trait WrapIoResult<T> {
    fn wrap_err(self, context: &'static str) -> RequestResult<T>;
}

impl<T> WrapIoResult<T> for io::Result<T> {
    fn wrap_err(self, context: &'static str) -> RequestResult<T> {
        self.map_err(|e| RequestError::fs(context, e))
    }
}

/// Build the text of a transport error, appending a structured detail taken from the response
/// body when the body is non-empty and parses as a JSON object or array.
pub(crate) fn describe_transport_error(message: &str, body: Option<&[u8]>) -> String {
    let Some(body) = body.filter(|b| !b.is_empty()) else {
        return message.to_owned();
    };

    let detail = match serde_json::from_slice::<Value>(body) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => {
            structured_message(&value).unwrap_or_else(|| value.to_string())
        }
        _ => return message.to_owned(),
    };

    format!("{message}: {detail}")
}

fn structured_message(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    for key in ["message", "error", "detail", "error_description"] {
        match map.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(nested @ Value::Object(_)) => {
                if let Some(inner) = nested
                    .as_object()
                    .and_then(|m| m.get("message"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                {
                    return Some(inner.to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

/// Char-boundary safe prefix of `text` used in decode diagnostics.
pub(crate) fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}
