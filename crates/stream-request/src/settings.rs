//! Configuration for the request engine and for individual requests.
//!
//! [`EngineSettings`] holds process-wide knobs (admission ceiling, default timeout, polling
//! cadence of the async driver, default headers). [`RequestSpec`] describes a single request;
//! per-request values override the engine defaults.

use std::time::Duration;

use bytes::Bytes;

use crate::transport::Method;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum number of simultaneously admitted requests.
    /// Values `<= 0` disable the ceiling (every request is admitted immediately).
    /// Default: 0 (unlimited).
    pub max_active_requests: i64,

    /// Timeout handed to every transport unless the request overrides it.
    /// `None` leaves the transport's own default in place.
    /// Default: 30 seconds.
    pub request_timeout: Option<Duration>,

    /// Delay between polls when a request is awaited with the async driver.
    /// Default: 100ms.
    pub poll_interval: Duration,

    /// Headers applied to every request before its own headers.
    pub default_headers: Vec<(String, String)>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_active_requests: 0,
            request_timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            default_headers: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the admission ceiling.
    pub fn with_max_active_requests(mut self, ceiling: i64) -> Self {
        self.max_active_requests = ceiling;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the async driver poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Add a header sent with every request.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}

/// Description of a single request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub target: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// Overrides [`EngineSettings::request_timeout`] when set.
    pub timeout: Option<Duration>,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method,
            headers: Vec::new(),
            timeout: None,
            body: None,
            content_type: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn head(target: impl Into<String>) -> Self {
        Self::new(Method::Head, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::Post, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::Put, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::Delete, target)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach an upload body with its content type.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.content_type = Some(content_type.into());
        self
    }
}
