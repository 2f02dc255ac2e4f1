//! Error types for registration-time and request-time failures

use bytes::Bytes;
use std::fmt;

use crate::hooks::Stage;
use crate::lifecycle::{LifecycleState, ValidationIssue};

/// Errors reported by the hook engine.
///
/// Registration-time errors (`InvalidStage`, `IncompatibleHook`,
/// `ScopeSealed`, ...) go straight back to the registering caller and never
/// reach a request. Request-time errors are wrapped in [`LifecycleError`].
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("unknown hook stage '{0}'")]
    InvalidStage(String),

    #[error("{stage} does not accept {found} handlers (expected {expected})")]
    IncompatibleHook {
        stage: Stage,
        expected: &'static str,
        found: &'static str,
    },

    #[error("scope '{scope}' is sealed for {stage}: its hook chain was already resolved")]
    ScopeSealed { scope: String, stage: Stage },

    #[error("{stage} hook produced a {kind} payload; only strings, buffers, streams or null can be sent")]
    InvalidPayloadTransition { stage: Stage, kind: &'static str },

    #[error("reply was already sent")]
    RequestAlreadySent,

    #[error("cannot send from the error path; the error handler owns the reply")]
    SendWhileErrored,

    #[error("{stage} hook failed: {source}")]
    HandlerFault {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("onError hook failed: {source}")]
    OnErrorHandlerFault {
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown scope id {0}")]
    UnknownScope(usize),

    #[error("decorator '{0}' is already present")]
    DecoratorAlreadyPresent(String),

    #[error("route {method} {path} is already declared")]
    DuplicateRoute { method: String, path: String },

    #[error("application already started; registration is closed")]
    AlreadyStarted,

    #[error("application is not ready; call ready() first")]
    NotReady,

    #[error("onReady hook '{name}' did not settle within {timeout_ms}ms")]
    ReadyTimeout { name: String, timeout_ms: u64 },

    #[error("{} onClose hook(s) failed: {}", .0.len(), .0.join("; "))]
    ShutdownFailures(Vec<String>),
}

/// An error carrying the HTTP status a reply should use.
///
/// Handlers return this (through `anyhow`) to pick the reply status; any
/// other error becomes a 500.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(413, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(415, message)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HttpError {}

/// Canonical reason phrase for the status codes the engine produces
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ if status < 400 => "OK",
        _ if status < 500 => "Client Error",
        _ => "Server Error",
    }
}

/// A failure that aborted a request's pipeline, tagged with where it happened
#[derive(Debug)]
pub struct LifecycleError {
    state: LifecycleState,
    stage: Option<Stage>,
    source: anyhow::Error,
    status_code: Option<u16>,
    body: Option<Bytes>,
    validation: Vec<ValidationIssue>,
}

impl LifecycleError {
    /// A failure outside any hook (parser, validator, route handler)
    pub fn new(state: LifecycleState, source: impl Into<anyhow::Error>) -> Self {
        Self {
            state,
            stage: None,
            source: source.into(),
            status_code: None,
            body: None,
            validation: Vec::new(),
        }
    }

    /// A failure surfaced by a hook handler
    pub fn from_hook(state: LifecycleState, stage: Stage, source: anyhow::Error) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(state, source)
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Use `body` verbatim instead of running the error handler's serializer
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_validation(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.validation = issues;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    /// Explicit status, else the status of an [`HttpError`] source, else 500
    pub fn status_code(&self) -> u16 {
        self.status_code
            .or_else(|| self.source.downcast_ref::<HttpError>().map(|e| e.status))
            .unwrap_or(500)
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn validation(&self) -> &[ValidationIssue] {
        &self.validation
    }

    pub fn message(&self) -> String {
        self.source.to_string()
    }

    pub fn source_error(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn into_source(self) -> anyhow::Error {
        self.source
    }

    /// True when the engine itself reported a bad payload transition
    pub fn is_payload_transition(&self) -> bool {
        matches!(
            self.source.downcast_ref::<HookError>(),
            Some(HookError::InvalidPayloadTransition { .. })
        )
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} hook failed: {}", stage, self.source),
            None => write!(f, "{:?} failed: {}", self.state, self.source),
        }
    }
}
