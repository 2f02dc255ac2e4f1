//! Per-request state threaded through every hook

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::Payload;
use crate::error::{HookError, LifecycleError};

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Received,
    Parsing,
    Validating,
    Handling,
    Serializing,
    Sending,
    Responded,
    /// Absorbing: the transport gave up on the request
    TimedOut,
    /// Transitional: always proceeds to `Responded`
    Errored,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Responded | LifecycleState::TimedOut)
    }
}

/// Inbound request as handed over by the transport
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub url: String,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    /// Parsed body; `Null` until the body parser has run
    pub body: Value,
    /// Declared path of the matched route, `None` for not-found requests
    pub route_path: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: HashMap::new(),
            body: Value::Null,
            route_path: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Outbound reply. Mutations fail once the reply has been sent.
#[derive(Debug)]
pub struct Reply {
    status: u16,
    headers: BTreeMap<String, String>,
    sent: bool,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            sent: false,
        }
    }
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> Result<&mut Self, HookError> {
        self.ensure_open()?;
        self.status = status;
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn set_header(
        &mut self,
        name: &str,
        value: impl Into<String>,
    ) -> Result<&mut Self, HookError> {
        self.ensure_open()?;
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        Ok(self)
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    fn ensure_open(&self) -> Result<(), HookError> {
        if self.sent {
            Err(HookError::RequestAlreadySent)
        } else {
            Ok(())
        }
    }

    /// Status written by the engine itself on error paths
    pub(crate) fn force_status(&mut self, status: u16) {
        self.status = status;
    }

    pub(crate) fn force_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub(crate) fn clear_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }
}

/// A flushed reply as observed by the caller
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.body)
    }
}

/// Mutable state for one request, owned by its driver and lent to each hook
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request,
    reply: Reply,
    payload: Payload,
    error: Option<LifecycleError>,
    state: LifecycleState,
    early_reply: bool,
    locals: HashMap<String, Value>,
    started: Instant,
}

impl RequestContext {
    /// A fresh context whose payload is the raw inbound body
    pub fn new(request: Request, raw_body: Payload) -> Self {
        Self {
            request,
            reply: Reply::default(),
            payload: raw_body,
            error: None,
            state: LifecycleState::Received,
            early_reply: false,
            locals: HashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn reply_mut(&mut self) -> &mut Reply {
        &mut self.reply
    }

    /// Current payload; its kind depends on the stage
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> Result<&mut Payload, HookError> {
        self.ensure_open()?;
        Ok(&mut self.payload)
    }

    pub fn set_payload(&mut self, payload: Payload) -> Result<(), HookError> {
        self.ensure_open()?;
        self.payload = payload;
        Ok(())
    }

    /// Reply early with `payload`.
    ///
    /// Remaining hooks of the current stage, the later pre-handler stages and
    /// the route handler are skipped; the payload goes through serialization
    /// and `onSend` as usual. Fails while the error path runs.
    pub fn send(&mut self, payload: impl Into<Payload>) -> Result<(), HookError> {
        self.ensure_open()?;
        if self.state == LifecycleState::Errored {
            return Err(HookError::SendWhileErrored);
        }
        self.payload = payload.into();
        self.early_reply = true;
        Ok(())
    }

    pub fn has_early_reply(&self) -> bool {
        self.early_reply
    }

    /// The error being handled, set while the error path runs
    pub fn error(&self) -> Option<&LifecycleError> {
        self.error.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// True once the reply has been flushed
    pub fn is_terminated(&self) -> bool {
        self.reply.is_sent()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Per-request scratch values shared between hooks
    pub fn local(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    fn ensure_open(&self) -> Result<(), HookError> {
        if self.reply.is_sent() {
            Err(HookError::RequestAlreadySent)
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn replace_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub(crate) fn take_payload(&mut self) -> Payload {
        std::mem::take(&mut self.payload)
    }

    pub(crate) fn take_early_reply(&mut self) -> bool {
        std::mem::replace(&mut self.early_reply, false)
    }

    pub(crate) fn set_error(&mut self, error: LifecycleError) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(Request::new("get", "/"), Payload::Null)
    }

    #[test]
    fn test_request_normalizes_method_and_headers() {
        let mut request = Request::new("post", "/items");
        request
            .headers
            .insert("content-type".into(), "application/json".into());
        assert_eq!(request.method, "POST");
        assert_eq!(request.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_send_rejected_on_error_path() {
        let mut ctx = ctx();
        ctx.set_state(LifecycleState::Errored);
        assert!(matches!(ctx.send("body"), Err(HookError::SendWhileErrored)));
        assert!(!ctx.has_early_reply());
        assert!(ctx.payload().is_null());
    }

    #[test]
    fn test_mutations_after_send_fail() {
        let mut ctx = ctx();
        ctx.reply_mut().set_status(201).unwrap();
        ctx.set_payload(Payload::from("body")).unwrap();

        ctx.reply.mark_sent();
        assert!(ctx.is_terminated());
        assert!(matches!(
            ctx.set_payload(Payload::from("late")),
            Err(HookError::RequestAlreadySent)
        ));
        assert!(matches!(
            ctx.reply_mut().set_header("x-late", "1"),
            Err(HookError::RequestAlreadySent)
        ));
        assert!(ctx.payload_mut().is_err());
        assert!(ctx.send("again").is_err());
        assert_eq!(ctx.reply().status(), 201);
    }

    #[test]
    fn test_early_reply_flag() {
        let mut ctx = ctx();
        assert!(!ctx.has_early_reply());
        ctx.send("cached").unwrap();
        assert!(ctx.has_early_reply());
        assert!(ctx.take_early_reply());
        assert!(!ctx.has_early_reply());
        assert_eq!(ctx.payload().as_text(), Some("cached"));
    }

    #[test]
    fn test_locals() {
        let mut ctx = ctx();
        ctx.set_local("user", serde_json::json!({"id": 7}));
        assert_eq!(ctx.local("user").and_then(|v| v["id"].as_i64()), Some(7));
        assert!(ctx.local("missing").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(LifecycleState::Responded.is_terminal());
        assert!(LifecycleState::TimedOut.is_terminal());
        assert!(!LifecycleState::Errored.is_terminal());
        assert!(!LifecycleState::Sending.is_terminal());
    }
}
