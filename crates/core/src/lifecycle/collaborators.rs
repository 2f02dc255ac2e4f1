//! Pluggable pieces the driver calls between hook stages

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::{Payload, Reply, Request, RequestContext};
use crate::error::{HttpError, reason_phrase};

/// The route's own handler, run in `Handling`
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<Payload>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RouteHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, anyhow::Result<Payload>>
        + Send
        + Sync,
{
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<Payload> {
        (self.0)(ctx).await
    }
}

/// Wrap a closure as a [`RouteHandler`]
pub fn handler<F>(f: F) -> Arc<dyn RouteHandler>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, anyhow::Result<Payload>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

/// Turns the raw inbound body into a structured value, run in `Parsing`
#[async_trait]
pub trait BodyParser: Send + Sync {
    async fn parse(
        &self,
        request: &Request,
        raw: Payload,
        limit: Option<usize>,
    ) -> anyhow::Result<Value>;
}

/// JSON and plain-text parser.
///
/// An empty body parses to `null`. JSON bodies that fail to parse are a 400,
/// content types other than JSON or `text/*` are a 415.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBodyParser;

#[async_trait]
impl BodyParser for DefaultBodyParser {
    async fn parse(
        &self,
        request: &Request,
        raw: Payload,
        limit: Option<usize>,
    ) -> anyhow::Result<Value> {
        if let Payload::Json(value) = raw {
            return Ok(value);
        }
        let bytes = raw.into_bytes(limit).await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }

        let content_type = request
            .content_type()
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        if content_type == "application/json" || content_type.ends_with("+json") {
            serde_json::from_slice(&bytes).map_err(|e| {
                HttpError::bad_request(format!("Body is not valid JSON: {}", e)).into()
            })
        } else if content_type.starts_with("text/") {
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        } else {
            let shown = if content_type.is_empty() {
                "none".to_string()
            } else {
                content_type
            };
            Err(HttpError::unsupported_media_type(format!(
                "Unsupported Media Type: {}",
                shown
            ))
            .into())
        }
    }
}

/// One failed validation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Checks the parsed request, run in `Validating`
#[cfg_attr(test, mockall::automock)]
pub trait Validator: Send + Sync {
    fn validate(&self, request: &Request) -> Result<(), Vec<ValidationIssue>>;
}

struct FnValidator<F>(F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Request) -> Result<(), Vec<ValidationIssue>> + Send + Sync,
{
    fn validate(&self, request: &Request) -> Result<(), Vec<ValidationIssue>> {
        (self.0)(request)
    }
}

/// Wrap a closure as a [`Validator`]
pub fn validator<F>(f: F) -> Arc<dyn Validator>
where
    F: Fn(&Request) -> Result<(), Vec<ValidationIssue>> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

/// Builds the reply body for a failed request, before `onError` runs.
///
/// The handler sees the failure through [`RequestContext::error`] and may set
/// the status and headers.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<Payload>;
}

/// Replies with the error's status and a `{statusCode, error, message}` body
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<Payload> {
        let Some(err) = ctx.error() else {
            return Ok(Payload::Null);
        };
        let status = err.status_code();
        if let Some(body) = err.body() {
            let body = body.clone();
            ctx.reply_mut().set_status(status)?;
            return Ok(Payload::Bytes(body));
        }

        let mut body = json!({
            "statusCode": status,
            "error": reason_phrase(status),
            "message": err.message(),
        });
        if !err.validation().is_empty() {
            body["validation"] = serde_json::to_value(err.validation())?;
        }
        ctx.reply_mut().set_status(status)?;
        Ok(Payload::Json(body))
    }
}

/// Encodes a structured payload for the wire, run in `Serializing`
pub trait ReplySerializer: Send + Sync {
    fn serialize(&self, value: Value, reply: &mut Reply) -> anyhow::Result<Payload>;
}

/// `serde_json` encoding with a JSON content type unless one was set
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ReplySerializer for JsonSerializer {
    fn serialize(&self, value: Value, reply: &mut Reply) -> anyhow::Result<Payload> {
        if reply.header("content-type").is_none() {
            reply.set_header("content-type", "application/json; charset=utf-8")?;
        }
        Ok(Payload::Text(serde_json::to_string(&value)?))
    }
}

/// Resolves when the transport gives up on a request
pub type TimeoutSignal = BoxFuture<'static, ()>;

/// A signal firing after `after`, or never
pub fn deadline(after: Option<Duration>) -> TimeoutSignal {
    match after {
        Some(after) => tokio::time::sleep(after).boxed(),
        None => futures::future::pending().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HookError, LifecycleError};
    use crate::lifecycle::LifecycleState;

    fn request(content_type: Option<&str>) -> Request {
        let mut request = Request::new("POST", "/items");
        if let Some(ct) = content_type {
            request.headers.insert("content-type".into(), ct.into());
        }
        request
    }

    fn status_of(err: &anyhow::Error) -> Option<u16> {
        err.downcast_ref::<HttpError>().map(|e| e.status)
    }

    #[tokio::test]
    async fn test_parse_json() {
        let parsed = DefaultBodyParser
            .parse(
                &request(Some("application/json; charset=utf-8")),
                Payload::from(r#"{"name":"widget"}"#),
                None,
            )
            .await
            .unwrap();
        assert_eq!(parsed, json!({"name": "widget"}));
    }

    #[tokio::test]
    async fn test_parse_empty_is_null() {
        let parsed = DefaultBodyParser
            .parse(&request(None), Payload::Null, None)
            .await
            .unwrap();
        assert_eq!(parsed, Value::Null);
    }

    #[tokio::test]
    async fn test_parse_text() {
        let parsed = DefaultBodyParser
            .parse(&request(Some("text/plain")), Payload::from("hello"), None)
            .await
            .unwrap();
        assert_eq!(parsed, json!("hello"));
    }

    #[tokio::test]
    async fn test_parse_errors_carry_status() {
        let bad_json = DefaultBodyParser
            .parse(&request(Some("application/json")), Payload::from("{"), None)
            .await
            .unwrap_err();
        assert_eq!(status_of(&bad_json), Some(400));

        let unsupported = DefaultBodyParser
            .parse(&request(Some("application/xml")), Payload::from("<a/>"), None)
            .await
            .unwrap_err();
        assert_eq!(status_of(&unsupported), Some(415));

        let too_large = DefaultBodyParser
            .parse(&request(Some("text/plain")), Payload::from("0123456789"), Some(4))
            .await
            .unwrap_err();
        assert_eq!(status_of(&too_large), Some(413));
    }

    #[tokio::test]
    async fn test_default_error_handler_body() {
        let mut ctx = RequestContext::new(Request::new("GET", "/"), Payload::Null);
        ctx.set_error(LifecycleError::new(
            LifecycleState::Handling,
            HttpError::not_found("no such item"),
        ));

        let payload = DefaultErrorHandler.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.reply().status(), 404);
        assert_eq!(
            payload.as_json(),
            Some(&json!({
                "statusCode": 404,
                "error": "Not Found",
                "message": "no such item"
            }))
        );
    }

    #[tokio::test]
    async fn test_default_error_handler_validation() {
        let mut ctx = RequestContext::new(Request::new("POST", "/"), Payload::Null);
        ctx.set_error(
            LifecycleError::new(
                LifecycleState::Validating,
                HttpError::bad_request("body/name is required"),
            )
            .with_validation(vec![ValidationIssue::new("body/name", "is required")]),
        );

        let payload = DefaultErrorHandler.handle(&mut ctx).await.unwrap();
        let body = payload.as_json().unwrap();
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["validation"][0]["path"], "body/name");
    }

    #[test]
    fn test_json_serializer_sets_content_type() {
        let mut reply = Reply::default();
        let payload = JsonSerializer.serialize(json!({"a": 1}), &mut reply).unwrap();
        assert_eq!(payload.as_text(), Some(r#"{"a":1}"#));
        assert_eq!(
            reply.header("content-type"),
            Some("application/json; charset=utf-8")
        );

        let mut custom = Reply::default();
        custom
            .set_header("content-type", "application/vnd.api+json")
            .unwrap();
        JsonSerializer.serialize(json!(1), &mut custom).unwrap();
        assert_eq!(custom.header("content-type"), Some("application/vnd.api+json"));
    }

    #[test]
    fn test_json_serializer_after_send() {
        let mut reply = Reply::default();
        reply.mark_sent();
        let err = JsonSerializer.serialize(json!(1), &mut reply).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HookError>(),
            Some(HookError::RequestAlreadySent)
        ));
    }

    #[test]
    fn test_mock_validator() {
        let mut mock = MockValidator::new();
        mock.expect_validate()
            .times(1)
            .returning(|_| Err(vec![ValidationIssue::new("query/id", "must be numeric")]));
        let issues = mock.validate(&request(None)).unwrap_err();
        assert_eq!(issues[0].message, "must be numeric");
    }

    #[tokio::test]
    async fn test_deadline_never_fires_without_duration() {
        let fired = tokio::time::timeout(Duration::from_millis(20), deadline(None)).await;
        assert!(fired.is_err());
        deadline(Some(Duration::from_millis(1))).await;
    }
}
