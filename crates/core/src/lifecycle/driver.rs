//! Per-request state machine
//!
//! Received -> Parsing -> Validating -> Handling -> Serializing -> Sending
//! -> Responded, with Errored and TimedOut as alternate exits. Each stage
//! runs its resolved hook chain and advances only when the chain continues.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    BodyParser, ErrorHandler, LifecycleState, Payload, ReplySerializer, RequestContext, Response,
    RouteHandler, TimeoutSignal, Validator,
};
use crate::error::{HookError, HttpError, LifecycleError, reason_phrase};
use crate::hooks::{HookChain, HookHandler, PayloadReducer, PipelineExecutor, PipelineResult, Stage};
use crate::scope::{ScopeId, ScopeTree};

/// The hook chain of every request stage for one route
#[derive(Debug, Clone)]
pub struct RouteChains {
    chains: Vec<HookChain>,
}

impl RouteChains {
    /// Resolve (and seal) each request stage of `scope`, then append the
    /// route-level handlers for that stage.
    pub fn resolve(
        tree: &ScopeTree,
        scope: ScopeId,
        route_hooks: &[Arc<HookHandler>],
    ) -> Result<Self, HookError> {
        let mut chains = Vec::with_capacity(Stage::COUNT);
        for stage in Stage::ALL {
            if !stage.is_request_stage() {
                chains.push(HookChain::from(Vec::new()));
                continue;
            }
            let inherited = tree.resolve(scope, stage)?;
            let local: Vec<_> = route_hooks
                .iter()
                .filter(|h| h.stage() == stage)
                .cloned()
                .collect();
            if local.is_empty() {
                chains.push(inherited);
            } else {
                chains.push(inherited.iter().cloned().chain(local).collect());
            }
        }
        Ok(Self { chains })
    }

    pub fn get(&self, stage: Stage) -> &[Arc<HookHandler>] {
        &self.chains[stage.index()]
    }
}

/// A route ready to serve requests: its chains are resolved and sealed
pub struct ResolvedRoute {
    pub method: String,
    pub path: String,
    pub scope: ScopeId,
    pub chains: RouteChains,
    pub handler: Arc<dyn RouteHandler>,
    pub validator: Option<Arc<dyn Validator>>,
    pub config: Value,
}

impl std::fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Collaborators shared by every request of an application
#[derive(Clone)]
pub struct Services {
    pub parser: Arc<dyn BodyParser>,
    pub serializer: Arc<dyn ReplySerializer>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub body_limit: Option<usize>,
    pub log_requests: bool,
    pub log_label: String,
}

/// What happened to one dispatched request
#[derive(Debug)]
pub struct DispatchReport {
    pub request_id: String,
    /// Always terminal: `Responded` or `TimedOut`
    pub state: LifecycleState,
    /// The flushed reply; `None` when the request timed out
    pub response: Option<Response>,
    /// Set when an `onError` handler failed and a fallback 500 was sent
    pub fault: Option<HookError>,
    pub elapsed: Duration,
}

struct Outcome {
    response: Response,
    fault: Option<HookError>,
}

/// Drives one request through its route's lifecycle
pub struct LifecycleDriver {
    route: Arc<ResolvedRoute>,
    services: Arc<Services>,
}

impl LifecycleDriver {
    pub fn new(route: Arc<ResolvedRoute>, services: Arc<Services>) -> Self {
        Self { route, services }
    }

    /// Run `ctx` to a terminal state.
    ///
    /// If `timeout` fires before the reply is flushed, the in-flight stage is
    /// dropped, `onTimeout` runs and the request ends `TimedOut` without
    /// `onResponse`.
    ///
    /// Handlers are awaited without a bound of their own. A completion-signalled
    /// hook that never signals hangs the request until `timeout` fires, and
    /// forever when `timeout` never does (see [`deadline`](super::deadline)).
    pub async fn dispatch(&self, mut ctx: RequestContext, timeout: TimeoutSignal) -> DispatchReport {
        let span = info_span!(
            "request",
            req_id = %ctx.request.id,
            method = %ctx.request.method,
            url = %ctx.request.url
        );
        async move {
            if self.services.log_requests {
                info!(
                    "{}={} incoming request {} {}",
                    self.services.log_label, ctx.request.id, ctx.request.method, ctx.request.url
                );
            }

            let outcome = tokio::select! {
                outcome = self.run(&mut ctx) => Some(outcome),
                _ = timeout => None,
            };

            let report = match outcome {
                Some(outcome) => self.finish(&mut ctx, outcome).await,
                None => self.time_out(&mut ctx).await,
            };

            if self.services.log_requests {
                match &report.response {
                    Some(response) => info!(
                        "{}={} request completed with {} in {:?}",
                        self.services.log_label, report.request_id, response.status, report.elapsed
                    ),
                    None => info!(
                        "{}={} request timed out after {:?}",
                        self.services.log_label, report.request_id, report.elapsed
                    ),
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        let result = match self.before_reply(ctx).await {
            Ok(()) => self.reply(ctx).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(response) => Outcome {
                response,
                fault: None,
            },
            Err(err) => self.handle_error(ctx, err).await,
        }
    }

    /// Run one observer stage. `Ok(true)` means a hook replied early.
    async fn stage(&self, stage: Stage, ctx: &mut RequestContext) -> Result<bool, LifecycleError> {
        match PipelineExecutor::run(stage, self.route.chains.get(stage), ctx).await {
            PipelineResult::Continue => Ok(ctx.has_early_reply()),
            PipelineResult::Abort(err) => Err(err),
        }
    }

    /// Received through Handling. Leaves the handler's result in the payload.
    async fn before_reply(&self, ctx: &mut RequestContext) -> Result<(), LifecycleError> {
        if self.stage(Stage::OnRequest, ctx).await? {
            return Ok(());
        }

        ctx.set_state(LifecycleState::Parsing);
        if self.stage(Stage::PreParsing, ctx).await? {
            return Ok(());
        }
        let raw = ctx.take_payload();
        let body = self
            .services
            .parser
            .parse(&ctx.request, raw, self.services.body_limit)
            .await
            .map_err(|e| LifecycleError::new(LifecycleState::Parsing, e))?;
        ctx.request.body = body;

        ctx.set_state(LifecycleState::Validating);
        if self.stage(Stage::PreValidation, ctx).await? {
            return Ok(());
        }
        if let Some(validator) = &self.route.validator
            && let Err(issues) = validator.validate(&ctx.request)
        {
            let message = issues
                .iter()
                .map(|i| format!("{} {}", i.path, i.message))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(
                LifecycleError::new(LifecycleState::Validating, HttpError::bad_request(message))
                    .with_validation(issues),
            );
        }

        ctx.set_state(LifecycleState::Handling);
        if self.stage(Stage::PreHandler, ctx).await? {
            return Ok(());
        }
        let payload = self
            .route
            .handler
            .handle(ctx)
            .await
            .map_err(|e| LifecycleError::new(LifecycleState::Handling, e))?;
        if !ctx.has_early_reply() {
            ctx.replace_payload(payload);
        }
        Ok(())
    }

    /// Serializing and Sending on the success path
    async fn reply(&self, ctx: &mut RequestContext) -> Result<Response, LifecycleError> {
        ctx.take_early_reply();

        ctx.set_state(LifecycleState::Serializing);
        if let PipelineResult::Abort(err) = PayloadReducer::run(
            Stage::PreSerialization,
            self.route.chains.get(Stage::PreSerialization),
            ctx,
        )
        .await
        {
            return Err(err);
        }
        self.serialize(ctx)
            .map_err(|e| LifecycleError::new(LifecycleState::Serializing, e))?;

        ctx.set_state(LifecycleState::Sending);
        if let PipelineResult::Abort(err) =
            PayloadReducer::run(Stage::OnSend, self.route.chains.get(Stage::OnSend), ctx).await
        {
            return Err(err);
        }
        flush(ctx)
            .await
            .map_err(|e| LifecycleError::new(LifecycleState::Sending, e))
    }

    fn serialize(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        match ctx.take_payload() {
            Payload::Json(value) => {
                let encoded = self.services.serializer.serialize(value, ctx.reply_mut())?;
                if !encoded.is_wire_ready() {
                    return Err(HookError::InvalidPayloadTransition {
                        stage: Stage::PreSerialization,
                        kind: encoded.kind(),
                    }
                    .into());
                }
                ctx.replace_payload(encoded);
            }
            other => ctx.replace_payload(other),
        }
        Ok(())
    }

    /// Errored: error handler, `onError`, serialization and `onSend`, flush
    async fn handle_error(&self, ctx: &mut RequestContext, err: LifecycleError) -> Outcome {
        debug!("Request failed in {:?}: {}", err.state(), err);
        let from_on_send = err.stage() == Some(Stage::OnSend);
        let status = err.status_code();
        if status >= 500 {
            warn!("{}", err);
        }

        ctx.set_state(LifecycleState::Errored);
        ctx.take_early_reply();
        ctx.reply_mut().force_status(status);
        ctx.reply_mut().clear_header("content-type");
        ctx.set_error(err);

        let body = match self.services.error_handler.handle(ctx).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Error handler failed: {}", e);
                ctx.reply_mut().force_status(500);
                Payload::Text(fallback_body(500, &e.to_string()))
            }
        };
        ctx.replace_payload(body);

        if let PipelineResult::Abort(err) =
            PipelineExecutor::run(Stage::OnError, self.route.chains.get(Stage::OnError), ctx).await
        {
            let fault = HookError::OnErrorHandlerFault {
                source: err.into_source(),
            };
            warn!("{}", fault);
            return Outcome {
                response: fallback(ctx, 500, &fault.to_string()),
                fault: Some(fault),
            };
        }
        ctx.take_early_reply();

        if let Err(e) = self.serialize(ctx) {
            warn!("Could not serialize error reply: {}", e);
            return Outcome {
                response: fallback(ctx, 500, &e.to_string()),
                fault: None,
            };
        }

        if !from_on_send
            && let PipelineResult::Abort(err) =
                PayloadReducer::run(Stage::OnSend, self.route.chains.get(Stage::OnSend), ctx).await
        {
            warn!("onSend failed while replying with an error: {}", err);
            return Outcome {
                response: fallback(ctx, 500, &err.message()),
                fault: None,
            };
        }

        match flush(ctx).await {
            Ok(response) => Outcome {
                response,
                fault: None,
            },
            Err(e) => {
                warn!("Could not flush error reply: {}", e);
                Outcome {
                    response: fallback(ctx, 500, &e.to_string()),
                    fault: None,
                }
            }
        }
    }

    /// Responded: run `onResponse` unless the error path already failed
    async fn finish(&self, ctx: &mut RequestContext, outcome: Outcome) -> DispatchReport {
        ctx.set_state(LifecycleState::Responded);
        if outcome.fault.is_none() {
            let chain = self.route.chains.get(Stage::OnResponse);
            if let PipelineResult::Abort(err) =
                PipelineExecutor::run(Stage::OnResponse, chain, ctx).await
            {
                warn!("{}", err);
            }
        }
        DispatchReport {
            request_id: ctx.request.id.clone(),
            state: ctx.state(),
            response: Some(outcome.response),
            fault: outcome.fault,
            elapsed: ctx.elapsed(),
        }
    }

    async fn time_out(&self, ctx: &mut RequestContext) -> DispatchReport {
        warn!(
            "Request timed out in {:?} after {:?}",
            ctx.state(),
            ctx.elapsed()
        );
        ctx.set_state(LifecycleState::TimedOut);
        ctx.reply_mut().mark_sent();

        let chain = self.route.chains.get(Stage::OnTimeout);
        if let PipelineResult::Abort(err) = PipelineExecutor::run(Stage::OnTimeout, chain, ctx).await {
            warn!("{}", err);
        }
        DispatchReport {
            request_id: ctx.request.id.clone(),
            state: LifecycleState::TimedOut,
            response: None,
            fault: None,
            elapsed: ctx.elapsed(),
        }
    }
}

/// Write the wire payload out and mark the reply sent
async fn flush(ctx: &mut RequestContext) -> anyhow::Result<Response> {
    let default_type = match ctx.payload() {
        Payload::Text(_) => Some("text/plain; charset=utf-8"),
        Payload::Bytes(_) | Payload::Stream(_) => Some("application/octet-stream"),
        _ => None,
    };
    if let Some(content_type) = default_type
        && ctx.reply().header("content-type").is_none()
    {
        ctx.reply_mut().force_header("content-type", content_type);
    }

    let body = ctx.take_payload().into_bytes(None).await?;
    let reply = ctx.reply_mut();
    reply.force_header("content-length", body.len().to_string());
    reply.mark_sent();
    Ok(Response {
        status: reply.status(),
        headers: reply.headers().clone(),
        body,
    })
}

/// Last-resort reply when the error path itself failed
fn fallback(ctx: &mut RequestContext, status: u16, message: &str) -> Response {
    let body = fallback_body(status, message);
    let reply = ctx.reply_mut();
    reply.force_status(status);
    reply.force_header("content-type", "application/json; charset=utf-8");
    reply.force_header("content-length", body.len().to_string());
    reply.mark_sent();
    Response {
        status,
        headers: reply.headers().clone(),
        body: body.into(),
    }
}

fn fallback_body(status: u16, message: &str) -> String {
    json!({
        "statusCode": status,
        "error": reason_phrase(status),
        "message": message,
    })
    .to_string()
}
