//! Sequential execution of one stage's hook chain

use std::sync::Arc;
use tracing::{debug, warn};

use super::{HookHandler, HookResult, Stage};
use crate::error::{HookError, LifecycleError};
use crate::lifecycle::RequestContext;

/// Outcome of running a stage's chain
#[derive(Debug)]
pub enum PipelineResult {
    /// Every handler settled without error. Any replacement payload has
    /// already been written to the context.
    Continue,
    /// A handler failed; the rest of the chain was skipped
    Abort(LifecycleError),
}

impl PipelineResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, PipelineResult::Continue)
    }
}

/// Runs request-stage chains one handler at a time.
///
/// Each handler must settle before the next starts. The first failure stops
/// the chain. An early reply (`RequestContext::send`) also stops it, but only
/// on the stages before the route handler. Returning a payload once the reply
/// is flushed fails with [`HookError::RequestAlreadySent`].
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub async fn run(
        stage: Stage,
        chain: &[Arc<HookHandler>],
        ctx: &mut RequestContext,
    ) -> PipelineResult {
        if chain.is_empty() {
            return PipelineResult::Continue;
        }
        debug!("Running {} {} hook(s)", chain.len(), stage);

        for handler in chain {
            match Self::step(handler, ctx).await {
                Ok(None) => {}
                Ok(Some(payload)) if stage.accepts_payload() => {
                    debug!("Hook '{}' replaced the {} payload", handler.label(), stage);
                    ctx.replace_payload(payload);
                }
                Ok(Some(payload)) if ctx.is_terminated() => {
                    debug!(
                        "Hook '{}' returned a {} payload from {} after the reply was sent",
                        handler.label(),
                        payload.kind(),
                        stage
                    );
                    return Self::abort(stage, handler, ctx, HookError::RequestAlreadySent.into());
                }
                Ok(Some(payload)) => {
                    warn!(
                        "Hook '{}' returned a {} payload from {}; ignoring it",
                        handler.label(),
                        payload.kind(),
                        stage
                    );
                }
                Err(err) => return Self::abort(stage, handler, ctx, err),
            }

            if stage.allows_early_reply() && ctx.has_early_reply() {
                debug!("Hook '{}' replied early; skipping the rest of {}", handler.label(), stage);
                break;
            }
        }
        PipelineResult::Continue
    }

    /// Invoke a single handler and wait for it to settle
    pub(crate) async fn step(handler: &HookHandler, ctx: &mut RequestContext) -> HookResult {
        handler.invoke_request(ctx).await
    }

    pub(crate) fn abort(
        stage: Stage,
        handler: &HookHandler,
        ctx: &RequestContext,
        err: anyhow::Error,
    ) -> PipelineResult {
        debug!("Hook '{}' failed in {}: {}", handler.label(), stage, err);
        PipelineResult::Abort(LifecycleError::from_hook(ctx.state(), stage, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hook;
    use crate::lifecycle::{Payload, Request};
    use crate::scope::ScopeId;
    use serde_json::json;
    use std::sync::Mutex;

    fn chain(hooks: Vec<(Stage, Hook)>) -> Vec<Arc<HookHandler>> {
        hooks
            .into_iter()
            .enumerate()
            .map(|(i, (stage, hook))| Arc::new(HookHandler::new(stage, ScopeId::ROOT, i as u64, hook)))
            .collect()
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Hook {
        let log = Arc::clone(log);
        Hook::request_done(move |_ctx, done| {
            log.lock().unwrap().push(tag);
            done.ok();
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Request::new("GET", "/"), Payload::from("raw"))
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(vec![
            (Stage::OnRequest, recorder(&log, "a")),
            (Stage::OnRequest, recorder(&log, "b")),
            (Stage::OnRequest, recorder(&log, "c")),
        ]);
        let result = PipelineExecutor::run(Stage::OnRequest, &chain, &mut ctx()).await;
        assert!(result.is_continue());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_waits_for_deferred_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow_log = Arc::clone(&log);
        let slow = Hook::request_done(move |_ctx, done| {
            let log = Arc::clone(&slow_log);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                log.lock().unwrap().push("slow");
                done.ok();
            });
        });
        let chain = chain(vec![
            (Stage::PreHandler, slow),
            (Stage::PreHandler, recorder(&log, "next")),
        ]);
        PipelineExecutor::run(Stage::PreHandler, &chain, &mut ctx()).await;
        assert_eq!(*log.lock().unwrap(), vec!["slow", "next"]);
    }

    #[tokio::test]
    async fn test_failure_skips_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(vec![
            (Stage::PreHandler, recorder(&log, "first")),
            (
                Stage::PreHandler,
                Hook::request(|_ctx| Box::pin(async { Err(anyhow::anyhow!("boom")) })),
            ),
            (Stage::PreHandler, recorder(&log, "never")),
        ]);
        let result = PipelineExecutor::run(Stage::PreHandler, &chain, &mut ctx()).await;
        match result {
            PipelineResult::Abort(err) => {
                assert_eq!(err.stage(), Some(Stage::PreHandler));
                assert_eq!(err.message(), "boom");
            }
            PipelineResult::Continue => panic!("expected abort"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_dropped_done_aborts() {
        let chain = chain(vec![(Stage::OnRequest, Hook::request_done(|_ctx, _done| {}))]);
        let result = PipelineExecutor::run(Stage::OnRequest, &chain, &mut ctx()).await;
        assert!(!result.is_continue());
    }

    #[tokio::test]
    async fn test_pre_parsing_replaces_raw_payload() {
        let chain = chain(vec![(
            Stage::PreParsing,
            Hook::request(|_ctx| Box::pin(async { Ok(Some(Payload::from("decoded"))) })),
        )]);
        let mut ctx = ctx();
        PipelineExecutor::run(Stage::PreParsing, &chain, &mut ctx).await;
        assert_eq!(ctx.payload().as_text(), Some("decoded"));
    }

    #[tokio::test]
    async fn test_replacement_ignored_outside_payload_stages() {
        let chain = chain(vec![(
            Stage::OnRequest,
            Hook::request(|_ctx| Box::pin(async { Ok(Some(Payload::from(json!({"x": 1})))) })),
        )]);
        let mut ctx = ctx();
        assert!(PipelineExecutor::run(Stage::OnRequest, &chain, &mut ctx).await.is_continue());
        assert_eq!(ctx.payload().as_text(), Some("raw"));
    }

    #[tokio::test]
    async fn test_early_reply_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(vec![
            (
                Stage::OnRequest,
                Hook::request(|ctx| {
                    Box::pin(async move {
                        ctx.send("cached")?;
                        Ok(None)
                    })
                }),
            ),
            (Stage::OnRequest, recorder(&log, "skipped")),
        ]);
        let mut ctx = ctx();
        assert!(PipelineExecutor::run(Stage::OnRequest, &chain, &mut ctx).await.is_continue());
        assert!(ctx.has_early_reply());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replacement_after_flush_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(vec![
            (
                Stage::OnResponse,
                Hook::request(|_ctx| Box::pin(async { Ok(Some(Payload::from("mutated"))) })),
            ),
            (Stage::OnResponse, recorder(&log, "after")),
        ]);
        let mut ctx = ctx();
        ctx.reply_mut().mark_sent();
        match PipelineExecutor::run(Stage::OnResponse, &chain, &mut ctx).await {
            PipelineResult::Abort(err) => assert!(matches!(
                err.source_error().downcast_ref::<HookError>(),
                Some(HookError::RequestAlreadySent)
            )),
            PipelineResult::Continue => panic!("expected abort"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_early_reply_does_not_stop_later_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(vec![
            (
                Stage::OnSend,
                Hook::request(|ctx| {
                    Box::pin(async move {
                        ctx.send("late")?;
                        Ok(None)
                    })
                }),
            ),
            (Stage::OnSend, recorder(&log, "second")),
        ]);
        let mut ctx = ctx();
        assert!(PipelineExecutor::run(Stage::OnSend, &chain, &mut ctx).await.is_continue());
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }
}
