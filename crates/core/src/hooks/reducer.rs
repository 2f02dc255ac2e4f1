//! Payload-transforming stages: `preSerialization` and `onSend`

use std::sync::Arc;
use tracing::debug;

use super::{HookHandler, PipelineExecutor, PipelineResult, Stage};
use crate::error::{HookError, LifecycleError};
use crate::lifecycle::RequestContext;

/// Folds a payload through a reducer stage's chain, left to right.
///
/// Each handler sees the payload produced by the one before it. Every
/// replacement returned from `onSend` must be wire-ready. Stages that do not
/// transform payloads are handed to [`PipelineExecutor`].
pub struct PayloadReducer;

impl PayloadReducer {
    pub async fn run(
        stage: Stage,
        chain: &[Arc<HookHandler>],
        ctx: &mut RequestContext,
    ) -> PipelineResult {
        if !stage.is_reducer() {
            return PipelineExecutor::run(stage, chain, ctx).await;
        }
        if stage == Stage::PreSerialization && ctx.payload().is_wire_ready() {
            debug!(
                "Skipping preSerialization: {} payload is already wire-ready",
                ctx.payload().kind()
            );
            return PipelineResult::Continue;
        }

        for handler in chain {
            match PipelineExecutor::step(handler, ctx).await {
                Ok(Some(payload)) => ctx.replace_payload(payload),
                Ok(None) => continue,
                Err(err) => return PipelineExecutor::abort(stage, handler, ctx, err),
            }

            if stage == Stage::OnSend && !ctx.payload().is_wire_ready() {
                let err = HookError::InvalidPayloadTransition {
                    stage,
                    kind: ctx.payload().kind(),
                };
                debug!("Hook '{}' broke the onSend payload: {}", handler.label(), err);
                return PipelineResult::Abort(LifecycleError::from_hook(
                    ctx.state(),
                    stage,
                    err.into(),
                ));
            }
        }
        PipelineResult::Continue
    }
}
