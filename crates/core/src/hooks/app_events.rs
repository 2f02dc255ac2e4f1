//! Application-lifecycle hooks: onRoute, onRegister, onReady, onClose

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Stage;
use crate::error::HookError;
use crate::route::RouteOptions;
use crate::scope::{ScopeId, ScopeRef, ScopeTree};

/// Fires the non-request stages.
///
/// These run at registration, startup and shutdown, never per request, and
/// never seal a scope.
pub struct ApplicationEventBus;

impl ApplicationEventBus {
    /// Run `onRoute` for a route declared on `scope`, inline.
    ///
    /// Only handlers visible to `scope` (its own and its ancestors') run,
    /// in the order they were registered across the whole tree. They may
    /// edit `options` before the route is stored.
    pub fn fire_route(
        tree: &ScopeTree,
        scope: ScopeId,
        options: &mut RouteOptions,
    ) -> Result<(), HookError> {
        let mut handlers = tree.collect(scope, Stage::OnRoute)?;
        handlers.sort_by_key(|h| h.seq());
        for handler in handlers {
            debug!("onRoute '{}' for {} {}", handler.label(), options.method, options.path);
            handler
                .invoke_route(options)
                .map_err(|source| HookError::HandlerFault {
                    stage: Stage::OnRoute,
                    source,
                })?;
        }
        Ok(())
    }

    /// Run the parent's `onRegister` chain for a freshly created `child`.
    ///
    /// Every handler settles before this returns, so hooks they add to the
    /// child are in place before any request can resolve it.
    pub async fn fire_register(tree: &mut ScopeTree, child: ScopeId) -> Result<(), HookError> {
        if tree.skips_on_register(child) {
            debug!("Scope '{}' opted out of onRegister", tree.name(child).unwrap_or("?"));
            return Ok(());
        }
        let Some(parent) = tree.parent(child) else {
            return Ok(());
        };
        for handler in tree.collect(parent, Stage::OnRegister)? {
            handler
                .invoke_register(tree, child)
                .await
                .map_err(|source| HookError::HandlerFault {
                    stage: Stage::OnRegister,
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every `onReady` handler in registration order.
    ///
    /// Each handler is bounded by `limit`; the first failure or timeout
    /// aborts startup.
    pub async fn fire_ready(
        tree: &Arc<ScopeTree>,
        limit: Option<Duration>,
    ) -> Result<(), HookError> {
        let handlers = tree.all_handlers(Stage::OnReady);
        info!("Running {} onReady hook(s)", handlers.len());

        for handler in handlers {
            let fut = handler.invoke_app(ScopeRef::new(Arc::clone(tree), handler.scope()));
            let result = match limit {
                Some(limit) => timeout(limit, fut).await.map_err(|_| {
                    warn!("onReady '{}' timed out after {:?}", handler.label(), limit);
                    HookError::ReadyTimeout {
                        name: handler.label(),
                        timeout_ms: limit.as_millis() as u64,
                    }
                })?,
                None => fut.await,
            };
            result.map_err(|source| HookError::HandlerFault {
                stage: Stage::OnReady,
                source,
            })?;
        }
        Ok(())
    }

    /// Run every `onClose` handler in reverse registration order.
    ///
    /// A failing or timed-out handler is recorded and the rest still run;
    /// all failures are reported together.
    pub async fn fire_close(
        tree: &Arc<ScopeTree>,
        limit: Option<Duration>,
    ) -> Result<(), HookError> {
        let mut handlers = tree.all_handlers(Stage::OnClose);
        handlers.reverse();
        info!("Running {} onClose hook(s)", handlers.len());

        let mut failures = Vec::new();
        for handler in handlers {
            let fut = handler.invoke_app(ScopeRef::new(Arc::clone(tree), handler.scope()));
            let result = match limit {
                Some(limit) => match timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis())),
                },
                None => fut.await,
            };
            if let Err(e) = result {
                warn!("onClose '{}' failed: {}", handler.label(), e);
                failures.push(format!("{}: {}", handler.label(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookError::ShutdownFailures(failures))
        }
    }
}
