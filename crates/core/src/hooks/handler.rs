//! Hook handlers and their execution modes
//!
//! The engine runs every handler as a future. Completion-signalled handlers
//! (the `*_done` constructors) receive a [`Done`] handle instead and are
//! adapted onto the same deferred mode: the adapter invokes the handler and
//! then waits for the handle to be signalled.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::warn;

use super::Stage;
use crate::error::HookError;
use crate::lifecycle::{Payload, RequestContext};
use crate::route::RouteOptions;
use crate::scope::{ScopeId, ScopeRef, ScopeTree};

/// Outcome of a request hook: `Ok(None)` continues with the payload as-is,
/// `Ok(Some(p))` replaces it (payload stages only), `Err` aborts the chain.
pub type HookResult = anyhow::Result<Option<Payload>>;

pub type RequestHookFn =
    Arc<dyn for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HookResult> + Send + Sync>;
pub type RouteHookFn = Arc<dyn Fn(&mut RouteOptions) -> anyhow::Result<()> + Send + Sync>;
pub type RegisterHookFn = Arc<
    dyn for<'a> Fn(&'a mut ScopeTree, ScopeId) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
>;
pub type AppHookFn = Arc<dyn Fn(ScopeRef) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// How a handler reports that it is finished, fixed at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Returns a future whose output settles the handler
    Deferred,
    /// Receives a [`Done`] handle and must signal it exactly once
    CompletionSignaled,
    /// Runs to completion inline (`onRoute` only)
    Synchronous,
}

/// The callable, in the shape its stage expects
#[derive(Clone)]
pub enum HookFn {
    Request(RequestHookFn),
    Route(RouteHookFn),
    Register(RegisterHookFn),
    App(AppHookFn),
}

impl HookFn {
    fn shape(&self) -> &'static str {
        match self {
            HookFn::Request(_) => "request",
            HookFn::Route(_) => "route",
            HookFn::Register(_) => "register",
            HookFn::App(_) => "application",
        }
    }
}

/// What a completion-signalled handler reported
#[derive(Debug)]
pub enum Completion {
    Continue,
    Replace(Payload),
    Fail(anyhow::Error),
}

/// Completion handle passed to completion-signalled handlers.
///
/// Clones share one underlying signal; only the first signal counts and any
/// later one is logged and dropped. Dropping every clone without signalling
/// fails the handler.
///
/// A handle that is kept alive but never signalled stalls its stage, and the
/// request with it, until the transport's timeout signal fires. With no
/// connection timeout configured the request never completes.
#[derive(Clone)]
pub struct Done {
    slot: Arc<Mutex<Option<oneshot::Sender<Completion>>>>,
}

/// Receiving side of a [`Done`] handle
pub struct Settled {
    rx: oneshot::Receiver<Completion>,
}

impl Done {
    pub fn channel() -> (Done, Settled) {
        let (tx, rx) = oneshot::channel();
        (
            Done {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            Settled { rx },
        )
    }

    /// Continue with the payload unchanged
    pub fn ok(&self) {
        self.signal(Completion::Continue);
    }

    /// Continue with a replacement payload
    pub fn replace(&self, payload: Payload) {
        self.signal(Completion::Replace(payload));
    }

    /// Abort the chain with `err`
    pub fn fail(&self, err: impl Into<anyhow::Error>) {
        self.signal(Completion::Fail(err.into()));
    }

    pub fn signal(&self, completion: Completion) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // Receiver gone means the request was already abandoned
                let _ = tx.send(completion);
            }
            None => {
                warn!("hook completion signalled more than once; ignoring {:?}", completion);
            }
        }
    }
}

impl Settled {
    pub async fn wait(self) -> Completion {
        self.rx.await.unwrap_or_else(|_| {
            Completion::Fail(anyhow::anyhow!(
                "completion handle dropped without being signalled"
            ))
        })
    }

    async fn into_hook_result(self) -> HookResult {
        match self.wait().await {
            Completion::Continue => Ok(None),
            Completion::Replace(payload) => Ok(Some(payload)),
            Completion::Fail(err) => Err(err),
        }
    }

    async fn into_unit_result(self) -> anyhow::Result<()> {
        match self.wait().await {
            Completion::Continue | Completion::Replace(_) => Ok(()),
            Completion::Fail(err) => Err(err),
        }
    }
}

fn request_fn<F>(f: F) -> RequestHookFn
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HookResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn register_fn<F>(f: F) -> RegisterHookFn
where
    F: for<'a> Fn(&'a mut ScopeTree, ScopeId) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// A hook callable plus its execution mode, not yet bound to a stage
#[derive(Clone)]
pub struct Hook {
    name: Option<String>,
    kind: HandlerKind,
    callable: HookFn,
}

impl Hook {
    /// Request-stage hook returning a future
    pub fn request<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HookResult>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: None,
            kind: HandlerKind::Deferred,
            callable: HookFn::Request(request_fn(f)),
        }
    }

    /// Request-stage hook that signals completion through [`Done`]
    pub fn request_done<F>(f: F) -> Self
    where
        F: Fn(&mut RequestContext, Done) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: None,
            kind: HandlerKind::CompletionSignaled,
            callable: HookFn::Request(request_fn(move |ctx| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let (done, settled) = Done::channel();
                    f(ctx, done);
                    settled.into_hook_result().await
                })
            })),
        }
    }

    /// `onRoute` hook; runs inline and may edit the route before it is stored
    pub fn route<F>(f: F) -> Self
    where
        F: Fn(&mut RouteOptions) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: None,
            kind: HandlerKind::Synchronous,
            callable: HookFn::Route(Arc::new(f)),
        }
    }

    /// `onRegister` hook returning a future; receives the tree and the new scope
    pub fn register<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ScopeTree, ScopeId) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: None,
            kind: HandlerKind::Deferred,
            callable: HookFn::Register(register_fn(f)),
        }
    }

    /// `onRegister` hook that signals completion through [`Done`]
    pub fn register_done<F>(f: F) -> Self
    where
        F: Fn(&mut ScopeTree, ScopeId, Done) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: None,
            kind: HandlerKind::CompletionSignaled,
            callable: HookFn::Register(register_fn(move |tree, scope| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let (done, settled) = Done::channel();
                    f(tree, scope, done);
                    settled.into_unit_result().await
                })
            })),
        }
    }

    /// `onReady` / `onClose` hook returning a future
    pub fn app<F, Fut>(f: F) -> Self
    where
        F: Fn(ScopeRef) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: None,
            kind: HandlerKind::Deferred,
            callable: HookFn::App(Arc::new(
                move |scope| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(scope)) },
            )),
        }
    }

    /// `onReady` / `onClose` hook that signals completion through [`Done`]
    pub fn app_done<F>(f: F) -> Self
    where
        F: Fn(ScopeRef, Done) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: None,
            kind: HandlerKind::CompletionSignaled,
            callable: HookFn::App(Arc::new(
                move |scope| -> BoxFuture<'static, anyhow::Result<()>> {
                    let (done, settled) = Done::channel();
                    f(scope, done);
                    Box::pin(settled.into_unit_result())
                },
            )),
        }
    }

    /// Attach a name, used in logs and error messages
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Check that this callable has the shape `stage` runs
    pub fn check_stage(&self, stage: Stage) -> Result<(), HookError> {
        let expected = match stage {
            Stage::OnRoute => "route",
            Stage::OnRegister => "register",
            Stage::OnReady | Stage::OnClose => "application",
            _ => "request",
        };
        let found = self.callable.shape();
        if found == expected {
            Ok(())
        } else {
            Err(HookError::IncompatibleHook {
                stage,
                expected,
                found,
            })
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shape", &self.callable.shape())
            .finish()
    }
}

/// A hook bound to a stage and an owning scope. Immutable once registered.
#[derive(Debug)]
pub struct HookHandler {
    stage: Stage,
    scope: ScopeId,
    seq: u64,
    hook: Hook,
}

impl HookHandler {
    pub(crate) fn new(stage: Stage, scope: ScopeId, seq: u64, hook: Hook) -> Self {
        Self {
            stage,
            scope,
            seq,
            hook,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Scope the handler was registered on
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Tree-wide registration sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> HandlerKind {
        self.hook.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.hook.name()
    }

    /// Name for logs: the explicit name, else `<stage>#<seq>`
    pub fn label(&self) -> String {
        match self.hook.name() {
            Some(name) => name.to_string(),
            None => format!("{}#{}", self.stage, self.seq),
        }
    }

    pub(crate) fn invoke_request<'a>(
        &self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, HookResult> {
        match &self.hook.callable {
            HookFn::Request(f) => f(ctx),
            other => mismatch(self.stage, other.shape()),
        }
    }

    pub(crate) fn invoke_route(&self, options: &mut RouteOptions) -> anyhow::Result<()> {
        match &self.hook.callable {
            HookFn::Route(f) => f(options),
            other => Err(anyhow::anyhow!(
                "{} handler registered for {}",
                other.shape(),
                self.stage
            )),
        }
    }

    pub(crate) fn invoke_register<'a>(
        &self,
        tree: &'a mut ScopeTree,
        scope: ScopeId,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        match &self.hook.callable {
            HookFn::Register(f) => f(tree, scope),
            other => mismatch(self.stage, other.shape()),
        }
    }

    pub(crate) fn invoke_app(&self, scope: ScopeRef) -> BoxFuture<'static, anyhow::Result<()>> {
        match &self.hook.callable {
            HookFn::App(f) => f(scope),
            other => mismatch(self.stage, other.shape()),
        }
    }
}

fn mismatch<'a, T: Send + 'a>(
    stage: Stage,
    shape: &'static str,
) -> BoxFuture<'a, anyhow::Result<T>> {
    let err = anyhow::anyhow!("{} handler registered for {}", shape, stage);
    Box::pin(async move { Err(err) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_done_first_signal_wins() {
        let (done, settled) = Done::channel();
        done.replace(Payload::Text("first".into()));
        done.fail(anyhow::anyhow!("late"));

        match settled.wait().await {
            Completion::Replace(Payload::Text(s)) => assert_eq!(s, "first"),
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_done_dropped_is_failure() {
        let (done, settled) = Done::channel();
        drop(done);
        assert!(matches!(settled.wait().await, Completion::Fail(_)));
    }

    #[tokio::test]
    async fn test_done_signalled_from_another_task() {
        let (done, settled) = Done::channel();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            done.ok();
        });
        assert!(matches!(settled.wait().await, Completion::Continue));
    }

    #[test]
    fn test_kinds() {
        let deferred = Hook::request(|_ctx| Box::pin(async { Ok(None) }));
        assert_eq!(deferred.kind(), HandlerKind::Deferred);

        let signalled = Hook::request_done(|_ctx, done| done.ok());
        assert_eq!(signalled.kind(), HandlerKind::CompletionSignaled);

        let route = Hook::route(|_opts| Ok(()));
        assert_eq!(route.kind(), HandlerKind::Synchronous);
    }

    #[test]
    fn test_check_stage() {
        let request = Hook::request_done(|_ctx, done| done.ok());
        assert!(request.check_stage(Stage::PreHandler).is_ok());
        assert!(request.check_stage(Stage::OnError).is_ok());

        let err = request.check_stage(Stage::OnClose).unwrap_err();
        assert!(matches!(
            err,
            HookError::IncompatibleHook {
                stage: Stage::OnClose,
                expected: "application",
                found: "request"
            }
        ));

        let app = Hook::app(|_scope| async { Ok(()) });
        assert!(app.check_stage(Stage::OnReady).is_ok());
        assert!(app.check_stage(Stage::OnRoute).is_err());
    }

    #[test]
    fn test_named_label() {
        let hook = Hook::request_done(|_ctx, done| done.ok()).named("auth");
        let handler = HookHandler::new(Stage::OnRequest, ScopeId::ROOT, 3, hook);
        assert_eq!(handler.label(), "auth");

        let anon = HookHandler::new(
            Stage::OnRequest,
            ScopeId::ROOT,
            4,
            Hook::request_done(|_ctx, done| done.ok()),
        );
        assert_eq!(anon.label(), "onRequest#4");
    }
}
