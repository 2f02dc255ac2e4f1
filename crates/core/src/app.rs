//! The application: scope tree, routes and collaborators behind one handle
//!
//! Registration happens on `&mut Application` until [`Application::ready`];
//! after that the tree is sealed and requests are dispatched through
//! [`Application::inject`] on a shared reference.

use std::any::Any;
use std::mem;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{HookError, HttpError};
use crate::hooks::{ApplicationEventBus, Hook, HookHandler, Stage};
use crate::lifecycle::{
    BodyParser, DefaultBodyParser, DefaultErrorHandler, DispatchReport, ErrorHandler,
    JsonSerializer, LifecycleDriver, Payload, ReplySerializer, Request, RequestContext,
    ResolvedRoute, RouteChains, RouteHandler, Services, TimeoutSignal, deadline, handler,
};
use crate::route::{RouteOptions, RouteTable};
use crate::scope::{ScopeId, ScopeOptions, ScopeTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Hooks, scopes and routes may be added
    Building,
    /// Tree sealed; `onReady` running or failed
    Starting,
    Ready,
    Closed,
}

struct PendingRoute {
    scope: ScopeId,
    options: RouteOptions,
    hooks: Vec<Arc<HookHandler>>,
}

/// A request to dispatch in-process
#[derive(Debug)]
pub struct InjectRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Payload,
}

impl InjectRequest {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: Payload::Null,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Payload>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON-encode `value` as the body and set the content type
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("content-type", "application/json")
            .body(value.to_string())
    }
}

pub struct Application {
    config: Config,
    phase: Phase,
    tree: Arc<ScopeTree>,
    pending: RouteTable<PendingRoute>,
    routes: Arc<RouteTable<Arc<ResolvedRoute>>>,
    not_found_route: Option<Arc<ResolvedRoute>>,
    not_found: Arc<dyn RouteHandler>,
    parser: Arc<dyn BodyParser>,
    serializer: Arc<dyn ReplySerializer>,
    error_handler: Arc<dyn ErrorHandler>,
    services: Option<Arc<Services>>,
}

impl Default for Application {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Application {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: Phase::Building,
            tree: Arc::new(ScopeTree::new()),
            pending: RouteTable::new(),
            routes: Arc::new(RouteTable::new()),
            not_found_route: None,
            not_found: default_not_found(),
            parser: Arc::new(DefaultBodyParser),
            serializer: Arc::new(JsonSerializer),
            error_handler: Arc::new(DefaultErrorHandler),
            services: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> ScopeId {
        self.tree.root()
    }

    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    fn ensure_building(&self) -> Result<(), HookError> {
        if self.phase == Phase::Building {
            Ok(())
        } else {
            Err(HookError::AlreadyStarted)
        }
    }

    fn tree_mut(&mut self) -> Result<&mut ScopeTree, HookError> {
        self.ensure_building()?;
        Arc::get_mut(&mut self.tree).ok_or(HookError::AlreadyStarted)
    }

    /// Register `hook` on `scope`, returning the scope for chaining
    pub fn add_hook(&mut self, scope: ScopeId, stage: Stage, hook: Hook) -> Result<ScopeId, HookError> {
        self.tree_mut()?.add_hook(scope, stage, hook)
    }

    /// Register by camelCase stage name (`"onRequest"`, `"preHandler"`, ...)
    pub fn add_hook_named(
        &mut self,
        scope: ScopeId,
        stage: &str,
        hook: Hook,
    ) -> Result<ScopeId, HookError> {
        self.tree_mut()?.add_hook_named(scope, stage, hook)
    }

    pub fn decorate<T: Any + Send + Sync>(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: T,
    ) -> Result<ScopeId, HookError> {
        self.tree_mut()?.decorate(scope, name, value)
    }

    pub fn decorator<T: Any + Send + Sync>(&self, scope: ScopeId, name: &str) -> Option<Arc<T>> {
        self.tree.decorator(scope, name)
    }

    /// Create a child scope of `parent` and run `onRegister` for it
    pub async fn register_scope(
        &mut self,
        parent: ScopeId,
        options: ScopeOptions,
    ) -> Result<ScopeId, HookError> {
        let tree = self.tree_mut()?;
        let child = tree.create_child(parent, options)?;
        ApplicationEventBus::fire_register(tree, child).await?;
        debug!("Registered scope '{}'", tree.name(child).unwrap_or("?"));
        Ok(child)
    }

    /// Declare a route on `scope`.
    ///
    /// The path is the scope's prefix plus `options.url`; `onRoute` hooks see
    /// the options first and may change them.
    pub fn route(&mut self, scope: ScopeId, mut options: RouteOptions) -> Result<(), HookError> {
        let tree = self.tree_mut()?;
        options.mount(&tree.full_prefix(scope)?);
        ApplicationEventBus::fire_route(tree, scope, &mut options)?;

        let mut hooks = Vec::with_capacity(options.hooks.len());
        for (stage, hook) in mem::take(&mut options.hooks) {
            hook.check_stage(stage)?;
            if !stage.is_request_stage() {
                return Err(HookError::IncompatibleHook {
                    stage,
                    expected: "scope-level",
                    found: "route-level",
                });
            }
            hooks.push(Arc::new(HookHandler::new(stage, scope, tree.allocate_seq(), hook)));
        }

        let (method, path) = (options.method.clone(), options.path.clone());
        self.pending.insert(
            &method,
            &path,
            PendingRoute {
                scope,
                options,
                hooks,
            },
        )?;
        debug!("Declared route {} {}", method, path);
        Ok(())
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) -> Result<(), HookError> {
        self.ensure_building()?;
        self.error_handler = handler;
        Ok(())
    }

    /// Handler for requests matching no route; runs through the root scope's hooks
    pub fn set_not_found_handler(&mut self, handler: Arc<dyn RouteHandler>) -> Result<(), HookError> {
        self.ensure_building()?;
        self.not_found = handler;
        Ok(())
    }

    pub fn set_body_parser(&mut self, parser: Arc<dyn BodyParser>) -> Result<(), HookError> {
        self.ensure_building()?;
        self.parser = parser;
        Ok(())
    }

    pub fn set_serializer(&mut self, serializer: Arc<dyn ReplySerializer>) -> Result<(), HookError> {
        self.ensure_building()?;
        self.serializer = serializer;
        Ok(())
    }

    /// Close registration, resolve every route's chains and run `onReady`.
    ///
    /// Idempotent once it has succeeded. An `onReady` failure leaves the
    /// application unable to serve.
    pub async fn ready(&mut self) -> Result<(), HookError> {
        match self.phase {
            Phase::Ready => return Ok(()),
            Phase::Building => {}
            Phase::Starting | Phase::Closed => return Err(HookError::AlreadyStarted),
        }
        self.phase = Phase::Starting;

        let tree = Arc::clone(&self.tree);
        let routes = mem::take(&mut self.pending).try_map(|pending| {
            let chains = RouteChains::resolve(&tree, pending.scope, &pending.hooks)?;
            Ok::<_, HookError>(Arc::new(ResolvedRoute {
                method: pending.options.method,
                path: pending.options.path,
                scope: pending.scope,
                chains,
                handler: pending.options.handler,
                validator: pending.options.validator,
                config: pending.options.config,
            }))
        })?;
        self.routes = Arc::new(routes);

        let root = tree.root();
        self.not_found_route = Some(Arc::new(ResolvedRoute {
            method: "*".to_string(),
            path: "*".to_string(),
            scope: root,
            chains: RouteChains::resolve(&tree, root, &[])?,
            handler: Arc::clone(&self.not_found),
            validator: None,
            config: serde_json::Value::Null,
        }));

        let server = &self.config.server;
        self.services = Some(Arc::new(Services {
            parser: Arc::clone(&self.parser),
            serializer: Arc::clone(&self.serializer),
            error_handler: Arc::clone(&self.error_handler),
            body_limit: Some(server.body_limit),
            log_requests: !server.disable_request_logging,
            log_label: server.request_id_log_label.clone(),
        }));

        ApplicationEventBus::fire_ready(&tree, server.plugin_timeout()).await?;
        self.phase = Phase::Ready;
        info!("Application ready with {} route(s)", self.routes.len());
        Ok(())
    }

    /// Dispatch a request in-process, bounded by the configured connection timeout
    pub async fn inject(&self, request: InjectRequest) -> Result<DispatchReport, HookError> {
        let timeout = deadline(self.config.server.connection_timeout());
        self.inject_with(request, timeout).await
    }

    /// Dispatch a request in-process, ending it `TimedOut` when `timeout` fires
    pub async fn inject_with(
        &self,
        request: InjectRequest,
        timeout: TimeoutSignal,
    ) -> Result<DispatchReport, HookError> {
        if self.phase != Phase::Ready {
            return Err(HookError::NotReady);
        }
        let (Some(services), Some(not_found)) = (&self.services, &self.not_found_route) else {
            return Err(HookError::NotReady);
        };

        let mut inbound = Request::new(&request.method, request.url);
        inbound.headers = request.headers.into_iter().collect();
        inbound.id = inbound
            .header(&self.config.server.request_id_header)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let route = match self.routes.find(&inbound.method, &inbound.url) {
            Some(route) => {
                inbound.route_path = Some(route.path.clone());
                Arc::clone(route)
            }
            None => Arc::clone(not_found),
        };

        let ctx = RequestContext::new(inbound, request.body);
        let driver = LifecycleDriver::new(route, Arc::clone(services));
        Ok(driver.dispatch(ctx, timeout).await)
    }

    /// Run `onClose` in reverse registration order, draining every handler
    pub async fn close(&mut self) -> Result<(), HookError> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        self.phase = Phase::Closed;
        ApplicationEventBus::fire_close(&self.tree, self.config.server.plugin_timeout()).await
    }

    /// The scope tree with each scope's own hook counts
    pub fn print_plugins(&self) -> String {
        self.tree.render()
    }

    /// Declared routes as `(method, path)`, in declaration order
    pub fn routes(&self) -> Vec<(String, String)> {
        if self.phase == Phase::Building {
            self.pending
                .iter()
                .map(|r| (r.options.method.clone(), r.options.path.clone()))
                .collect()
        } else {
            self.routes
                .iter()
                .map(|r| (r.method.clone(), r.path.clone()))
                .collect()
        }
    }
}

fn default_not_found() -> Arc<dyn RouteHandler> {
    handler(|ctx| {
        Box::pin(async move {
            Err(HttpError::not_found(format!(
                "Route {}:{} not found",
                ctx.request.method, ctx.request.url
            ))
            .into())
        })
    })
}
