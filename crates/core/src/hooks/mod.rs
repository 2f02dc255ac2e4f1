//! Hook registration and execution
//!
//! Request stages, in order:
//! - onRequest: as soon as a request is received
//! - preParsing: before the body is parsed (may replace the raw payload)
//! - preValidation: before schema validation
//! - preHandler: before the route handler
//! - preSerialization: before a structured payload is serialized (may replace it)
//! - onSend: before the reply is flushed (may replace the wire payload)
//! - onResponse: after the reply was flushed
//! - onTimeout / onError: alternate paths
//!
//! Application stages: onRoute, onRegister, onReady, onClose.
//!
//! Hooks are registered per scope and inherited root-to-leaf; see
//! [`crate::scope::ScopeTree`].

mod app_events;
mod executor;
mod handler;
mod reducer;
mod registry;
mod stage;

pub use app_events::ApplicationEventBus;
pub use executor::{PipelineExecutor, PipelineResult};
pub use handler::{
    AppHookFn, Completion, Done, HandlerKind, Hook, HookFn, HookHandler, HookResult,
    RegisterHookFn, RequestHookFn, RouteHookFn, Settled,
};
pub use reducer::PayloadReducer;
pub use registry::HookRegistry;
pub use stage::Stage;

/// A resolved, ordered hook chain for one stage
pub type HookChain = std::sync::Arc<[std::sync::Arc<HookHandler>]>;
