//! Hookline Core: scoped request-lifecycle hooks.
//!
//! Hooks are registered per scope on a [`scope::ScopeTree`] and inherited
//! root-to-leaf. Each request is walked through its stages by a
//! [`lifecycle::LifecycleDriver`], which runs the resolved chain of every
//! stage and diverts to the error path on the first failure. Application
//! hooks (`onRoute`, `onRegister`, `onReady`, `onClose`) are fired by
//! [`hooks::ApplicationEventBus`]. [`app::Application`] ties it together.

pub mod app;
pub mod config;
pub mod env;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod route;
pub mod scope;

pub use app::{Application, InjectRequest};
pub use config::Config;
pub use error::{HookError, HttpError, LifecycleError};
pub use hooks::{Done, Hook, Stage};
pub use lifecycle::{DispatchReport, LifecycleState, Payload, RequestContext, Response};
pub use route::RouteOptions;
pub use scope::{ScopeId, ScopeOptions, ScopeRef, ScopeTree};
