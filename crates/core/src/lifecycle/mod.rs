//! Request lifecycle: payloads, per-request context, collaborators and the
//! driver that walks a request through its stages

mod collaborators;
mod context;
mod driver;
mod payload;

pub use collaborators::{
    BodyParser, DefaultBodyParser, DefaultErrorHandler, ErrorHandler, JsonSerializer,
    ReplySerializer, RouteHandler, TimeoutSignal, ValidationIssue, Validator, deadline, handler,
    validator,
};
pub use context::{LifecycleState, Reply, Request, RequestContext, Response};
pub use driver::{DispatchReport, LifecycleDriver, ResolvedRoute, RouteChains, Services};
pub use payload::{Payload, PayloadStream};
