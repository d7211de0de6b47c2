pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod failure;
pub mod handle;
pub mod invoker;
pub mod matcher;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod subscription;

pub use config::EngineConfig;
pub use context::{InterceptContext, TestReport};
pub use dispatch::{ChannelSink, DispatchTarget, ReplyDispatcher, ReplySink, reply_channel};
pub use engine::{InterceptEngine, TeardownSummary};
pub use error::InterceptError;
pub use failure::{
    DeliveryClock, FailureCause, FailureRecord, FailureReporter, TestFailure, Verdict,
};
pub use handle::{
    HandlerResult, InterceptedRequest, InterceptedResponse, RequestAction, ResponseCallback,
};
pub use invoker::HandlerInvoker;
pub use matcher::{RouteMatcher, UrlPattern};
pub use registry::{RouteCallback, RouteHandler, RouteRegistry};
pub use runtime::{EngineCommand, EngineControl, spawn_engine};
pub use session::{RequestSession, SessionState, SessionTracker};
pub use subscription::{AbortedSubscription, SubscriptionResolver, SubscriptionState};
