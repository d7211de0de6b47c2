use tapwire_protocol::{Phase, RequestId, RouteHandlerId, SubscriptionId};
use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("no pending session for request {request_id}: {reason}")]
    Correlation {
        request_id: RequestId,
        subscription_id: Option<SubscriptionId>,
        reason: String,
    },
    #[error("a continuation is already pending for request {request_id} at {phase}")]
    DuplicateAwait { request_id: RequestId, phase: Phase },
    #[error("{message} (route {route_handler_id}, phase {phase})")]
    Handler {
        request_id: RequestId,
        route_handler_id: RouteHandlerId,
        phase: Phase,
        message: String,
    },
    #[error("{phase} event for request {request_id} rejected in state {state:?}")]
    Protocol {
        request_id: RequestId,
        phase: Phase,
        state: SessionState,
    },
    #[error("subscription {0} was already resolved")]
    AlreadyResolved(SubscriptionId),
    #[error("invalid route matcher: {0}")]
    InvalidMatcher(String),
    #[error("interception runtime closed")]
    Closed,
}

impl InterceptError {
    /// Fatal errors fail the owning test; the rest are logged and recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InterceptError::DuplicateAwait { .. } | InterceptError::Handler { .. }
        )
    }
}
