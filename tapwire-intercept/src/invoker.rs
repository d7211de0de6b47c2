use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tapwire_protocol::{EventData, Phase, RequestId, RouteHandlerId, StaticResponse};

use crate::failure::FailureCause;
use crate::handle::{
    Continuation, InterceptedRequest, InterceptedResponse, RequestAction, RequestParts,
    ResponseCallback,
};
use crate::registry::{RouteCallback, RouteRegistry};
use crate::session::RequestSession;

/// Result of running a session's handler chain for `before:request`.
#[derive(Debug)]
pub(crate) struct ChainReport {
    pub(crate) data: EventData,
    pub(crate) mutated: bool,
    /// `None` when every handler passed through.
    pub(crate) action: Option<RequestAction>,
    pub(crate) decided_by: Option<RouteHandlerId>,
    pub(crate) continuations: Vec<Continuation>,
}

#[derive(Debug)]
pub(crate) struct InvocationFailure {
    pub(crate) route_handler_id: RouteHandlerId,
    pub(crate) cause: FailureCause,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResponseDecision {
    Unchanged,
    Mutated(EventData),
    Replaced(StaticResponse),
}

/// Runs user callbacks, turning returned errors and panics into failures.
#[derive(Debug, Default)]
pub struct HandlerInvoker;

impl HandlerInvoker {
    pub fn new() -> Self {
        Self
    }

    /// Runs matching handlers newest first until one acts or edits the
    /// request.
    pub(crate) fn run_chain(
        &self,
        registry: &RouteRegistry,
        session: &mut RequestSession,
    ) -> Result<ChainReport, InvocationFailure> {
        let original = session.request.clone();
        let mut data = original.clone();
        let mut continuations: Vec<Continuation> = Vec::new();

        for (index, route_handler_id) in session.matched_handler_ids.iter().enumerate() {
            session.active_handler_index = index;
            let Some(handler) = registry.get(route_handler_id) else {
                tracing::warn!(request_id = %session.request_id, route = %route_handler_id, "matched handler no longer registered");
                continue;
            };

            tracing::debug!(request_id = %session.request_id, route = %route_handler_id, "invoking route handler");
            let occupied = continuations.iter().map(|c| c.phase).collect();
            let before = data.clone();
            let request = InterceptedRequest::new(
                session.request_id.clone(),
                route_handler_id.clone(),
                data,
                occupied,
            );

            let parts = self
                .invoke(&handler.callback, request)
                .map_err(|message| InvocationFailure {
                    route_handler_id: route_handler_id.clone(),
                    cause: FailureCause::Handler {
                        message,
                        deferred: false,
                    },
                })?;
            if let Some(phase) = parts.duplicate_await {
                return Err(InvocationFailure {
                    route_handler_id: route_handler_id.clone(),
                    cause: FailureCause::DuplicateAwait { phase },
                });
            }

            continuations.extend(parts.continuations);
            let edited = parts.data != before;
            data = parts.data;

            if parts.action.is_some() || edited {
                return Ok(ChainReport {
                    mutated: data != original,
                    data,
                    action: parts.action.or(Some(RequestAction::Continue)),
                    decided_by: Some(route_handler_id.clone()),
                    continuations,
                });
            }
        }

        Ok(ChainReport {
            data,
            mutated: false,
            action: None,
            decided_by: None,
            continuations,
        })
    }

    /// Runs a claimed continuation against the event data of its phase.
    /// Edits and replacements made during `after:response` are discarded.
    pub(crate) fn invoke_continuation(
        &self,
        callback: ResponseCallback,
        request_id: RequestId,
        route_handler_id: RouteHandlerId,
        phase: Phase,
        data: EventData,
    ) -> Result<ResponseDecision, String> {
        let mut response = InterceptedResponse::new(request_id, route_handler_id, phase, data.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut response)));
        flatten(outcome)?;

        if phase == Phase::AfterResponse {
            return Ok(ResponseDecision::Unchanged);
        }
        let (edited, sent) = response.into_parts();
        Ok(match sent {
            Some(replacement) => ResponseDecision::Replaced(replacement),
            None if edited != data => ResponseDecision::Mutated(edited),
            None => ResponseDecision::Unchanged,
        })
    }

    fn invoke(
        &self,
        callback: &RouteCallback,
        mut request: InterceptedRequest,
    ) -> Result<RequestParts, String> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut request)));
        flatten(outcome)?;
        Ok(request.into_parts())
    }
}

fn flatten(outcome: Result<anyhow::Result<()>, Box<dyn Any + Send>>) -> Result<(), String> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
