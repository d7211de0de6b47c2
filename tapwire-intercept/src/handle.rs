//! Handles passed to user callbacks.
//!
//! A route callback receives an [`InterceptedRequest`] during `before:request`.
//! It may read and rewrite the request, answer it directly, or defer its
//! decision to a later phase by registering a continuation that receives an
//! [`InterceptedResponse`] once the proxy reports that phase.
//!
//! # Example
//!
//! ```ignore
//! engine.intercept(RouteMatcher::url("/users/*"), |req| {
//!     req.set_header("x-test", "1");
//!     req.continue_with(|res| {
//!         anyhow::ensure!(res.status_code() == Some(200), "unexpected status");
//!         Ok(())
//!     });
//!     Ok(())
//! });
//! ```

use std::collections::BTreeMap;
use std::fmt;

use tapwire_protocol::{EventData, Phase, RequestId, RouteHandlerId, StaticResponse};

/// Result type for user callbacks.
pub type HandlerResult = anyhow::Result<()>;

/// Continuation run when the proxy reports a later phase.
pub type ResponseCallback = Box<dyn FnOnce(&mut InterceptedResponse) -> HandlerResult + Send>;

/// Terminal decision taken by a route callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    Continue,
    Reply(StaticResponse),
    Destroy,
}

pub(crate) struct Continuation {
    pub(crate) phase: Phase,
    pub(crate) awaiting: bool,
    pub(crate) route_handler_id: RouteHandlerId,
    pub(crate) callback: ResponseCallback,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("phase", &self.phase)
            .field("awaiting", &self.awaiting)
            .field("route_handler_id", &self.route_handler_id)
            .finish_non_exhaustive()
    }
}

pub struct InterceptedRequest {
    request_id: RequestId,
    route_handler_id: RouteHandlerId,
    data: EventData,
    action: Option<RequestAction>,
    continuations: Vec<Continuation>,
    occupied: Vec<Phase>,
    duplicate_await: Option<Phase>,
}

pub(crate) struct RequestParts {
    pub(crate) data: EventData,
    pub(crate) action: Option<RequestAction>,
    pub(crate) continuations: Vec<Continuation>,
    pub(crate) duplicate_await: Option<Phase>,
}

impl InterceptedRequest {
    pub(crate) fn new(
        request_id: RequestId,
        route_handler_id: RouteHandlerId,
        data: EventData,
        occupied: Vec<Phase>,
    ) -> Self {
        Self {
            request_id,
            route_handler_id,
            data,
            action: None,
            continuations: Vec::new(),
            occupied,
            duplicate_await: None,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn route_handler_id(&self) -> &RouteHandlerId {
        &self.route_handler_id
    }

    pub fn method(&self) -> Option<&str> {
        self.data.method.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.data.url.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.data.header(name)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.data.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.data.body.as_deref()
    }

    pub fn set_method(&mut self, method: &str) {
        self.data.method = Some(method.to_ascii_uppercase());
    }

    pub fn set_url(&mut self, url: &str) {
        self.data.url = Some(url.to_string());
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.data.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.data
            .headers
            .retain(|key, _| !key.eq_ignore_ascii_case(name));
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.data.body = Some(body.into());
    }

    /// Send the request on now, with any edits, skipping older handlers.
    pub fn continue_request(&mut self) {
        self.action = Some(RequestAction::Continue);
    }

    /// Send the request on and run `callback` against the response before the
    /// browser sees it.
    pub fn continue_with<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut InterceptedResponse) -> HandlerResult + Send + 'static,
    {
        self.register(Phase::Response, true, Box::new(callback));
        self.action = Some(RequestAction::Continue);
    }

    /// Inspect the response without deciding the request's fate here; older
    /// handlers still run.
    pub fn on_response<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut InterceptedResponse) -> HandlerResult + Send + 'static,
    {
        self.register(Phase::Response, true, Box::new(callback));
    }

    /// Observe the fully received response. The proxy does not wait for it.
    pub fn on_after_response<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut InterceptedResponse) -> HandlerResult + Send + 'static,
    {
        self.register(Phase::AfterResponse, false, Box::new(callback));
    }

    pub fn reply(&mut self, response: StaticResponse) {
        self.action = Some(RequestAction::Reply(response));
    }

    pub fn destroy(&mut self) {
        self.action = Some(RequestAction::Destroy);
    }

    pub fn action(&self) -> Option<&RequestAction> {
        self.action.as_ref()
    }

    fn register(&mut self, phase: Phase, awaiting: bool, callback: ResponseCallback) {
        let taken = self.occupied.contains(&phase)
            || self.continuations.iter().any(|c| c.phase == phase);
        if taken {
            self.duplicate_await.get_or_insert(phase);
            return;
        }
        self.continuations.push(Continuation {
            phase,
            awaiting,
            route_handler_id: self.route_handler_id.clone(),
            callback,
        });
    }

    pub(crate) fn into_parts(self) -> RequestParts {
        RequestParts {
            data: self.data,
            action: self.action,
            continuations: self.continuations,
            duplicate_await: self.duplicate_await,
        }
    }
}

pub struct InterceptedResponse {
    request_id: RequestId,
    route_handler_id: RouteHandlerId,
    phase: Phase,
    data: EventData,
    sent: Option<StaticResponse>,
}

impl InterceptedResponse {
    pub(crate) fn new(
        request_id: RequestId,
        route_handler_id: RouteHandlerId,
        phase: Phase,
        data: EventData,
    ) -> Self {
        Self {
            request_id,
            route_handler_id,
            phase,
            data,
            sent: None,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn route_handler_id(&self) -> &RouteHandlerId {
        &self.route_handler_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status_code(&self) -> Option<u16> {
        self.data.status_code
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.data.header(name)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.data.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.data.body.as_deref()
    }

    pub fn set_status_code(&mut self, status_code: u16) {
        self.data.status_code = Some(status_code);
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.data.headers, name, value);
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.data.body = Some(body.into());
    }

    /// Replace the response entirely. Ignored during `after:response`.
    pub fn send(&mut self, response: StaticResponse) {
        self.sent = Some(response);
    }

    pub(crate) fn into_parts(self) -> (EventData, Option<StaticResponse>) {
        (self.data, self.sent)
    }
}

fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}
