use std::fmt;
use std::sync::Arc;

use tapwire_protocol::RouteHandlerId;

use crate::handle::{HandlerResult, InterceptedRequest};
use crate::matcher::RouteMatcher;

pub type RouteCallback = Arc<dyn Fn(&mut InterceptedRequest) -> HandlerResult + Send + Sync>;

pub struct RouteHandler {
    pub id: RouteHandlerId,
    pub matcher: RouteMatcher,
    pub callback: RouteCallback,
    pub registered_at: u64,
    hits: u32,
}

impl RouteHandler {
    pub fn hits(&self) -> u32 {
        self.hits
    }

    fn is_exhausted(&self) -> bool {
        self.matcher
            .times_limit()
            .is_some_and(|limit| self.hits >= limit)
    }
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteHandler")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .field("registered_at", &self.registered_at)
            .field("hits", &self.hits)
            .finish_non_exhaustive()
    }
}

/// Route handlers of one test, kept in registration order.
#[derive(Debug)]
pub struct RouteRegistry {
    handlers: Vec<RouteHandler>,
    next_ordinal: u64,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            next_ordinal: 1,
        }
    }

    pub fn register<F>(&mut self, matcher: RouteMatcher, callback: F) -> RouteHandlerId
    where
        F: Fn(&mut InterceptedRequest) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_callback(matcher, Arc::new(callback))
    }

    pub fn register_callback(
        &mut self,
        matcher: RouteMatcher,
        callback: RouteCallback,
    ) -> RouteHandlerId {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let id = RouteHandlerId::new(ordinal.to_string());
        self.handlers.push(RouteHandler {
            id: id.clone(),
            matcher,
            callback,
            registered_at: ordinal,
            hits: 0,
        });
        id
    }

    pub fn get(&self, id: &RouteHandlerId) -> Option<&RouteHandler> {
        self.handlers.iter().find(|handler| &handler.id == id)
    }

    /// Live handlers matching the request, most recently registered first.
    pub fn match_request(&self, url: &str, method: Option<&str>) -> Vec<RouteHandlerId> {
        self.handlers
            .iter()
            .rev()
            .filter(|handler| !handler.is_exhausted() && handler.matcher.matches(url, method))
            .map(|handler| handler.id.clone())
            .collect()
    }

    /// Handler chain for a request the proxy attributed to `target`: the
    /// target itself, then older handlers that also match. Returns `None` when
    /// `target` is not registered.
    pub fn match_from(
        &self,
        target: &RouteHandlerId,
        url: Option<&str>,
        method: Option<&str>,
    ) -> Option<Vec<RouteHandlerId>> {
        let position = self.handlers.iter().position(|handler| &handler.id == target)?;
        let mut chain = Vec::new();
        if !self.handlers[position].is_exhausted() {
            chain.push(target.clone());
        }
        if let Some(url) = url {
            chain.extend(
                self.handlers[..position]
                    .iter()
                    .rev()
                    .filter(|handler| {
                        !handler.is_exhausted() && handler.matcher.matches(url, method)
                    })
                    .map(|handler| handler.id.clone()),
            );
        }
        Some(chain)
    }

    pub fn record_dispatch(&mut self, id: &RouteHandlerId) {
        if let Some(handler) = self.handlers.iter_mut().find(|handler| &handler.id == id) {
            handler.hits += 1;
        }
    }

    pub fn unregister_all(&mut self) -> usize {
        let cleared = self.handlers.len();
        self.handlers.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}
