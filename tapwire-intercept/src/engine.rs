use std::sync::Arc;

use chrono::Utc;
use tapwire_protocol::{
    Phase, ProxyErrorPayload, ProxyEvent, ReplyOutcome, RequestId, RouteHandlerId,
    SubscriptionGrant, SubscriptionId,
};

use crate::config::EngineConfig;
use crate::dispatch::{DispatchTarget, ReplyDispatcher, ReplySink};
use crate::error::InterceptError;
use crate::failure::{DeliveryClock, FailureCause, FailureRecord, FailureReporter};
use crate::handle::{Continuation, HandlerResult, InterceptedRequest, RequestAction};
use crate::invoker::{HandlerInvoker, ResponseDecision};
use crate::matcher::RouteMatcher;
use crate::registry::{RouteCallback, RouteRegistry};
use crate::session::{RequestSession, SessionState, SessionTracker};
use crate::subscription::{SubscriptionResolver, SubscriptionState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    pub aborted_subscriptions: usize,
    pub dropped_sessions: usize,
    pub cleared_routes: usize,
}

/// Interception state of one test context. Events are processed one at a
/// time in arrival order.
pub struct InterceptEngine {
    config: EngineConfig,
    registry: RouteRegistry,
    sessions: SessionTracker,
    resolver: SubscriptionResolver,
    invoker: HandlerInvoker,
    dispatcher: ReplyDispatcher,
    reporter: Arc<dyn FailureReporter>,
    clock: DeliveryClock,
}

impl InterceptEngine {
    pub fn new(
        config: EngineConfig,
        sink: impl ReplySink + 'static,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            sessions: SessionTracker::new(config.tombstone_capacity),
            config,
            registry: RouteRegistry::new(),
            resolver: SubscriptionResolver::new(),
            invoker: HandlerInvoker::new(),
            dispatcher: ReplyDispatcher::new(sink),
            reporter,
            clock: DeliveryClock::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn intercept<F>(&mut self, matcher: RouteMatcher, callback: F) -> RouteHandlerId
    where
        F: Fn(&mut InterceptedRequest) -> HandlerResult + Send + Sync + 'static,
    {
        self.intercept_callback(matcher, Arc::new(callback))
    }

    pub fn intercept_callback(
        &mut self,
        matcher: RouteMatcher,
        callback: RouteCallback,
    ) -> RouteHandlerId {
        let id = self.registry.register_callback(matcher, callback);
        tracing::debug!(route = %id, "route registered");
        id
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    pub fn session(&self, request_id: &RequestId) -> Option<&RequestSession> {
        self.sessions.get(request_id)
    }

    pub fn session_state(&self, request_id: &RequestId) -> Option<SessionState> {
        self.sessions.state(request_id)
    }

    pub fn pending_subscription(
        &self,
        request_id: &RequestId,
        phase: Phase,
    ) -> Option<SubscriptionId> {
        self.resolver.pending(request_id, phase).cloned()
    }

    pub fn subscription_state(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionState> {
        self.resolver.state(subscription_id)
    }

    /// Subscriptions of live or tombstoned requests, in any state.
    pub fn tracked_subscriptions(&self) -> usize {
        self.resolver.len()
    }

    pub fn answered_replies(&self) -> usize {
        self.dispatcher.answered_len()
    }

    pub fn replies_sent(&self) -> u64 {
        self.dispatcher.sent()
    }

    /// Processes one proxy event. Recoverable errors are logged and the
    /// proxy unblocked before they are returned; fatal ones have already been
    /// reported as failures.
    pub fn handle_event(&mut self, event: ProxyEvent) -> Result<(), InterceptError> {
        let tick = self.clock.tick();
        let request_id = event.effective_request_id();
        let target = DispatchTarget::from_event(&event, &request_id);
        tracing::debug!(
            request_id = %request_id,
            phase = %event.phase,
            route = %event.route_handler_id,
            subscription = ?event.subscription_id(),
            tick,
            "proxy event"
        );

        let result = match event.phase {
            Phase::BeforeRequest => self.before_request(&event, &request_id, &target),
            Phase::Response | Phase::AfterResponse => self.resume(&event, &request_id, target.clone()),
        };
        if let Err(err) = &result {
            if !err.is_fatal() {
                self.recover(&target, err);
            }
        }
        result
    }

    /// Aborts everything still pending and forgets all sessions and routes.
    pub fn teardown(&mut self) -> TeardownSummary {
        let mut aborted = self.resolver.abort_all();
        aborted.sort_by(|left, right| {
            (&left.request_id, left.phase).cmp(&(&right.request_id, right.phase))
        });
        for subscription in aborted.iter().filter(|subscription| subscription.awaiting) {
            self.dispatcher.send(
                &DispatchTarget::from_aborted(subscription),
                ReplyOutcome::Aborted,
                Vec::new(),
            );
        }

        let summary = TeardownSummary {
            aborted_subscriptions: aborted.len(),
            dropped_sessions: self.sessions.clear().len(),
            cleared_routes: self.registry.unregister_all(),
        };
        self.resolver.clear();
        self.dispatcher.clear();
        tracing::debug!(?summary, "interception torn down");
        summary
    }

    fn before_request(
        &mut self,
        event: &ProxyEvent,
        request_id: &RequestId,
        target: &DispatchTarget,
    ) -> Result<(), InterceptError> {
        let matched = self
            .registry
            .match_from(
                &event.route_handler_id,
                event.data.url.as_deref(),
                event.data.method.as_deref(),
            )
            .ok_or_else(|| InterceptError::Correlation {
                request_id: request_id.clone(),
                subscription_id: None,
                reason: format!("unknown route handler {}", event.route_handler_id),
            })?;

        self.sessions
            .begin(request_id.clone(), matched, event.data.clone())?;
        if let Some(error) = &event.data.error {
            return self.fail_from_proxy(event, request_id, target, error.clone());
        }

        let Some(session) = self.sessions.get_mut(request_id) else {
            return Err(InterceptError::Correlation {
                request_id: request_id.clone(),
                subscription_id: None,
                reason: "session vanished".to_string(),
            });
        };
        let chain = self.invoker.run_chain(&self.registry, session);
        let ran: Vec<RouteHandlerId> = session
            .matched_handler_ids
            .iter()
            .take(session.active_handler_index + 1)
            .cloned()
            .collect();
        for id in &ran {
            self.registry.record_dispatch(id);
        }

        let report = match chain {
            Ok(report) => report,
            Err(failure) => {
                return Err(self.fail_session(
                    request_id,
                    target,
                    Phase::BeforeRequest,
                    failure.route_handler_id,
                    failure.cause,
                ));
            }
        };

        let (outcome, next_state) = match report.action {
            Some(RequestAction::Reply(response)) => {
                (ReplyOutcome::Respond { response }, SessionState::Responded)
            }
            Some(RequestAction::Destroy) => (ReplyOutcome::Destroy, SessionState::Completed),
            _ if report.mutated => (
                ReplyOutcome::Mutate {
                    data: report.data.clone(),
                },
                SessionState::Forwarded,
            ),
            _ => (ReplyOutcome::Continue, SessionState::Forwarded),
        };
        tracing::debug!(
            request_id = %request_id,
            route = ?report.decided_by,
            ?next_state,
            "request decided"
        );

        let continuations: Vec<Continuation> = report
            .continuations
            .into_iter()
            .filter(|continuation| match next_state {
                SessionState::Responded => continuation.phase == Phase::AfterResponse,
                SessionState::Completed => false,
                _ => true,
            })
            .collect();

        let mut grants: Vec<SubscriptionGrant> = Vec::with_capacity(continuations.len());
        for continuation in continuations {
            let route_handler_id = continuation.route_handler_id.clone();
            match self.resolver.register(request_id, &event.event_id, continuation) {
                Ok(grant) => grants.push(grant),
                Err(InterceptError::DuplicateAwait { phase, .. }) => {
                    return Err(self.fail_session(
                        request_id,
                        target,
                        Phase::BeforeRequest,
                        route_handler_id,
                        FailureCause::DuplicateAwait { phase },
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(session) = self.sessions.get_mut(request_id) {
            session.request = report.data;
            session.pending_subscription_id = grants
                .iter()
                .find(|grant| grant.awaiting)
                .map(|grant| grant.id.clone());
        }
        self.dispatcher.send(target, outcome, grants);
        if next_state.is_terminal() {
            self.finish_session(request_id, next_state);
        } else {
            self.sessions.transition(request_id, next_state);
        }
        Ok(())
    }

    fn resume(
        &mut self,
        event: &ProxyEvent,
        request_id: &RequestId,
        mut target: DispatchTarget,
    ) -> Result<(), InterceptError> {
        let phase = event.phase;
        if self.sessions.state(request_id).is_some_and(SessionState::is_terminal) {
            self.sessions.check(request_id, phase)?;
        }
        if let Some(subscription_id) = event.subscription_id() {
            if matches!(
                self.resolver.state(subscription_id),
                Some(SubscriptionState::Resolved | SubscriptionState::Aborted)
            ) {
                return Err(InterceptError::AlreadyResolved(subscription_id.clone()));
            }
        }

        self.sessions.check(request_id, phase)?;
        if let Some(error) = &event.data.error {
            return self.fail_from_proxy(event, request_id, &target, error.clone());
        }

        let correlated = match event.subscription_id() {
            Some(subscription_id) => Some(self.resolver.correlate(request_id, subscription_id, phase)?),
            None => self.resolver.correlate_slot(request_id, phase),
        };
        self.sessions.advance(request_id, phase)?;

        let Some(correlated) = correlated else {
            self.complete_phase(request_id, &target, phase, ReplyOutcome::Continue);
            return Ok(());
        };
        target.subscription_id = Some(correlated.subscription_id.clone());
        tracing::debug!(
            request_id = %request_id,
            route = %correlated.route_handler_id,
            subscription = %correlated.subscription_id,
            phase = %phase,
            "resuming continuation"
        );

        let decision = self.invoker.invoke_continuation(
            correlated.callback,
            request_id.clone(),
            correlated.route_handler_id.clone(),
            phase,
            event.data.clone(),
        );
        match decision {
            Ok(decision) => {
                let outcome = match decision {
                    ResponseDecision::Unchanged => ReplyOutcome::Continue,
                    ResponseDecision::Mutated(data) => ReplyOutcome::Mutate { data },
                    ResponseDecision::Replaced(response) => ReplyOutcome::Respond { response },
                };
                self.complete_phase(request_id, &target, phase, outcome);
                Ok(())
            }
            Err(message) => Err(self.fail_session(
                request_id,
                &target,
                phase,
                correlated.route_handler_id,
                FailureCause::Handler {
                    message,
                    deferred: true,
                },
            )),
        }
    }

    fn complete_phase(
        &mut self,
        request_id: &RequestId,
        target: &DispatchTarget,
        phase: Phase,
        outcome: ReplyOutcome,
    ) {
        self.dispatcher.send(target, outcome, Vec::new());
        match phase {
            Phase::AfterResponse => {
                self.abort_pending(request_id, None);
                self.finish_session(request_id, SessionState::Completed);
            }
            _ => {
                let next = self.resolver.pending(request_id, Phase::AfterResponse).cloned();
                if let Some(session) = self.sessions.get_mut(request_id) {
                    session.pending_subscription_id = next;
                }
                self.sessions.transition(request_id, SessionState::Responded);
            }
        }
    }

    /// Fails a request on an error the proxy reported. The route is the one
    /// whose continuation was waiting for this phase, if any.
    fn fail_from_proxy(
        &mut self,
        event: &ProxyEvent,
        request_id: &RequestId,
        target: &DispatchTarget,
        error: ProxyErrorPayload,
    ) -> Result<(), InterceptError> {
        let route_handler_id = self
            .resolver
            .pending_route(request_id, event.phase)
            .cloned()
            .unwrap_or_else(|| event.route_handler_id.clone());
        self.fail_session(
            request_id,
            target,
            event.phase,
            route_handler_id,
            FailureCause::Proxy(error),
        );
        Ok(())
    }

    /// Unblocks the proxy for everything the request still holds, moves the
    /// session to `Errored`, then reports the failure.
    fn fail_session(
        &mut self,
        request_id: &RequestId,
        target: &DispatchTarget,
        phase: Phase,
        route_handler_id: RouteHandlerId,
        cause: FailureCause,
    ) -> InterceptError {
        self.abort_pending(request_id, target.subscription_id.as_ref());

        let outcome = match &cause {
            FailureCause::Proxy(error) => ReplyOutcome::Error {
                error: error.clone(),
            },
            other => ReplyOutcome::handler_failure(&other.to_string()),
        };
        self.dispatcher.send(target, outcome, Vec::new());

        if let Some(session) = self.sessions.get_mut(request_id) {
            session.terminal_error = Some(cause.clone());
            session.pending_subscription_id = None;
        }
        self.finish_session(request_id, SessionState::Errored);

        let record = FailureRecord {
            request_id: request_id.clone(),
            route_handler_id,
            phase,
            cause,
            reported_at: self.clock.now(),
            observed_at: Utc::now().to_rfc3339(),
        };
        tracing::error!(
            request_id = %record.request_id,
            route = %record.route_handler_id,
            phase = %record.phase,
            "{record}"
        );
        let err = failure_error(&record);
        self.reporter.report(record);
        err
    }

    /// Ends a session. Requests whose tombstones fall out of the tracker
    /// also leave the resolver and the dispatcher.
    fn finish_session(&mut self, request_id: &RequestId, state: SessionState) {
        self.sessions.finish(request_id, state);
        for evicted in self.sessions.take_evicted() {
            tracing::trace!(request_id = %evicted, "forgetting request");
            self.resolver.forget_request(&evicted);
            self.dispatcher.forget_request(&evicted);
        }
    }

    fn abort_pending(&mut self, request_id: &RequestId, skip: Option<&SubscriptionId>) {
        for subscription in self.resolver.abort_request(request_id) {
            tracing::debug!(
                request_id = %request_id,
                subscription = %subscription.id,
                phase = %subscription.phase,
                "subscription aborted"
            );
            if !subscription.awaiting || Some(&subscription.id) == skip {
                continue;
            }
            self.dispatcher.send(
                &DispatchTarget::from_aborted(&subscription),
                ReplyOutcome::Aborted,
                Vec::new(),
            );
        }
    }

    fn recover(&mut self, target: &DispatchTarget, err: &InterceptError) {
        tracing::warn!(
            request_id = %target.request_id,
            phase = %target.phase,
            subscription = ?target.subscription_id,
            error = %err,
            "event dropped"
        );
        if target.awaiting && !self.dispatcher.is_answered(target) {
            self.dispatcher.send(target, ReplyOutcome::Continue, Vec::new());
        }
    }
}

fn failure_error(record: &FailureRecord) -> InterceptError {
    match &record.cause {
        FailureCause::DuplicateAwait { phase } => InterceptError::DuplicateAwait {
            request_id: record.request_id.clone(),
            phase: *phase,
        },
        cause => InterceptError::Handler {
            request_id: record.request_id.clone(),
            route_handler_id: record.route_handler_id.clone(),
            phase: record.phase,
            message: cause.to_string(),
        },
    }
}
