use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use tapwire_intercept::{
    EngineConfig, FailureCause, InterceptEngine, InterceptError, RouteMatcher, SessionState,
    SubscriptionState, Verdict, reply_channel,
};
use tapwire_protocol::{
    EventData, Phase, ProxyEvent, ProxyReply, ReplyOutcome, RequestId, RouteHandlerId,
    StaticResponse, SubscriptionId,
};
use tokio::sync::mpsc::UnboundedReceiver;

const USERS: &str = "https://app.test/users";

fn engine() -> (InterceptEngine, UnboundedReceiver<ProxyReply>, Verdict) {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> (InterceptEngine, UnboundedReceiver<ProxyReply>, Verdict) {
    let verdict = Verdict::new();
    let (sink, replies) = reply_channel();
    let engine = InterceptEngine::new(config, sink, Arc::new(verdict.clone()));
    (engine, replies, verdict)
}

fn before_request(route: &RouteHandlerId, request: &str) -> ProxyEvent {
    ProxyEvent::new(Phase::BeforeRequest, &format!("{request}-before"), route)
        .with_request_id(request)
        .awaited()
        .with_data(EventData::request("GET", USERS))
}

fn response(route: &RouteHandlerId, request: &str, subscription: Option<&SubscriptionId>) -> ProxyEvent {
    let event = ProxyEvent::new(Phase::Response, &format!("{request}-response"), route)
        .with_request_id(request)
        .awaited()
        .with_data(EventData::response(200));
    match subscription {
        Some(id) => event.with_subscription(id.clone()),
        None => event,
    }
}

fn after_response(route: &RouteHandlerId, request: &str) -> ProxyEvent {
    ProxyEvent::new(Phase::AfterResponse, &format!("{request}-after"), route)
        .with_request_id(request)
        .with_data(EventData::response(200))
}

fn granted(reply: &ProxyReply, phase: Phase) -> SubscriptionId {
    reply
        .subscribe
        .iter()
        .find(|grant| grant.phase == phase)
        .map(|grant| grant.id.clone())
        .unwrap()
}

#[test]
fn sync_assertion_failure_unblocks_proxy_and_fails_test() {
    let (mut engine, mut replies, verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |_req| {
        assert_eq!(1 + 1, 3, "expected 2 to equal 3");
        Ok(())
    });

    let err = engine.handle_event(before_request(&route, "1")).unwrap_err();
    assert_matches!(err, InterceptError::Handler { phase: Phase::BeforeRequest, .. });

    let reply = replies.try_recv().unwrap();
    assert!(reply.awaited);
    assert_matches!(reply.outcome, ReplyOutcome::Error { ref error } if error.name == "HandlerFailure");
    assert!(replies.try_recv().is_err());

    let failure = verdict.check().unwrap_err();
    assert!(failure.message.contains("expected 2 to equal 3"));
    assert!(failure.message.ends_with("(route 1, phase before:request)"));
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Errored)
    );
}

#[test]
fn deferred_failure_is_attributed_to_response_phase() {
    let (mut engine, mut replies, verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|res| {
            anyhow::ensure!(res.status_code() == Some(201), "expected 'b' to equal 'c'");
            Ok(())
        });
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let forwarded = replies.try_recv().unwrap();
    assert_eq!(forwarded.outcome, ReplyOutcome::Continue);
    let subscription = granted(&forwarded, Phase::Response);
    assert_eq!(
        engine.pending_subscription(&RequestId::from("1"), Phase::Response),
        Some(subscription.clone())
    );

    let err = engine
        .handle_event(response(&route, "1", Some(&subscription)))
        .unwrap_err();
    assert_matches!(err, InterceptError::Handler { phase: Phase::Response, .. });

    let resolution = replies.try_recv().unwrap();
    assert_eq!(resolution.subscription_id.as_ref(), Some(&subscription));
    assert_matches!(resolution.outcome, ReplyOutcome::Error { .. });
    assert!(replies.try_recv().is_err());

    let records = verdict.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].phase, Phase::Response);
    assert_matches!(records[0].cause, FailureCause::Handler { deferred: true, .. });
    assert_eq!(
        verdict.check().unwrap_err().message,
        "expected 'b' to equal 'c' (route 1, phase response)"
    );
    assert_eq!(
        engine.subscription_state(&subscription),
        Some(SubscriptionState::Resolved)
    );
}

#[test]
fn proxy_error_skips_pending_reply() {
    let (mut engine, mut replies, verdict) = engine();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = ran.clone();
    let route = engine.intercept(RouteMatcher::url(USERS), move |req| {
        let observed = observed.clone();
        req.continue_with(move |_res| {
            observed.store(true, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);

    let failed = response(&route, "1", Some(&subscription))
        .with_data(EventData::failed("ResponseError", "it errored"));
    engine.handle_event(failed).unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    let reply = replies.try_recv().unwrap();
    assert_matches!(reply.outcome, ReplyOutcome::Error { ref error } if error.message == "it errored");
    assert!(replies.try_recv().is_err());
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Errored)
    );
    assert_eq!(
        engine.subscription_state(&subscription),
        Some(SubscriptionState::Aborted)
    );

    let records = verdict.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].route_handler_id, route);
    assert_matches!(records[0].cause, FailureCause::Proxy(ref error) if error.name == "ResponseError");
}

#[test]
fn proxy_error_on_after_response_skips_listener() {
    let (mut engine, mut replies, verdict) = engine();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = ran.clone();
    let route = engine.intercept(RouteMatcher::url(USERS), move |req| {
        let observed = observed.clone();
        req.on_after_response(move |_res| {
            observed.store(true, Ordering::SeqCst);
            Ok(())
        });
        req.continue_request();
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let forwarded = replies.try_recv().unwrap();
    assert!(!forwarded.subscribe[0].awaiting);

    let failed = after_response(&route, "1").with_data(EventData::failed("ResponseError", "it errored"));
    engine.handle_event(failed).unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Errored)
    );
    assert_matches!(verdict.records()[0].cause, FailureCause::Proxy(_));
    assert_eq!(verdict.records()[0].phase, Phase::AfterResponse);
}

#[test]
fn newer_pass_through_handler_falls_back_to_older() {
    let (mut engine, mut replies, verdict) = engine();
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    engine.intercept(RouteMatcher::url("*/users"), move |req| {
        seen.lock().unwrap().push("older");
        req.set_header("x-handled-by", "older");
        Ok(())
    });
    let seen = order.clone();
    let newer = engine.intercept(RouteMatcher::url(USERS), move |_req| {
        seen.lock().unwrap().push("newer");
        Ok(())
    });

    engine.handle_event(before_request(&newer, "1")).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["newer", "older"]);
    let reply = replies.try_recv().unwrap();
    assert_matches!(
        reply.outcome,
        ReplyOutcome::Mutate { ref data } if data.header("X-Handled-By") == Some("older")
    );
    assert!(verdict.check().is_ok());
}

#[test]
fn acting_handler_stops_the_chain() {
    let (mut engine, mut replies, _verdict) = engine();
    let older_ran = Arc::new(AtomicBool::new(false));
    let observed = older_ran.clone();
    engine.intercept(RouteMatcher::url(USERS), move |_req| {
        observed.store(true, Ordering::SeqCst);
        Ok(())
    });
    let newer = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.reply(StaticResponse::new(204).with_body("stubbed"));
        Ok(())
    });

    engine.handle_event(before_request(&newer, "1")).unwrap();

    assert!(!older_ran.load(Ordering::SeqCst));
    assert_matches!(
        replies.try_recv().unwrap().outcome,
        ReplyOutcome::Respond { ref response } if response.status_code == 204
    );
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Responded)
    );
}

#[test]
fn no_handler_acting_continues_unmodified() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |_req| Ok(()));

    engine.handle_event(before_request(&route, "1")).unwrap();
    let reply = replies.try_recv().unwrap();
    assert_eq!(reply.outcome, ReplyOutcome::Continue);
    assert!(reply.subscribe.is_empty());

    engine.handle_event(response(&route, "1", None)).unwrap();
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Continue);
    engine.handle_event(after_response(&route, "1")).unwrap();
    assert!(!replies.try_recv().unwrap().awaited);
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Completed)
    );
}

#[test]
fn continuation_can_rewrite_or_replace_the_response() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        if req.header("x-replace").is_some() {
            req.continue_with(|res| {
                res.send(StaticResponse::new(503));
                Ok(())
            });
        } else {
            req.continue_with(|res| {
                res.set_status_code(500);
                Ok(())
            });
        }
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let first = granted(&replies.try_recv().unwrap(), Phase::Response);
    engine
        .handle_event(response(&route, "1", Some(&first)))
        .unwrap();
    assert_matches!(
        replies.try_recv().unwrap().outcome,
        ReplyOutcome::Mutate { ref data } if data.status_code == Some(500)
    );

    let mut replaced = before_request(&route, "2");
    replaced.data.headers.insert("x-replace".to_string(), "1".to_string());
    engine.handle_event(replaced).unwrap();
    let second = granted(&replies.try_recv().unwrap(), Phase::Response);
    engine
        .handle_event(response(&route, "2", Some(&second)))
        .unwrap();
    assert_matches!(
        replies.try_recv().unwrap().outcome,
        ReplyOutcome::Respond { ref response } if response.status_code == 503
    );
}

#[test]
fn response_without_subscription_id_uses_the_pending_slot() {
    let (mut engine, mut replies, _verdict) = engine();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = ran.clone();
    let route = engine.intercept(RouteMatcher::url(USERS), move |req| {
        let observed = observed.clone();
        req.on_response(move |_res| {
            observed.store(true, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);
    engine.handle_event(response(&route, "1", None)).unwrap();

    assert!(ran.load(Ordering::SeqCst));
    let reply = replies.try_recv().unwrap();
    assert_eq!(reply.subscription_id, Some(subscription));
}

#[test]
fn second_resolution_is_a_no_op() {
    let (mut engine, mut replies, verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|_res| Ok(()));
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);
    engine
        .handle_event(response(&route, "1", Some(&subscription)))
        .unwrap();
    assert!(replies.try_recv().is_ok());

    assert_matches!(
        engine.handle_event(response(&route, "1", Some(&subscription))),
        Err(InterceptError::AlreadyResolved(id)) if id == subscription
    );
    assert!(replies.try_recv().is_err());
    assert!(verdict.check().is_ok());
}

#[test]
fn out_of_order_events_are_protocol_errors() {
    let (mut engine, mut replies, verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.reply(StaticResponse::new(200));
        Ok(())
    });

    assert_matches!(
        engine.handle_event(response(&route, "missing", None)),
        Err(InterceptError::Correlation { .. })
    );
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Continue);

    engine.handle_event(before_request(&route, "1")).unwrap();
    replies.try_recv().unwrap();

    assert_matches!(
        engine.handle_event(response(&route, "1", None)),
        Err(InterceptError::Protocol { state: SessionState::Responded, .. })
    );
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Continue);

    let duplicate = ProxyEvent::new(Phase::BeforeRequest, "1-again", &route)
        .with_request_id("1")
        .awaited()
        .with_data(EventData::request("GET", USERS));
    assert_matches!(
        engine.handle_event(duplicate),
        Err(InterceptError::Protocol { phase: Phase::BeforeRequest, .. })
    );
    assert_eq!(
        engine.session(&RequestId::from("1")).unwrap().state,
        SessionState::Responded
    );

    engine.handle_event(after_response(&route, "1")).unwrap();
    assert_matches!(
        engine.handle_event(after_response(&route, "1")),
        Err(InterceptError::Protocol { state: SessionState::Completed, .. })
    );
    assert!(verdict.check().is_ok());
}

#[test]
fn destroy_drops_continuations() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.on_response(|_res| Ok(()));
        req.destroy();
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let reply = replies.try_recv().unwrap();
    assert_eq!(reply.outcome, ReplyOutcome::Destroy);
    assert!(reply.subscribe.is_empty());
    assert_eq!(
        engine.session_state(&RequestId::from("1")),
        Some(SessionState::Completed)
    );
}

#[test]
fn second_await_for_a_phase_fails_the_test() {
    let (mut engine, mut replies, verdict) = engine();
    engine.intercept(RouteMatcher::url(USERS), |req| {
        req.on_response(|_res| Ok(()));
        Ok(())
    });
    let newer = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.on_response(|_res| Ok(()));
        Ok(())
    });

    assert_matches!(
        engine.handle_event(before_request(&newer, "1")),
        Err(InterceptError::DuplicateAwait { phase: Phase::Response, .. })
    );
    assert_matches!(replies.try_recv().unwrap().outcome, ReplyOutcome::Error { .. });
    assert_matches!(
        verdict.records()[0].cause,
        FailureCause::DuplicateAwait { phase: Phase::Response }
    );
    assert_eq!(verdict.records()[0].route_handler_id, RouteHandlerId::from("1"));
}

#[test]
fn times_retires_a_handler() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS).times(1), |req| {
        req.destroy();
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Destroy);
    engine.handle_event(before_request(&route, "2")).unwrap();
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Continue);
    assert_eq!(engine.registry().get(&route).unwrap().hits(), 1);
}

#[test]
fn unknown_route_handler_is_unblocked() {
    let (mut engine, mut replies, verdict) = engine();
    assert_matches!(
        engine.handle_event(before_request(&RouteHandlerId::from("9"), "1")),
        Err(InterceptError::Correlation { .. })
    );
    assert_eq!(replies.try_recv().unwrap().outcome, ReplyOutcome::Continue);
    assert!(engine.session(&RequestId::from("1")).is_none());
    assert!(verdict.check().is_ok());
}

#[test]
fn missing_request_id_falls_back_to_event_id() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |_req| Ok(()));
    let event = ProxyEvent::new(Phase::BeforeRequest, "evt-7", &route)
        .awaited()
        .with_data(EventData::request("GET", USERS));

    engine.handle_event(event).unwrap();
    assert_eq!(replies.try_recv().unwrap().request_id, RequestId::from("evt-7"));
    assert_eq!(
        engine.session_state(&RequestId::from("evt-7")),
        Some(SessionState::Forwarded)
    );
}

#[test]
fn teardown_aborts_pending_awaits() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|_res| Ok(()));
        req.on_after_response(|_res| Ok(()));
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);

    let summary = engine.teardown();
    assert_eq!(summary.aborted_subscriptions, 2);
    assert_eq!(summary.dropped_sessions, 1);
    assert_eq!(summary.cleared_routes, 1);

    let aborted = replies.try_recv().unwrap();
    assert_eq!(aborted.outcome, ReplyOutcome::Aborted);
    assert_eq!(aborted.subscription_id, Some(subscription));
    assert!(replies.try_recv().is_err());
    assert!(engine.registry().is_empty());
}

#[test]
fn failing_request_does_not_block_an_unrelated_one() {
    let (mut engine, mut replies, verdict) = engine();
    let users = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|res| {
            anyhow::ensure!(res.status_code() == Some(200), "unexpected status");
            Ok(())
        });
        Ok(())
    });
    let orders = engine.intercept(RouteMatcher::url("*/orders"), |_req| {
        anyhow::bail!("orders are not allowed")
    });

    engine.handle_event(before_request(&users, "r1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);

    let failing = ProxyEvent::new(Phase::BeforeRequest, "r2-before", &orders)
        .with_request_id("r2")
        .awaited()
        .with_data(EventData::request("POST", "https://app.test/orders"));
    assert!(engine.handle_event(failing).is_err());
    let failed = replies.try_recv().unwrap();
    assert_eq!(failed.request_id, RequestId::from("r2"));
    assert_matches!(failed.outcome, ReplyOutcome::Error { .. });
    assert!(replies.try_recv().is_err());
    assert_eq!(
        engine.subscription_state(&subscription),
        Some(SubscriptionState::Pending)
    );

    engine
        .handle_event(response(&users, "r1", Some(&subscription)))
        .unwrap();
    let resumed = replies.try_recv().unwrap();
    assert_eq!(resumed.subscription_id, Some(subscription));
    assert_eq!(resumed.outcome, ReplyOutcome::Continue);
    assert_eq!(
        engine.session_state(&RequestId::from("r1")),
        Some(SessionState::Responded)
    );
    assert_eq!(
        engine.session_state(&RequestId::from("r2")),
        Some(SessionState::Errored)
    );
    assert_eq!(verdict.records().len(), 1);
    assert_eq!(verdict.records()[0].route_handler_id, orders);
}

#[test]
fn resolved_subscription_after_completion_is_a_protocol_error() {
    let (mut engine, mut replies, _verdict) = engine();
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|_res| Ok(()));
        Ok(())
    });

    engine.handle_event(before_request(&route, "1")).unwrap();
    let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);
    engine
        .handle_event(response(&route, "1", Some(&subscription)))
        .unwrap();
    engine.handle_event(after_response(&route, "1")).unwrap();
    while replies.try_recv().is_ok() {}

    assert_matches!(
        engine.handle_event(response(&route, "1", Some(&subscription))),
        Err(InterceptError::Protocol { state: SessionState::Completed, .. })
    );
    assert!(replies.try_recv().is_err());
}

#[test]
fn evicted_requests_release_their_subscriptions() {
    let (mut engine, mut replies, verdict) = engine_with(EngineConfig {
        tombstone_capacity: 4,
        ..EngineConfig::default()
    });
    let route = engine.intercept(RouteMatcher::url(USERS), |req| {
        req.continue_with(|_res| Ok(()));
        Ok(())
    });

    let mut subscriptions = Vec::new();
    for index in 0..50 {
        let request = format!("r{index}");
        engine.handle_event(before_request(&route, &request)).unwrap();
        let subscription = granted(&replies.try_recv().unwrap(), Phase::Response);
        engine
            .handle_event(response(&route, &request, Some(&subscription)))
            .unwrap();
        engine.handle_event(after_response(&route, &request)).unwrap();
        subscriptions.push(subscription);
    }

    assert_eq!(engine.session_state(&RequestId::from("r0")), None);
    assert_eq!(engine.subscription_state(&subscriptions[0]), None);
    assert_eq!(
        engine.subscription_state(&subscriptions[49]),
        Some(SubscriptionState::Resolved)
    );
    assert_eq!(engine.tracked_subscriptions(), 4);
    assert_eq!(engine.answered_replies(), 4 * 3);
    assert!(verdict.check().is_ok());
}
