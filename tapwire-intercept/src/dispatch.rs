use std::collections::HashSet;

use tapwire_protocol::{
    EventId, Phase, ProxyEvent, ProxyReply, ReplyOutcome, RequestId, SubscriptionGrant,
    SubscriptionId,
};
use tokio::sync::mpsc;

use crate::error::InterceptError;
use crate::subscription::AbortedSubscription;

/// Proxy-side receiver of engine decisions.
pub trait ReplySink: Send {
    fn deliver(&self, reply: ProxyReply) -> Result<(), InterceptError>;
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ProxyReply>,
}

impl ReplySink for ChannelSink {
    fn deliver(&self, reply: ProxyReply) -> Result<(), InterceptError> {
        self.sender.send(reply).map_err(|_| InterceptError::Closed)
    }
}

pub fn reply_channel() -> (ChannelSink, mpsc::UnboundedReceiver<ProxyReply>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelSink { sender }, receiver)
}

/// Where a decision goes and whether the proxy is blocked on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub subscription_id: Option<SubscriptionId>,
    pub phase: Phase,
    pub awaiting: bool,
}

impl DispatchTarget {
    pub fn from_event(event: &ProxyEvent, request_id: &RequestId) -> Self {
        Self {
            event_id: event.event_id.clone(),
            request_id: request_id.clone(),
            subscription_id: event.subscription_id().cloned(),
            phase: event.phase,
            awaiting: event.awaiting(),
        }
    }

    pub fn from_aborted(subscription: &AbortedSubscription) -> Self {
        Self {
            event_id: subscription.granted_by.clone(),
            request_id: subscription.request_id.clone(),
            subscription_id: Some(subscription.id.clone()),
            phase: subscription.phase,
            awaiting: subscription.awaiting,
        }
    }

    fn key(&self) -> DispatchKey {
        match &self.subscription_id {
            Some(id) => DispatchKey::Subscription(self.request_id.clone(), id.clone()),
            None => DispatchKey::Event(self.request_id.clone(), self.phase, self.event_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DispatchKey {
    Subscription(RequestId, SubscriptionId),
    Event(RequestId, Phase, EventId),
}

impl DispatchKey {
    fn request_id(&self) -> &RequestId {
        match self {
            DispatchKey::Subscription(request_id, _) | DispatchKey::Event(request_id, ..) => {
                request_id
            }
        }
    }
}

/// Sends each decision to the proxy at most once per dispatch key.
pub struct ReplyDispatcher {
    sink: Box<dyn ReplySink>,
    consumed: HashSet<DispatchKey>,
    sent: u64,
}

impl ReplyDispatcher {
    pub fn new(sink: impl ReplySink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            consumed: HashSet::new(),
            sent: 0,
        }
    }

    /// Returns `false` when the target was already answered.
    pub fn send(
        &mut self,
        target: &DispatchTarget,
        outcome: ReplyOutcome,
        subscribe: Vec<SubscriptionGrant>,
    ) -> bool {
        if !self.consumed.insert(target.key()) {
            tracing::warn!(
                request_id = %target.request_id,
                subscription = ?target.subscription_id,
                phase = %target.phase,
                "reply already dispatched, dropping duplicate"
            );
            return false;
        }

        if target.awaiting {
            tracing::debug!(request_id = %target.request_id, phase = %target.phase, ?outcome, "dispatching reply");
        } else {
            tracing::trace!(request_id = %target.request_id, phase = %target.phase, ?outcome, "notifying proxy");
        }

        let reply = ProxyReply {
            event_id: target.event_id.clone(),
            request_id: target.request_id.clone(),
            subscription_id: target.subscription_id.clone(),
            phase: target.phase,
            awaited: target.awaiting,
            outcome,
            subscribe,
        };
        if let Err(err) = self.sink.deliver(reply) {
            tracing::warn!(request_id = %target.request_id, error = %err, "proxy reply sink unavailable");
        }
        self.sent += 1;
        true
    }

    pub fn is_answered(&self, target: &DispatchTarget) -> bool {
        self.consumed.contains(&target.key())
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Forgets which targets of a request were answered.
    pub fn forget_request(&mut self, request_id: &RequestId) {
        self.consumed.retain(|key| key.request_id() != request_id);
    }

    pub fn answered_len(&self) -> usize {
        self.consumed.len()
    }

    pub fn clear(&mut self) {
        self.consumed.clear();
    }
}
