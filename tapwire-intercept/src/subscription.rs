use std::collections::HashMap;
use std::fmt;

use tapwire_protocol::{
    EventId, Phase, RequestId, RouteHandlerId, SubscriptionGrant, SubscriptionId,
};
use uuid::Uuid;

use crate::error::InterceptError;
use crate::handle::{Continuation, ResponseCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Resolved,
    Aborted,
}

struct SubscriptionEntry {
    request_id: RequestId,
    phase: Phase,
    awaiting: bool,
    route_handler_id: RouteHandlerId,
    granted_by: EventId,
    state: SubscriptionState,
    callback: Option<ResponseCallback>,
}

/// A continuation claimed by an inbound event. Holding it means the
/// subscription is already marked resolved.
pub(crate) struct Correlated {
    pub(crate) subscription_id: SubscriptionId,
    pub(crate) route_handler_id: RouteHandlerId,
    pub(crate) callback: ResponseCallback,
}

impl fmt::Debug for Correlated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlated")
            .field("subscription_id", &self.subscription_id)
            .field("route_handler_id", &self.route_handler_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedSubscription {
    pub id: SubscriptionId,
    pub request_id: RequestId,
    pub phase: Phase,
    pub awaiting: bool,
    pub granted_by: EventId,
}

/// Continuation table keyed by subscription id, with at most one pending
/// subscription per `(request, phase)`.
#[derive(Default)]
pub struct SubscriptionResolver {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    slots: HashMap<(RequestId, Phase), SubscriptionId>,
}

impl SubscriptionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        request_id: &RequestId,
        granted_by: &EventId,
        continuation: Continuation,
    ) -> Result<SubscriptionGrant, InterceptError> {
        let slot = (request_id.clone(), continuation.phase);
        if self.slots.contains_key(&slot) {
            return Err(InterceptError::DuplicateAwait {
                request_id: request_id.clone(),
                phase: continuation.phase,
            });
        }

        let id = SubscriptionId::new(Uuid::new_v4().to_string());
        self.slots.insert(slot, id.clone());
        self.entries.insert(
            id.clone(),
            SubscriptionEntry {
                request_id: request_id.clone(),
                phase: continuation.phase,
                awaiting: continuation.awaiting,
                route_handler_id: continuation.route_handler_id,
                granted_by: granted_by.clone(),
                state: SubscriptionState::Pending,
                callback: Some(continuation.callback),
            },
        );

        Ok(SubscriptionGrant {
            id,
            phase: continuation.phase,
            awaiting: continuation.awaiting,
        })
    }

    /// Claims the pending subscription an event resumes. Each subscription can
    /// be claimed once; later attempts fail with `AlreadyResolved`.
    pub(crate) fn correlate(
        &mut self,
        request_id: &RequestId,
        subscription_id: &SubscriptionId,
        phase: Phase,
    ) -> Result<Correlated, InterceptError> {
        let correlation_error = |reason: String| InterceptError::Correlation {
            request_id: request_id.clone(),
            subscription_id: Some(subscription_id.clone()),
            reason,
        };

        let Some(entry) = self.entries.get_mut(subscription_id) else {
            return Err(correlation_error(format!(
                "unknown subscription {subscription_id}"
            )));
        };
        if &entry.request_id != request_id {
            return Err(correlation_error(format!(
                "subscription {subscription_id} belongs to request {}",
                entry.request_id
            )));
        }
        if entry.phase != phase {
            return Err(correlation_error(format!(
                "subscription {subscription_id} waits for {}, not {phase}",
                entry.phase
            )));
        }
        if entry.state != SubscriptionState::Pending {
            return Err(InterceptError::AlreadyResolved(subscription_id.clone()));
        }

        entry.state = SubscriptionState::Resolved;
        let callback = entry
            .callback
            .take()
            .ok_or_else(|| InterceptError::AlreadyResolved(subscription_id.clone()))?;
        let route_handler_id = entry.route_handler_id.clone();
        self.slots.remove(&(request_id.clone(), phase));

        Ok(Correlated {
            subscription_id: subscription_id.clone(),
            route_handler_id,
            callback,
        })
    }

    /// Claims the slot for `(request, phase)` when the event carries no
    /// subscription id.
    pub(crate) fn correlate_slot(
        &mut self,
        request_id: &RequestId,
        phase: Phase,
    ) -> Option<Correlated> {
        let subscription_id = self.slots.get(&(request_id.clone(), phase))?.clone();
        self.correlate(request_id, &subscription_id, phase).ok()
    }

    pub fn pending(&self, request_id: &RequestId, phase: Phase) -> Option<&SubscriptionId> {
        self.slots.get(&(request_id.clone(), phase))
    }

    pub(crate) fn pending_route(&self, request_id: &RequestId, phase: Phase) -> Option<&RouteHandlerId> {
        let id = self.pending(request_id, phase)?;
        self.entries.get(id).map(|entry| &entry.route_handler_id)
    }

    pub fn occupied_phases(&self, request_id: &RequestId) -> Vec<Phase> {
        self.slots
            .keys()
            .filter(|(owner, _)| owner == request_id)
            .map(|(_, phase)| *phase)
            .collect()
    }

    pub fn state(&self, subscription_id: &SubscriptionId) -> Option<SubscriptionState> {
        self.entries.get(subscription_id).map(|entry| entry.state)
    }

    /// Aborts every pending subscription of a request. Their callbacks are
    /// dropped unrun.
    pub fn abort_request(&mut self, request_id: &RequestId) -> Vec<AbortedSubscription> {
        let phases = self.occupied_phases(request_id);
        let mut aborted = Vec::new();
        for phase in phases {
            if let Some(id) = self.slots.remove(&(request_id.clone(), phase)) {
                if let Some(entry) = self.abort_entry(&id) {
                    aborted.push(entry);
                }
            }
        }
        aborted.sort_by(|left, right| left.phase.cmp(&right.phase));
        aborted
    }

    pub fn abort_all(&mut self) -> Vec<AbortedSubscription> {
        let slots: Vec<SubscriptionId> = self.slots.drain().map(|(_, id)| id).collect();
        slots
            .iter()
            .filter_map(|id| self.abort_entry(id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }

    /// Drops every entry of a request, whatever its state.
    pub fn forget_request(&mut self, request_id: &RequestId) {
        self.entries.retain(|_, entry| &entry.request_id != request_id);
        self.slots.retain(|(owner, _), _| owner != request_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.slots.clear();
    }

    fn abort_entry(&mut self, id: &SubscriptionId) -> Option<AbortedSubscription> {
        let entry = self.entries.get_mut(id)?;
        if entry.state != SubscriptionState::Pending {
            return None;
        }
        entry.state = SubscriptionState::Aborted;
        entry.callback = None;
        Some(AbortedSubscription {
            id: id.clone(),
            request_id: entry.request_id.clone(),
            phase: entry.phase,
            awaiting: entry.awaiting,
            granted_by: entry.granted_by.clone(),
        })
    }
}
