use std::collections::{HashMap, VecDeque};

use tapwire_protocol::{EventData, Phase, RequestId, RouteHandlerId, SubscriptionId};

use crate::error::InterceptError;
use crate::failure::FailureCause;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    HandlingBeforeRequest,
    Forwarded,
    HandlingResponse,
    Responded,
    HandlingAfterResponse,
    Completed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }

    fn accepts(self, phase: Phase) -> bool {
        match phase {
            Phase::BeforeRequest => self == SessionState::Created,
            Phase::Response => self == SessionState::Forwarded,
            Phase::AfterResponse => {
                matches!(self, SessionState::Forwarded | SessionState::Responded)
            }
        }
    }

    fn handling(phase: Phase) -> Self {
        match phase {
            Phase::BeforeRequest => SessionState::HandlingBeforeRequest,
            Phase::Response => SessionState::HandlingResponse,
            Phase::AfterResponse => SessionState::HandlingAfterResponse,
        }
    }
}

#[derive(Debug)]
pub struct RequestSession {
    pub request_id: RequestId,
    pub current_phase: Phase,
    pub state: SessionState,
    pub matched_handler_ids: Vec<RouteHandlerId>,
    pub active_handler_index: usize,
    pub pending_subscription_id: Option<SubscriptionId>,
    pub terminal_error: Option<FailureCause>,
    pub request: EventData,
}

/// Owns every live request session and remembers recently finished ones.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: HashMap<RequestId, RequestSession>,
    finished: HashMap<RequestId, SessionState>,
    finished_order: VecDeque<RequestId>,
    evicted: Vec<RequestId>,
    tombstone_capacity: usize,
}

impl SessionTracker {
    pub fn new(tombstone_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            evicted: Vec::new(),
            tombstone_capacity,
        }
    }

    /// Opens a session for a first `before:request` event and moves it
    /// straight into handling.
    pub fn begin(
        &mut self,
        request_id: RequestId,
        matched_handler_ids: Vec<RouteHandlerId>,
        request: EventData,
    ) -> Result<&mut RequestSession, InterceptError> {
        self.check(&request_id, Phase::BeforeRequest)?;
        let session = self
            .sessions
            .entry(request_id.clone())
            .or_insert(RequestSession {
                request_id,
                current_phase: Phase::BeforeRequest,
                state: SessionState::Created,
                matched_handler_ids,
                active_handler_index: 0,
                pending_subscription_id: None,
                terminal_error: None,
                request,
            });
        session.state = SessionState::HandlingBeforeRequest;
        Ok(session)
    }

    /// Validates that `phase` may start for `request_id` without touching any
    /// state.
    pub fn check(&self, request_id: &RequestId, phase: Phase) -> Result<(), InterceptError> {
        if let Some(state) = self.finished.get(request_id) {
            return Err(InterceptError::Protocol {
                request_id: request_id.clone(),
                phase,
                state: *state,
            });
        }

        match self.sessions.get(request_id) {
            None if phase == Phase::BeforeRequest => Ok(()),
            None => Err(InterceptError::Correlation {
                request_id: request_id.clone(),
                subscription_id: None,
                reason: format!("{phase} event without a preceding before:request"),
            }),
            Some(session) if session.state.accepts(phase) => Ok(()),
            Some(session) => Err(InterceptError::Protocol {
                request_id: request_id.clone(),
                phase,
                state: session.state,
            }),
        }
    }

    pub fn advance(
        &mut self,
        request_id: &RequestId,
        phase: Phase,
    ) -> Result<&mut RequestSession, InterceptError> {
        self.check(request_id, phase)?;
        let session = self
            .sessions
            .get_mut(request_id)
            .ok_or_else(|| InterceptError::Correlation {
                request_id: request_id.clone(),
                subscription_id: None,
                reason: "session vanished".to_string(),
            })?;
        session.current_phase = phase;
        session.state = SessionState::handling(phase);
        Ok(session)
    }

    pub fn transition(&mut self, request_id: &RequestId, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(request_id) {
            tracing::debug!(request_id = %request_id, from = ?session.state, to = ?state, "session transition");
            session.state = state;
        }
    }

    /// Drops the session and tombstones its id.
    pub fn finish(&mut self, request_id: &RequestId, state: SessionState) -> Option<RequestSession> {
        let mut session = self.sessions.remove(request_id)?;
        tracing::debug!(request_id = %request_id, from = ?session.state, to = ?state, "session finished");
        session.state = state;
        self.remember(request_id.clone(), state);
        Some(session)
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&RequestSession> {
        self.sessions.get(request_id)
    }

    pub fn get_mut(&mut self, request_id: &RequestId) -> Option<&mut RequestSession> {
        self.sessions.get_mut(request_id)
    }

    /// State of a live or recently finished session.
    pub fn state(&self, request_id: &RequestId) -> Option<SessionState> {
        self.sessions
            .get(request_id)
            .map(|session| session.state)
            .or_else(|| self.finished.get(request_id).copied())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids whose tombstones were dropped since the last call. Nothing about
    /// these requests is tracked any more.
    pub fn take_evicted(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.evicted)
    }

    pub fn clear(&mut self) -> Vec<RequestSession> {
        self.finished.clear();
        self.finished_order.clear();
        self.evicted.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    fn remember(&mut self, request_id: RequestId, state: SessionState) {
        if self.tombstone_capacity == 0 {
            self.evicted.push(request_id);
            return;
        }
        while self.finished_order.len() >= self.tombstone_capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
                self.evicted.push(oldest);
            }
        }
        self.finished_order.push_back(request_id.clone());
        self.finished.insert(request_id, state);
    }
}
