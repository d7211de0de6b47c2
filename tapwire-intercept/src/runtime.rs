use std::sync::Arc;

use tapwire_protocol::{Phase, ProxyEvent, RequestId, RouteHandlerId, SubscriptionId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::{InterceptEngine, TeardownSummary};
use crate::error::InterceptError;
use crate::handle::{HandlerResult, InterceptedRequest};
use crate::matcher::RouteMatcher;
use crate::registry::RouteCallback;
use crate::session::SessionState;

pub enum EngineCommand {
    Intercept {
        matcher: RouteMatcher,
        callback: RouteCallback,
        respond: oneshot::Sender<RouteHandlerId>,
    },
    Event(Box<ProxyEvent>),
    PendingSubscription {
        request_id: RequestId,
        phase: Phase,
        respond: oneshot::Sender<Option<SubscriptionId>>,
    },
    SessionState {
        request_id: RequestId,
        respond: oneshot::Sender<Option<SessionState>>,
    },
    Teardown {
        respond: oneshot::Sender<TeardownSummary>,
    },
}

/// Handle for driving an engine owned by a background task.
#[derive(Clone)]
pub struct EngineControl {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineControl {
    pub async fn intercept<F>(
        &self,
        matcher: RouteMatcher,
        callback: F,
    ) -> Result<RouteHandlerId, InterceptError>
    where
        F: Fn(&mut InterceptedRequest) -> HandlerResult + Send + Sync + 'static,
    {
        self.intercept_callback(matcher, Arc::new(callback)).await
    }

    pub async fn intercept_callback(
        &self,
        matcher: RouteMatcher,
        callback: RouteCallback,
    ) -> Result<RouteHandlerId, InterceptError> {
        let (respond, receiver) = oneshot::channel();
        self.send(EngineCommand::Intercept {
            matcher,
            callback,
            respond,
        })
        .await?;
        receiver.await.map_err(|_| InterceptError::Closed)
    }

    /// Queues a proxy event. Replies arrive through the engine's sink.
    pub async fn emit(&self, event: ProxyEvent) -> Result<(), InterceptError> {
        self.send(EngineCommand::Event(Box::new(event))).await
    }

    pub async fn pending_subscription(
        &self,
        request_id: RequestId,
        phase: Phase,
    ) -> Result<Option<SubscriptionId>, InterceptError> {
        let (respond, receiver) = oneshot::channel();
        self.send(EngineCommand::PendingSubscription {
            request_id,
            phase,
            respond,
        })
        .await?;
        receiver.await.map_err(|_| InterceptError::Closed)
    }

    pub async fn session_state(
        &self,
        request_id: RequestId,
    ) -> Result<Option<SessionState>, InterceptError> {
        let (respond, receiver) = oneshot::channel();
        self.send(EngineCommand::SessionState {
            request_id,
            respond,
        })
        .await?;
        receiver.await.map_err(|_| InterceptError::Closed)
    }

    pub async fn teardown(&self) -> Result<TeardownSummary, InterceptError> {
        let (respond, receiver) = oneshot::channel();
        self.send(EngineCommand::Teardown { respond }).await?;
        receiver.await.map_err(|_| InterceptError::Closed)
    }

    async fn send(&self, command: EngineCommand) -> Result<(), InterceptError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| InterceptError::Closed)
    }
}

/// Moves `engine` into a task that applies commands in arrival order. The
/// task tears the engine down once every control handle is dropped.
pub fn spawn_engine(engine: InterceptEngine) -> (EngineControl, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(engine.config().command_channel_capacity.max(1));
    let task = tokio::spawn(control_loop(engine, receiver));
    (EngineControl { sender }, task)
}

async fn control_loop(mut engine: InterceptEngine, mut receiver: mpsc::Receiver<EngineCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            EngineCommand::Intercept {
                matcher,
                callback,
                respond,
            } => {
                let _ = respond.send(engine.intercept_callback(matcher, callback));
            }
            EngineCommand::Event(event) => {
                if let Err(err) = engine.handle_event(*event) {
                    tracing::debug!(error = %err, fatal = err.is_fatal(), "event handled with error");
                }
            }
            EngineCommand::PendingSubscription {
                request_id,
                phase,
                respond,
            } => {
                let _ = respond.send(engine.pending_subscription(&request_id, phase));
            }
            EngineCommand::SessionState {
                request_id,
                respond,
            } => {
                let _ = respond.send(engine.session_state(&request_id));
            }
            EngineCommand::Teardown { respond } => {
                let _ = respond.send(engine.teardown());
            }
        }
    }

    let summary = engine.teardown();
    tracing::debug!(?summary, "engine task stopped");
}
