use std::sync::Arc;
use std::time::Duration;

use tapwire_protocol::ProxyReply;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::dispatch::reply_channel;
use crate::engine::{InterceptEngine, TeardownSummary};
use crate::error::InterceptError;
use crate::failure::{FailureRecord, TestFailure, Verdict};
use crate::runtime::{EngineControl, spawn_engine};

/// One test's interception scope: a running engine, its reply stream and
/// the verdict its failures land in.
pub struct InterceptContext {
    control: EngineControl,
    task: JoinHandle<()>,
    verdict: Verdict,
    settle: Duration,
}

#[derive(Debug)]
pub struct TestReport {
    pub teardown: TeardownSummary,
    pub failures: Vec<FailureRecord>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<TeardownSummary, TestFailure> {
        match self.failures.first() {
            None => Ok(self.teardown),
            Some(first) => Err(TestFailure {
                message: first.to_string(),
                records: self.failures,
            }),
        }
    }
}

impl InterceptContext {
    pub fn start(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<ProxyReply>) {
        let verdict = Verdict::new();
        let settle = config.settle_period();
        let (sink, replies) = reply_channel();
        let engine = InterceptEngine::new(config, sink, Arc::new(verdict.clone()));
        let (control, task) = spawn_engine(engine);
        (
            Self {
                control,
                task,
                verdict,
                settle,
            },
            replies,
        )
    }

    pub fn control(&self) -> &EngineControl {
        &self.control
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// Waits for late failures to settle while the engine still runs, then
    /// tears it down and waits for the task to stop.
    pub async fn finish(self) -> Result<TestReport, InterceptError> {
        self.verdict.settle(self.settle).await;
        let teardown = self.control.teardown().await?;
        drop(self.control);
        self.task.await.map_err(|_| InterceptError::Closed)?;
        Ok(TestReport {
            teardown,
            failures: self.verdict.records(),
        })
    }
}
