//! Bounded executor for sandboxed runs
//!
//! Every run occupies one blocking thread and one child process. A semaphore
//! caps how many run at once; requests that cannot get a slot within the
//! queue timeout are turned away.

use crate::config::DaemonConfig;
use parking_lot::Mutex;
use sandprof_core::protocol::StatusReport;
use sandprof_core::{ExecutionResult, Outcome, Sandbox, ValidationError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("all {0} execution slots are busy")]
    Saturated(usize),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("execution task failed: {0}")]
    Task(String),
}

/// Pool of execution slots sharing one sandbox policy
pub struct ExecutorPool {
    sandbox: Arc<Sandbox>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    queue_timeout: Duration,
    counters: Mutex<StatusReport>,
}

impl ExecutorPool {
    pub fn new(config: &DaemonConfig) -> sandprof_core::Result<Self> {
        let sandbox = Sandbox::new(config.sandbox.clone())?;
        Ok(Self {
            sandbox: Arc::new(sandbox),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            queue_timeout: config.queue_timeout,
            counters: Mutex::new(StatusReport {
                max_concurrent: config.max_concurrent as u64,
                ..StatusReport::default()
            }),
        })
    }

    /// Syntax-check and profile `code` on a blocking thread.
    pub async fn execute(&self, code: String) -> Result<ExecutionResult, PoolError> {
        let permit = match tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                self.counters.lock().rejected += 1;
                tracing::warn!(max = self.max_concurrent, "no execution slot available");
                return Err(PoolError::Saturated(self.max_concurrent));
            }
        };

        let _in_flight = InFlight::enter(&self.counters);
        let sandbox = Arc::clone(&self.sandbox);
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            sandbox.profile(&code)
        })
        .await;

        match joined {
            Ok(Ok(result)) => {
                self.record(result.outcome);
                Ok(result)
            }
            Ok(Err(e)) => {
                self.counters.lock().rejected += 1;
                Err(PoolError::Validation(e))
            }
            Err(e) => {
                self.counters.lock().failed += 1;
                tracing::error!(error = %e, "execution task panicked");
                Err(PoolError::Task(e.to_string()))
            }
        }
    }

    /// Snapshot of the run counters
    pub fn status(&self) -> StatusReport {
        *self.counters.lock()
    }

    fn record(&self, outcome: Outcome) {
        let mut counters = self.counters.lock();
        match outcome {
            Outcome::Success => counters.succeeded += 1,
            Outcome::TimedOut => counters.timed_out += 1,
            Outcome::ChildFailed | Outcome::Internal => counters.failed += 1,
        }
    }
}

/// Counts a run as in flight until dropped, including when the request
/// future is cancelled by a disconnecting client.
struct InFlight<'a> {
    counters: &'a Mutex<StatusReport>,
}

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Mutex<StatusReport>) -> Self {
        let mut guard = counters.lock();
        guard.total += 1;
        guard.in_flight += 1;
        drop(guard);
        Self { counters }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counters.lock().in_flight -= 1;
    }
}
