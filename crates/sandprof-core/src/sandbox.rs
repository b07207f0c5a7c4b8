//! Sandbox orchestration
//!
//! One call walks `Idle → Preparing → Running → Collecting → CleaningUp`
//! and ends in `Done` or `Failed`. Nothing is retried and nothing is shared
//! between calls, so one [`Sandbox`] can serve many threads at once.

use crate::error::{ExecutionError, ValidationError};
use crate::harness::Harness;
use crate::process::{self, Supervision, Termination};
use crate::report::{self, Collected};
use crate::workspace::{self, Workspace};
use crate::{ExecutionResult, Result, SandboxConfig, precheck};
use std::panic::{self, AssertUnwindSafe};
use std::process::Command;
use std::time::Duration;

/// Where one execution is in its lifecycle. Logged on every transition.
///
/// A successful run goes `Idle`, `Preparing`, `Running`, `Collecting`,
/// `CleaningUp`, `Done`. A child that fails or times out skips `Collecting`,
/// and a workspace that cannot be created goes from `Preparing` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, nothing touched yet
    Idle,
    /// Creating the workspace and writing the harness
    Preparing,
    /// Interpreter running under supervision
    Running,
    /// Child gone, reading output and profiling artifacts
    Collecting,
    /// Removing the workspace
    CleaningUp,
    /// Finished with a successful outcome
    Done,
    /// Finished with any other outcome, or workspace setup failed
    Failed,
}

/// Tracks one execution through its phases for logging.
struct Execution {
    phase: Phase,
}

impl Execution {
    const fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    fn advance(&mut self, next: Phase) {
        tracing::trace!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
    }
}

/// Runs untrusted code in a private workspace under fixed limits
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Syntax-check `code`, then run it with profiling.
    pub fn profile(&self, code: &str) -> std::result::Result<ExecutionResult, ValidationError> {
        precheck::check_syntax(&self.config, code)?;
        self.run(code)
    }

    /// Run `code` with profiling, assuming it already passed the syntax check.
    ///
    /// Only harness rendering can reject the input; every failure after that
    /// ends up in the returned result.
    pub fn run(&self, code: &str) -> std::result::Result<ExecutionResult, ValidationError> {
        let harness = Harness::render(code)?;
        tracing::info!(code_len = code.len(), "profiling run requested");
        Ok(self.execute(&harness))
    }

    fn execute(&self, harness: &Harness) -> ExecutionResult {
        let mut execution = Execution::new();
        execution.advance(Phase::Preparing);

        let scoped = workspace::scoped(&self.config.workspace_root, |workspace| {
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                self.drive(&mut execution, workspace, harness)
            }))
            .unwrap_or_else(|_| {
                Err((
                    ExecutionError::Unexpected("internal panic during execution".into()),
                    Duration::ZERO,
                ))
            });
            execution.advance(Phase::CleaningUp);
            run
        });

        let (run, cleanup) = match scoped {
            Ok(scoped) => scoped,
            Err(e) => {
                execution.advance(Phase::Failed);
                tracing::error!(error = %e, "could not acquire workspace");
                return ExecutionResult::failed(&ExecutionError::Unexpected(e.to_string()));
            }
        };

        let mut result = match run {
            Ok((collected, elapsed)) => report::aggregate(Ok(collected), elapsed),
            Err((err, elapsed)) => report::aggregate(Err(err), elapsed),
        };
        result.cleanup_error = cleanup.map(|e| e.to_string());

        execution.advance(if result.is_success() {
            Phase::Done
        } else {
            Phase::Failed
        });
        tracing::info!(
            outcome = ?result.outcome,
            elapsed_ms = result.elapsed_ms,
            cleanup_failed = result.cleanup_error.is_some(),
            "profiling run finished"
        );

        result
    }

    fn drive(
        &self,
        execution: &mut Execution,
        workspace: &Workspace,
        harness: &Harness,
    ) -> std::result::Result<(Collected, Duration), (ExecutionError, Duration)> {
        workspace
            .write_program(harness.source())
            .map_err(|e| (ExecutionError::Unexpected(e.to_string()), Duration::ZERO))?;

        execution.advance(Phase::Running);
        let mut command = Command::new(&self.config.python_path);
        command
            .arg("-I")
            .arg("-B")
            .arg(workspace.program_path())
            .current_dir(workspace.path())
            .env_clear()
            .envs(self.config.env.iter().map(|(k, v)| (k, v)));

        let finished = process::run(&mut command, &self.supervision(), None)
            .map_err(|e| (e, Duration::ZERO))?;
        let elapsed = finished.elapsed;

        if finished.stdout.truncated {
            tracing::warn!(
                limit = self.config.max_output_bytes,
                "stdout exceeded the capture limit and was truncated"
            );
        }

        match finished.termination {
            Termination::TimedOut => Err((
                ExecutionError::Timeout {
                    seconds: self.config.timeout.as_secs(),
                },
                elapsed,
            )),
            Termination::Exited(status) if !status.success() => {
                let status = process::describe_status(status);
                tracing::debug!(%status, "child failed");
                Err((
                    ExecutionError::child(&finished.stderr.text(), status),
                    elapsed,
                ))
            }
            Termination::Exited(_) => {
                execution.advance(Phase::Collecting);
                Ok((
                    Collected {
                        stdout: finished.stdout.text(),
                        stats: workspace.read_stats(),
                        memory: workspace.read_memory(),
                    },
                    elapsed,
                ))
            }
        }
    }

    const fn supervision(&self) -> Supervision {
        Supervision {
            limits: self.config.limits,
            timeout: self.config.timeout,
            poll_interval: self.config.poll_interval,
            max_output_bytes: self.config.max_output_bytes,
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            config: SandboxConfig::default(),
        }
    }
}

/// Syntax-check and run `code` with the default configuration.
pub fn profile(code: &str) -> std::result::Result<ExecutionResult, ValidationError> {
    Sandbox::default().profile(code)
}
