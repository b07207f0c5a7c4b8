//! Error types for sandprof-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandprofError {
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Input rejected before any untrusted instruction runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid indentation (line {line}): {message}")]
    Indentation { line: usize, message: String },

    #[error("Invalid syntax (line {line}): {message}")]
    Syntax { line: usize, message: String },

    #[error("Rejected input: {0}")]
    Injection(String),

    #[error("Syntax check could not run: {0}")]
    Checker(String),
}

/// Why a run produced no profile. Rendered into `ExecutionResult::error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The child exited non-zero or was killed by a signal.
    #[error("Error running the code:\n{stderr}")]
    Child { stderr: String, status: String },

    /// The wall-clock budget ran out and the process group was killed.
    #[error("Error: The untrusted code execution timed out.")]
    Timeout { seconds: u64 },

    /// The interpreter could not be launched.
    #[error("Unexpected error: {0}")]
    Spawn(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ExecutionError {
    /// Builds a child failure, falling back to the exit status when the
    /// child left nothing on stderr (e.g. SIGKILL from a ceiling).
    #[must_use]
    pub fn child(stderr: &str, status: impl Into<String>) -> Self {
        let status = status.into();
        let stderr = if stderr.trim().is_empty() {
            format!("process terminated ({status})")
        } else {
            stderr.to_owned()
        };
        Self::Child { stderr, status }
    }
}

/// Artifact removal failed. Never replaces the execution outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Error during cleanup: {}", .failures.join("; "))]
pub struct CleanupError {
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_error_keeps_stderr() {
        let err = ExecutionError::child("Traceback ...\nZeroDivisionError", "exit code 1");
        assert_eq!(
            err.to_string(),
            "Error running the code:\nTraceback ...\nZeroDivisionError"
        );
    }

    #[test]
    fn child_error_without_stderr_reports_status() {
        let err = ExecutionError::child("  \n", "signal SIGXCPU");
        assert_eq!(
            err.to_string(),
            "Error running the code:\nprocess terminated (signal SIGXCPU)"
        );
    }

    #[test]
    fn cleanup_error_joins_failures() {
        let err = CleanupError {
            failures: vec!["a: denied".into(), "b: busy".into()],
        };
        assert_eq!(err.to_string(), "Error during cleanup: a: denied; b: busy");
    }
}
