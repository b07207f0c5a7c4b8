//! Execution result types

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};

/// Terminal classification of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exit code zero; output, stats and memory are populated
    Success,
    /// Non-zero exit or killed by a resource ceiling
    ChildFailed,
    /// Wall-clock timeout; the process group was killed
    TimedOut,
    /// The interpreter could not be launched, or the host failed around it
    Internal,
}

impl From<&ExecutionError> for Outcome {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::Child { .. } => Self::ChildFailed,
            ExecutionError::Timeout { .. } => Self::TimedOut,
            ExecutionError::Spawn(_) | ExecutionError::Unexpected(_) => Self::Internal,
        }
    }
}

/// Result of a sandboxed profiling run.
///
/// After a run either `output`, `profiling_stats` and `memory_usage` are all
/// set, or `error` is. `cleanup_error` is independent of both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout, surrounding whitespace trimmed
    pub output: Option<String>,

    /// Ranked profiler report, or a placeholder when the stats file is missing
    pub profiling_stats: Option<String>,

    /// `Memory Usage (in MB): X.XX`, or a placeholder when the report is missing
    pub memory_usage: Option<String>,

    /// Why the run failed
    pub error: Option<String>,

    /// Artifact removal failure; never replaces `error`
    pub cleanup_error: Option<String>,

    pub outcome: Outcome,

    /// Wall-clock time of the child, in milliseconds
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    /// A run that failed before the child could produce anything.
    #[must_use]
    pub fn failed(err: &ExecutionError) -> Self {
        Self {
            output: None,
            profiling_stats: None,
            memory_usage: None,
            error: Some(err.to_string()),
            cleanup_error: None,
            outcome: Outcome::from(err),
            elapsed_ms: 0,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success && self.error.is_none()
    }

    /// Peak resident size in MB parsed from `memory_usage`.
    #[must_use]
    pub fn memory_mb(&self) -> Option<f64> {
        let line = self.memory_usage.as_deref()?;
        let (label, value) = line.split_once(':')?;
        if label.trim() != "Memory Usage (in MB)" {
            return None;
        }
        value.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_null_fields() {
        let result = ExecutionResult::failed(&ExecutionError::Spawn("no such file".into()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["output"], serde_json::Value::Null);
        assert_eq!(json["error"], "Unexpected error: no such file");
        assert_eq!(json["outcome"], "internal");
        assert_eq!(json["cleanup_error"], serde_json::Value::Null);
    }

    #[test]
    fn memory_mb_rejects_placeholders() {
        let mut result = ExecutionResult::failed(&ExecutionError::Timeout { seconds: 1 });
        result.memory_usage = Some("Memory output file not found: /tmp/x".into());
        assert_eq!(result.memory_mb(), None);
        result.memory_usage = Some("Memory Usage (in MB): 12.50".into());
        assert_eq!(result.memory_mb(), Some(12.5));
    }
}
