//! HTTP wire types for the profiling endpoint
//!
//! `POST /profile` takes `{"code": "..."}` and answers with exactly one of
//! `{"result": {...}}` or `{"error": "..."}`.

use crate::ExecutionResult;
use serde::{Deserialize, Serialize};

/// Body of `POST /profile`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub code: String,
}

/// Body of every `/profile` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileResponse {
    Ok { result: ExecutionResult },
    Error { error: String },
}

impl ProfileResponse {
    pub const INVALID_INDENTATION: &'static str = "Invalid indentation";
    pub const INTERNAL_ERROR: &'static str = "Internal Server Error";

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

impl From<ExecutionResult> for ProfileResponse {
    fn from(result: ExecutionResult) -> Self {
        Self::Ok { result }
    }
}

/// Counters exposed by `GET /status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Runs accepted since startup
    pub total: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Requests turned away by validation or a full queue
    pub rejected: u64,
    pub max_concurrent: u64,
}
