//! Sandbox configuration

use crate::{ResourceLimits, Result, SandprofError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a sandbox instance.
///
/// These are operator policy; nothing in a request can change them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to Python interpreter
    pub python_path: PathBuf,

    /// Ceilings applied inside the child before the harness starts
    pub limits: ResourceLimits,

    /// Maximum wall-clock execution time
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,

    /// Bytes kept from each of stdout and stderr; the rest is drained and dropped
    pub max_output_bytes: usize,

    /// Directory under which per-run workspaces are created
    pub workspace_root: PathBuf,

    /// Environment of the child; nothing else is inherited
    pub env: Vec<(String, String)>,

    /// How often the supervisor checks whether the child has exited
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("/usr/bin/python3"),
            limits: ResourceLimits::default(),
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024, // 1MB
            workspace_root: std::env::temp_dir(),
            env: vec![
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("LC_ALL".into(), "C".into()),
            ],
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Reject configurations that could not enforce their own policy.
    ///
    /// The wall-clock timeout is authoritative: the CPU ceiling must not be
    /// lower than it, so a single-threaded busy loop always ends as a timeout.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.timeout.is_zero() {
            return Err(SandprofError::Config("timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(SandprofError::Config("poll interval must be positive".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(SandprofError::Config("output cap must be positive".into()));
        }

        let floor = ResourceLimits::min_cpu_seconds_for(self.timeout);
        if self.limits.cpu_seconds < floor {
            return Err(SandprofError::Config(format!(
                "cpu ceiling ({}s) is below the wall-clock timeout ({:?}); need at least {floor}s",
                self.limits.cpu_seconds, self.timeout
            )));
        }

        Ok(())
    }
}

/// Builder for SandboxConfig
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn python_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.python_path = path.into();
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.limits.address_space_bytes = bytes;
        self
    }

    #[must_use]
    pub fn memory_limit_mb(self, mb: u64) -> Self {
        self.memory_limit(mb * 1024 * 1024)
    }

    #[must_use]
    pub fn cpu_limit_secs(mut self, secs: u64) -> Self {
        self.config.limits.cpu_seconds = secs;
        self
    }

    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    /// Sets the timeout and keeps the CPU ceiling one second above it.
    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.limits.cpu_seconds = secs + 1;
        self.timeout(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SandboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.limits.cpu_seconds >= 10);
    }

    #[test]
    fn cpu_ceiling_below_timeout_is_rejected() {
        let config = SandboxConfig::builder()
            .timeout(Duration::from_secs(10))
            .cpu_limit_secs(5)
            .build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cpu ceiling"));
    }

    #[test]
    fn timeout_secs_keeps_cpu_ceiling_above() {
        let config = SandboxConfig::builder().timeout_secs(3).build();
        assert_eq!(config.limits.cpu_seconds, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SandboxConfig::builder().timeout(Duration::ZERO).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"timeout_ms": 2500, "python_path": "/opt/py/bin/python3"}"#)
                .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.python_path, PathBuf::from("/opt/py/bin/python3"));
        assert_eq!(config.limits, ResourceLimits::default());
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn builder_sets_memory_in_mb() {
        let config = SandboxConfig::builder().memory_limit_mb(64).build();
        assert_eq!(config.limits.address_space_bytes, 64 * 1024 * 1024);
    }
}
