//! Daemon configuration

use sandprof_core::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Names the JSON file the daemon reads its configuration from
pub const CONFIG_ENV: &str = "SANDPROF_CONFIG";

/// Overrides `listen` from the file
pub const LISTEN_ENV: &str = "SANDPROF_LISTEN";

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the HTTP server binds to
    pub listen: SocketAddr,

    /// Children allowed to run at the same time
    pub max_concurrent: usize,

    /// How long a request may wait for a free slot before it gets a 503
    #[serde(rename = "queue_timeout_ms", with = "millis")]
    pub queue_timeout: Duration,

    /// Largest request body accepted
    pub max_body_bytes: usize,

    /// Sandbox policy applied to every run
    pub sandbox: SandboxConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_concurrent: 4,
            queue_timeout: Duration::from_secs(30),
            max_body_bytes: 256 * 1024,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `SANDPROF_CONFIG` if set, then apply `SANDPROF_LISTEN`.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            config.listen = listen
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {LISTEN_ENV} {listen:?}: {e}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_concurrent > 0, "max_concurrent must be positive");
        anyhow::ensure!(self.max_body_bytes > 0, "max_body_bytes must be positive");
        self.sandbox.validate()?;
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
