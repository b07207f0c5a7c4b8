use sandprof_core::SandboxConfig;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("sandprof_core=debug")
            .with_test_writer()
            .try_init();
    });
}

/// First interpreter found on the usual system paths.
pub fn python() -> Option<PathBuf> {
    ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

/// A config rooted in `root` with enough address space for a plain
/// interpreter to start, or `None` when no python is installed.
pub fn config(root: &Path, timeout: Duration) -> Option<SandboxConfig> {
    setup();
    let Some(python) = python() else {
        eprintln!("python3 not found, skipping");
        return None;
    };
    Some(
        SandboxConfig::builder()
            .python_path(python)
            .workspace_root(root)
            .memory_limit_mb(256)
            .timeout(timeout)
            .cpu_limit_secs(timeout.as_secs() + 5)
            .build(),
    )
}
