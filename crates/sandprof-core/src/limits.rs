//! OS-enforced resource ceilings for the child process

use crate::{Result, SandprofError};
use nix::sys::resource::{Resource, setrlimit};
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

/// CPU and address-space ceilings applied to the child before exec.
///
/// The address-space soft and hard limits are the same value, so an
/// unprivileged child cannot raise them again; breaching it makes allocations
/// fail. The CPU hard limit sits one second above the soft one: the kernel
/// sends `SIGKILL` at the hard limit, so equal values would never let the
/// child see `SIGXCPU` at the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Seconds of CPU time (`RLIMIT_CPU`)
    pub cpu_seconds: u64,

    /// Bytes of virtual memory (`RLIMIT_AS`)
    pub address_space_bytes: u64,
}

impl ResourceLimits {
    pub const DEFAULT_CPU_SECONDS: u64 = 11;
    pub const DEFAULT_ADDRESS_SPACE_BYTES: u64 = 100 * 1024 * 1024; // 100MB

    #[must_use]
    pub const fn new(cpu_seconds: u64, address_space_bytes: u64) -> Self {
        Self {
            cpu_seconds,
            address_space_bytes,
        }
    }

    /// Smallest CPU ceiling that still lets the wall-clock timeout fire first.
    #[must_use]
    pub fn min_cpu_seconds_for(timeout: Duration) -> u64 {
        timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_seconds == 0 {
            return Err(SandprofError::Config("cpu ceiling must be positive".into()));
        }
        if self.address_space_bytes == 0 {
            return Err(SandprofError::Config(
                "address space ceiling must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Lower the ceilings of the calling process.
    ///
    /// Only async-signal-safe calls happen here; it runs between fork and exec.
    pub fn apply(&self) -> std::io::Result<()> {
        setrlimit(
            Resource::RLIMIT_CPU,
            self.cpu_seconds,
            self.cpu_seconds.saturating_add(1),
        )?;
        setrlimit(
            Resource::RLIMIT_AS,
            self.address_space_bytes,
            self.address_space_bytes,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }

    /// Bind the ceilings to `command` as its pre-exec hook.
    ///
    /// The hook also asks the kernel to SIGKILL the child if the spawning
    /// thread dies, so a crashed host never leaves the child running.
    pub fn bind(self, command: &mut Command) -> &mut Command {
        // SAFETY: the closure only issues setrlimit and prctl syscalls, which
        // are async-signal-safe and allocate nothing.
        unsafe {
            command.pre_exec(move || {
                self.apply()?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            })
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CPU_SECONDS, Self::DEFAULT_ADDRESS_SPACE_BYTES)
    }
}
