//! # sandprof-core
//!
//! Sandboxed execution and profiling of untrusted Python code.
//!
//! This crate provides the pieces behind a profiling run:
//! - A syntax pre-check that rejects malformed code before it runs
//! - A harness that wraps the code in a profiled entry point
//! - A private per-run workspace, removed on every exit path
//! - A supervised child under CPU/address-space ceilings and a wall-clock
//!   timeout, killed together with all its descendants
//! - Aggregation of stdout, the ranked profile report and peak memory

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod harness;
pub mod limits;
pub mod precheck;
pub mod process;
pub mod protocol;
pub mod report;
pub mod result;
pub mod sandbox;
pub mod workspace;

pub use config::SandboxConfig;
pub use error::{CleanupError, ExecutionError, SandprofError, ValidationError};
pub use limits::ResourceLimits;
pub use result::{ExecutionResult, Outcome};
pub use sandbox::{Sandbox, profile};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SandprofError>;
