//! Confinement layer: paths, commands, limits and process execution.
//!
//! Nothing in here knows about compilers or test cases. The engine hands
//! this layer a fully assembled [`ConfinedCommand`] and gets back an
//! [`ExecutionResult`] describing how the process ended.

pub mod command_guard;
mod limiter;
pub mod limits;
pub mod memory;
pub mod path_guard;
pub mod workspace;

pub use command_guard::{CommandGuard, DenyList};
pub use limiter::{LimiterSettings, ResourceLimiter};
pub use limits::{ExecutionLimits, RequestedLimits, MIN_MEMORY_MB};
pub use path_guard::{confine, sanitize_filename, ConfinedPath, SafeName};
pub use workspace::{Workspace, WorkspaceManager};

use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// How a confined process invocation ended. Exactly one per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Exited on its own before any limit fired. The exit code is kept.
    Normal,
    /// Killed at the wall-clock ceiling.
    Timeout,
    /// Killed at the memory ceiling, or died of an allocation failure.
    MemoryExceeded,
    /// Killed after writing past the output ceiling.
    OutputTruncated,
    /// Terminated by a signal the limiter did not send.
    Signaled,
    /// The source never produced an artifact.
    CompileError,
}

impl ExitKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory-exceeded",
            Self::OutputTruncated => "output-truncated",
            Self::Signaled => "signaled",
            Self::CompileError => "compile-error",
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one compiler, program or debugger invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: ExitKind,
    /// Exit code, when the process exited rather than being signaled.
    pub exit_code: Option<i32>,
    /// Terminating signal, when there was one.
    pub signal: Option<i32>,
    /// Captured stdout, at most `max_output_bytes` long.
    pub stdout: String,
    /// Captured stderr, at most `max_output_bytes` long.
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed_ms: u64,
    /// Peak sampled resident memory of the process group, if measurable.
    pub peak_memory_kb: Option<u64>,
}

impl ExecutionResult {
    /// Normal exit with status zero.
    pub fn succeeded(&self) -> bool {
        self.status == ExitKind::Normal && self.exit_code == Some(0)
    }
}

/// A fully assembled, already authorized process invocation.
#[derive(Debug, Clone)]
pub struct ConfinedCommand {
    /// Absolute path of the executable. Never taken from a request.
    pub program: PathBuf,
    /// Discrete argument vector, handed straight to process creation.
    pub args: Vec<OsString>,
    pub working_dir: ConfinedPath,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Vec<u8>,
}

/// Spawns confined processes under execution limits.
///
/// [`ResourceLimiter`] is the real implementation; tests substitute
/// doubles to observe whether anything was spawned at all.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run `command` to completion or until a limit fires.
    ///
    /// Limit violations are reported through [`ExecutionResult::status`].
    /// `Err` means the host could not spawn or reap the process.
    async fn run_confined(
        &self,
        command: ConfinedCommand,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult>;
}
