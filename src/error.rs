//! Error taxonomy for the build-and-execute engine.
//!
//! Only request rejections and host faults are errors. A program that times
//! out, blows its memory ceiling, floods its output or dies on a signal is a
//! normal outcome and is reported through [`crate::sandbox::ExitKind`].

use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A path resolved outside the workspace root.
    #[error("path escapes workspace: {}", path.display())]
    PathEscape { path: PathBuf },

    /// A caller-supplied name cannot be used to build a path.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// An executable or argument was rejected before spawning.
    #[error("forbidden command: {reason}")]
    ForbiddenCommand { reason: String },

    /// The compiler rejected the source.
    #[error("compilation failed")]
    Compile(#[from] CompileError),

    /// Unknown test case identifier.
    #[error("test case not found: {id}")]
    NotFound { id: String },

    /// The host could not spawn, drive or reap a process.
    #[error("limiter fault: {reason}")]
    LimiterFault { reason: String },

    /// Workspace filesystem failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Compiler diagnostics for a rejected source unit.
#[derive(Debug, Clone, Error)]
#[error("{diagnostics}")]
pub struct CompileError {
    /// Captured compiler stderr, truncated to the output ceiling.
    pub diagnostics: String,
    /// The exact argument vector handed to the compiler.
    pub invocation: Vec<String>,
    pub elapsed_ms: u64,
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::ForbiddenCommand {
            reason: reason.into(),
        }
    }

    pub fn limiter(reason: impl Into<String>) -> Self {
        Self::LimiterFault {
            reason: reason.into(),
        }
    }

    /// Rejections caused by hostile or malformed input. Never retried.
    pub const fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::PathEscape { .. } | Self::InvalidName { .. } | Self::ForbiddenCommand { .. }
        )
    }

    /// Failures of the host itself rather than of the submitted program.
    pub const fn is_service_fault(&self) -> bool {
        matches!(
            self,
            Self::LimiterFault { .. } | Self::Io { .. } | Self::Config(_)
        )
    }
}
