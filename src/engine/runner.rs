//! Runs a compiled artifact once under execution limits.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::compiler::CompileArtifact;
use crate::error::Result;
use crate::sandbox::{
    sanitize_filename, CommandGuard, ConfinedCommand, ExecutionLimits, ExecutionResult,
    ProcessLauncher, Workspace,
};

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";

/// Executes artifacts. Never retries.
#[derive(Clone)]
pub struct Runner {
    guard: Arc<CommandGuard>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(guard: Arc<CommandGuard>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { guard, launcher }
    }

    /// Run `artifact` with `input` on stdin.
    ///
    /// Input and captured stdout are also kept under `io/` for the lifetime
    /// of the workspace.
    #[instrument(skip(self, workspace, artifact, input), fields(workspace = workspace.id(), input_len = input.len()))]
    pub async fn run(
        &self,
        workspace: &Workspace,
        artifact: &CompileArtifact,
        input: &[u8],
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        self.guard.authorize::<OsString>(
            artifact.executable.as_path(),
            &[],
            workspace.dir().as_path(),
        )?;

        workspace.write_file("io", &sanitize_filename(INPUT_FILE)?, input)?;
        let io_dir = workspace.confine(Path::new("io"))?;

        let command = ConfinedCommand {
            program: artifact.executable.as_path().to_path_buf(),
            args: Vec::new(),
            working_dir: io_dir,
            stdin: input.to_vec(),
        };
        let result = self.launcher.run_confined(command, limits).await?;

        if let Err(e) = workspace.write_file("io", &sanitize_filename(OUTPUT_FILE)?, result.stdout.as_bytes()) {
            warn!(error = %e, "Failed to keep program output");
        }

        debug!(status = %result.status, exit_code = ?result.exit_code, elapsed_ms = result.elapsed_ms, "Run finished");
        Ok(result)
    }
}
