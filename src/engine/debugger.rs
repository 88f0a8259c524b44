//! Scripted, non-interactive debugger sessions.
//!
//! The caller's script is screened, prefixed with a fixed preamble and
//! written to `debug/session.gdb`. The debugger only ever sees it as a
//! `-x` file argument.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};

use super::compiler::CompileArtifact;
use crate::error::{EngineError, Result};
use crate::sandbox::{
    sanitize_filename, CommandGuard, ConfinedCommand, ExecutionLimits, ExecutionResult,
    ProcessLauncher, Workspace,
};

/// Always prepended. The caller's script cannot re-enable a shell:
/// `startup-with-shell` is not an allowed setting and `with` is refused.
pub const SCRIPT_PREAMBLE: &str = "\
set startup-with-shell off
set pagination off
set confirm off
";

/// Used when the caller supplies no script.
pub const DEFAULT_SCRIPT: &str = "\
break main
run
backtrace
info registers
x/10i $pc
quit
";

const SCRIPT_FILE: &str = "session.gdb";

/// Runs the configured debugger against compiled artifacts.
#[derive(Clone)]
pub struct Debugger {
    executable: Option<PathBuf>,
    guard: Arc<CommandGuard>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("executable", &self.executable)
            .finish_non_exhaustive()
    }
}

impl Debugger {
    pub fn new(
        executable: Option<PathBuf>,
        guard: Arc<CommandGuard>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            executable,
            guard,
            launcher,
        }
    }

    pub const fn is_available(&self) -> bool {
        self.executable.is_some()
    }

    /// Screen `script` and assemble the full session script.
    pub fn prepare_script(&self, script: Option<&str>) -> Result<String> {
        let script = script
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SCRIPT);
        self.guard.authorize_script(script)?;

        let mut full = String::with_capacity(SCRIPT_PREAMBLE.len() + script.len() + 1);
        full.push_str(SCRIPT_PREAMBLE);
        full.push_str(script);
        if !full.ends_with('\n') {
            full.push('\n');
        }
        Ok(full)
    }

    /// Debug `artifact` driven by `script`, feeding `input` to the debuggee.
    #[instrument(skip(self, workspace, artifact, script, input), fields(workspace = workspace.id(), script_len = script.map_or(0, str::len)))]
    pub async fn debug(
        &self,
        workspace: &Workspace,
        artifact: &CompileArtifact,
        script: Option<&str>,
        input: &[u8],
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        let executable = self
            .executable
            .as_ref()
            .ok_or_else(|| EngineError::Config("no debugger is available on this host".into()))?;

        let script = self.prepare_script(script)?;
        let script_path = workspace.write_file("debug", &sanitize_filename(SCRIPT_FILE)?, script.as_bytes())?;

        let args: Vec<OsString> = vec![
            "-q".into(),
            "-batch".into(),
            "-nx".into(),
            "-x".into(),
            script_path.as_path().into(),
            artifact.executable.as_path().into(),
        ];
        self.guard
            .authorize(executable, &args, workspace.dir().as_path())?;

        let command = ConfinedCommand {
            program: executable.clone(),
            args,
            working_dir: workspace.confine(Path::new("debug"))?,
            stdin: input.to_vec(),
        };
        let result = self.launcher.run_confined(command, limits).await?;

        debug!(status = %result.status, elapsed_ms = result.elapsed_ms, "Debugger session finished");
        Ok(result)
    }
}
