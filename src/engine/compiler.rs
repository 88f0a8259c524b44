//! Confined compiler invocation.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{CompileError, EngineError, Result};
use crate::sandbox::{
    sanitize_filename, CommandGuard, ConfinedCommand, ConfinedPath, ExecutionLimits, ExitKind,
    ProcessLauncher, SafeName, Workspace,
};

/// Source file name used when the caller does not pick one.
pub const DEFAULT_SOURCE_NAME: &str = "main.cpp";

const SOURCE_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx", "c++"];

/// A pre-approved set of compiler flags. Callers select presets by name only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilePreset {
    /// Language standard, passed as `-std=<standard>`.
    pub standard: String,
    /// Optimization flag, e.g. `-O2`.
    pub optimization: String,
    pub flags: Vec<String>,
}

impl Default for CompilePreset {
    fn default() -> Self {
        Self {
            standard: "c++17".into(),
            optimization: "-O2".into(),
            flags: Vec::new(),
        }
    }
}

impl CompilePreset {
    pub const RELEASE: &'static str = "release";
    pub const DEBUG: &'static str = "debug";

    /// The presets every deployment starts with.
    pub fn builtin() -> HashMap<String, Self> {
        HashMap::from([
            (
                Self::RELEASE.to_string(),
                Self {
                    flags: vec!["-Wall".into(), "-Wextra".into()],
                    ..Self::default()
                },
            ),
            (
                Self::DEBUG.to_string(),
                Self {
                    optimization: "-O0".into(),
                    flags: vec!["-g".into()],
                    ..Self::default()
                },
            ),
        ])
    }
}

/// Resolved compiler settings.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Canonical path of the compiler binary.
    pub executable: PathBuf,
    pub presets: HashMap<String, CompilePreset>,
    pub default_preset: String,
    /// Compile-time limits, distinct from execution limits.
    pub limits: ExecutionLimits,
}

/// Caller source text written into a workspace.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Workspace identifier the unit belongs to.
    pub id: String,
    pub path: ConfinedPath,
    /// Stem used for the produced executable.
    pub stem: SafeName,
}

impl SourceUnit {
    /// Write `text` to `src/<filename>` inside `workspace`.
    ///
    /// A missing C++ extension is appended, so `solution` becomes
    /// `solution.cpp`.
    pub fn write(workspace: &Workspace, filename: Option<&str>, text: &str) -> Result<Self> {
        let name = sanitize_filename(filename.unwrap_or(DEFAULT_SOURCE_NAME))?;
        let has_extension = Path::new(name.as_str())
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        let name = if has_extension {
            name
        } else {
            sanitize_filename(&format!("{name}.cpp"))?
        };

        let stem = Path::new(name.as_str())
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main");
        let stem = sanitize_filename(stem)?;

        let path = workspace.write_file("src", &name, text.as_bytes())?;
        debug!(workspace = workspace.id(), path = %path, bytes = text.len(), "Wrote source unit");
        Ok(Self {
            id: workspace.id().to_string(),
            path,
            stem,
        })
    }
}

/// Product of a successful compile.
#[derive(Debug, Clone)]
pub struct CompileArtifact {
    pub executable: ConfinedPath,
    /// The exact argument vector handed to the compiler, program first.
    pub invocation: Vec<String>,
    /// Warnings printed by a successful compile.
    pub diagnostics: String,
    pub elapsed_ms: u64,
}

/// Drives the compiler through the resource limiter.
#[derive(Clone)]
pub struct Compiler {
    config: CompilerConfig,
    guard: Arc<CommandGuard>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    pub fn new(
        config: CompilerConfig,
        guard: Arc<CommandGuard>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            guard,
            launcher,
        }
    }

    pub const fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Look up a preset, falling back to the configured default.
    pub fn preset(&self, name: Option<&str>) -> Result<&CompilePreset> {
        let name = name.unwrap_or(self.config.default_preset.as_str());
        self.config.presets.get(name).ok_or_else(|| EngineError::InvalidName {
            name: name.to_string(),
            reason: "unknown compile preset",
        })
    }

    /// Fixed argument vector: source, standard, optimization, preset flags, output.
    pub fn arguments(preset: &CompilePreset, source: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(preset.flags.len() + 5);
        args.push(source.into());
        args.push(format!("-std={}", preset.standard).into());
        args.push(preset.optimization.clone().into());
        args.extend(preset.flags.iter().map(OsString::from));
        args.push("-o".into());
        args.push(output.into());
        args
    }

    /// Compile `source` with the named preset.
    ///
    /// Returns [`EngineError::Compile`] when the compiler rejects the source,
    /// runs out of time, or produces no executable.
    #[instrument(skip(self, workspace, source), fields(workspace = workspace.id(), preset = ?preset))]
    pub async fn compile(
        &self,
        workspace: &Workspace,
        source: &SourceUnit,
        preset: Option<&str>,
    ) -> Result<CompileArtifact> {
        let flags = self.preset(preset)?;
        let output = workspace.path_in("bin", &source.stem)?;
        let args = Self::arguments(flags, source.path.as_path(), output.as_path());

        self.guard
            .authorize(&self.config.executable, &args, workspace.dir().as_path())?;

        let invocation: Vec<String> = std::iter::once(self.config.executable.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let command = ConfinedCommand {
            program: self.config.executable.clone(),
            args,
            working_dir: workspace.dir().clone(),
            stdin: Vec::new(),
        };
        let result = self
            .launcher
            .run_confined(command, &self.config.limits)
            .await?;

        let mut diagnostics = if result.stderr.is_empty() {
            result.stdout.clone()
        } else {
            result.stderr.clone()
        };

        if !result.succeeded() {
            match result.status {
                ExitKind::Timeout => diagnostics.push_str(&format!(
                    "\ncompilation timed out after {} ms",
                    self.config.limits.timeout_ms
                )),
                ExitKind::MemoryExceeded => diagnostics.push_str(&format!(
                    "\ncompilation exceeded the {} MB memory limit",
                    self.config.limits.memory_mb
                )),
                ExitKind::OutputTruncated => {
                    diagnostics.push_str("\n[compiler output truncated]");
                }
                ExitKind::Signaled => diagnostics.push_str(&format!(
                    "\ncompiler terminated by signal {}",
                    result.signal.unwrap_or_default()
                )),
                ExitKind::Normal | ExitKind::CompileError => {}
            }
            info!(status = %result.status, exit_code = ?result.exit_code, "Compilation failed");
            return Err(CompileError {
                diagnostics: diagnostics.trim_start().to_string(),
                invocation,
                elapsed_ms: result.elapsed_ms,
            }
            .into());
        }

        if !output.as_path().is_file() {
            return Err(CompileError {
                diagnostics: "compiler produced no executable".into(),
                invocation,
                elapsed_ms: result.elapsed_ms,
            }
            .into());
        }

        debug!(elapsed_ms = result.elapsed_ms, "Compilation succeeded");
        Ok(CompileArtifact {
            executable: output,
            invocation,
            diagnostics,
            elapsed_ms: result.elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{manager, RecordingLauncher};
    use crate::sandbox::DenyList;

    fn compiler(launcher: Arc<RecordingLauncher>) -> Compiler {
        let executable = PathBuf::from("/usr/bin/g++");
        Compiler::new(
            CompilerConfig {
                executable: executable.clone(),
                presets: CompilePreset::builtin(),
                default_preset: CompilePreset::RELEASE.into(),
                limits: ExecutionLimits::default(),
            },
            Arc::new(CommandGuard::new(vec![executable], DenyList::default())),
            launcher,
        )
    }

    #[test]
    fn release_arguments_are_fixed() {
        let presets = CompilePreset::builtin();
        let args = Compiler::arguments(
            &presets[CompilePreset::RELEASE],
            Path::new("/ws/src/main.cpp"),
            Path::new("/ws/bin/main"),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["/ws/src/main.cpp", "-std=c++17", "-O2", "-Wall", "-Wextra", "-o", "/ws/bin/main"]
        );
    }

    #[test]
    fn debug_preset_has_symbols() {
        let presets = CompilePreset::builtin();
        let debug = &presets[CompilePreset::DEBUG];
        assert_eq!(debug.optimization, "-O0");
        assert!(debug.flags.contains(&"-g".to_string()));
    }

    #[test]
    fn source_unit_appends_extension() {
        let (_dir, manager) = manager();
        let ws = manager.create().unwrap();

        let unit = SourceUnit::write(&ws, Some("solution"), "int main(){}").unwrap();
        assert!(unit.path.as_path().ends_with("src/solution.cpp"));
        assert_eq!(unit.stem.as_str(), "solution");

        let unit = SourceUnit::write(&ws, None, "int main(){}").unwrap();
        assert!(unit.path.as_path().ends_with("src/main.cpp"));
        assert_eq!(unit.stem.as_str(), "main");
    }

    #[test]
    fn source_unit_rejects_separators() {
        let (_dir, manager) = manager();
        let ws = manager.create().unwrap();
        let err = SourceUnit::write(&ws, Some("../escape.cpp"), "").unwrap_err();
        assert!(err.is_security_rejection());
    }

    #[tokio::test]
    async fn unknown_preset_spawns_nothing() {
        let (_dir, manager) = manager();
        let ws = manager.create().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let unit = SourceUnit::write(&ws, None, "int main(){}").unwrap();

        let err = compiler(launcher.clone())
            .compile(&ws, &unit, Some("turbo"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidName { .. }));
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn compiler_failure_carries_diagnostics() {
        let (_dir, manager) = manager();
        let ws = manager.create().unwrap();
        let launcher = Arc::new(RecordingLauncher::failing("main.cpp:1:1: error: expected ';'"));
        let unit = SourceUnit::write(&ws, None, "int main(){ return 0 }").unwrap();

        let err = compiler(launcher.clone()).compile(&ws, &unit, None).await.unwrap_err();
        let EngineError::Compile(compile) = err else {
            panic!("expected compile error, got {err:?}");
        };
        assert!(compile.diagnostics.contains("expected ';'"));
        assert_eq!(compile.invocation[0], "/usr/bin/g++");
        assert_eq!(launcher.spawn_count(), 1);

        let recorded = launcher.commands();
        assert_eq!(recorded[0].program, PathBuf::from("/usr/bin/g++"));
        assert_eq!(recorded[0].working_dir, *ws.dir());
    }

    #[tokio::test]
    async fn missing_executable_is_a_compile_error() {
        let (_dir, manager) = manager();
        let ws = manager.create().unwrap();
        let launcher = Arc::new(RecordingLauncher::default().without_artifacts());
        let unit = SourceUnit::write(&ws, None, "int main(){}").unwrap();

        let err = compiler(launcher.clone()).compile(&ws, &unit, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Compile(ref c) if c.diagnostics.contains("no executable")));
        assert_eq!(launcher.spawn_count(), 1);
        assert!(!ws.dir().as_path().join("bin/main").exists());
    }
}
