//! Daemon configuration.
//!
//! The raw [`Config`] is read from a JSON file named by `--config` or the
//! `OI_SANDBOX_CONFIG` environment variable; every field has a default.
//! [`EngineConfig::resolve`] turns it into the immutable process-wide
//! configuration shared by every request.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::engine::compiler::{CompilePreset, CompilerConfig};
use crate::sandbox::command_guard::{
    DEFAULT_FORBIDDEN_DEBUGGER_COMMANDS, DEFAULT_FORBIDDEN_PATTERNS, DEFAULT_FORBIDDEN_SUBSTRINGS,
};
use crate::sandbox::{DenyList, ExecutionLimits, LimiterSettings};

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub compilation: CompilationConfig,
    pub execution: ExecutionConfig,
    pub debugger: DebuggerConfig,
    pub security: SecurityConfig,
    pub workspace: WorkspaceConfig,
    pub inherit_env: InheritEnv,
}

/// Filesystem locations and external tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which per-request workspaces are created.
    pub workspace_root: PathBuf,
    /// Compiler binary; a bare name is looked up on `PATH`.
    pub compiler: PathBuf,
    /// Debugger binary; a bare name is looked up on `PATH`.
    pub debugger: PathBuf,
    /// Directory of extra `<id>.in` / `<id>.out` test cases.
    pub tests_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("oi-sandbox"),
            compiler: "g++".into(),
            debugger: "gdb".into(),
            tests_dir: None,
        }
    }
}

/// Compiler flags and compile-time ceilings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilationConfig {
    pub default_preset: String,
    pub presets: HashMap<String, CompilePreset>,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub max_output_bytes: usize,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            default_preset: "release".into(),
            presets: CompilePreset::builtin(),
            timeout_ms: 30_000,
            memory_mb: 2048,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Program execution limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Limits applied when a request leaves a field unset.
    pub defaults: ExecutionLimits,
    /// Absolute maxima. Requests are clamped to these.
    pub ceilings: ExecutionLimits,
    pub kill_grace_ms: u64,
    pub memory_sample_interval_ms: u64,
    /// Address-space backstop as a multiple of the memory ceiling (0 = off).
    pub address_space_factor: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            defaults: ExecutionLimits::default(),
            ceilings: ExecutionLimits {
                timeout_ms: 20_000,
                memory_mb: 1024,
                max_output_bytes: 1024 * 1024,
            },
            kill_grace_ms: 500,
            memory_sample_interval_ms: 10,
            address_space_factor: 2,
        }
    }
}

/// Debugger session limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub max_output_bytes: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_mb: 1024,
            max_output_bytes: 256 * 1024,
        }
    }
}

/// Deny-list data.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub forbidden_commands: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    pub forbidden_debugger_commands: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(ToString::to_string).collect();
        Self {
            forbidden_commands: owned(DEFAULT_FORBIDDEN_SUBSTRINGS),
            forbidden_patterns: owned(DEFAULT_FORBIDDEN_PATTERNS),
            forbidden_debugger_commands: owned(DEFAULT_FORBIDDEN_DEBUGGER_COMMANDS),
        }
    }
}

/// Workspace retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Age after which a leftover workspace is reaped.
    pub retention_seconds: u64,
    /// Interval between reaper sweeps.
    pub reaper_interval_seconds: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 600,
            reaper_interval_seconds: 60,
        }
    }
}

/// Host environment variables passed through to every child.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InheritEnv {
    pub vars: Vec<String>,
}

impl Default for InheritEnv {
    fn default() -> Self {
        Self {
            vars: vec!["PATH".into()],
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit path > `OI_SANDBOX_CONFIG` env var > defaults.
    /// Env overrides (`OI_SANDBOX_WORKSPACE`, `OI_SANDBOX_COMPILER`,
    /// `OI_SANDBOX_DEBUGGER`) are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("OI_SANDBOX_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_json(&json)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os("OI_SANDBOX_WORKSPACE") {
            self.paths.workspace_root = root.into();
        }
        if let Some(compiler) = std::env::var_os("OI_SANDBOX_COMPILER") {
            self.paths.compiler = compiler.into();
        }
        if let Some(debugger) = std::env::var_os("OI_SANDBOX_DEBUGGER") {
            self.paths.debugger = debugger.into();
        }
    }
}

/// Immutable process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub retention: Duration,
    pub reaper_interval: Duration,
    pub compiler: CompilerConfig,
    /// Canonical path of the debugger, if one was found.
    pub debugger: Option<PathBuf>,
    pub debug_limits: ExecutionLimits,
    pub default_limits: ExecutionLimits,
    pub ceilings: ExecutionLimits,
    pub limiter: LimiterSettings,
    pub deny: DenyList,
    pub tests_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Validate `config` and resolve tool paths.
    ///
    /// A missing compiler is fatal; a missing debugger only disables the
    /// debug tool.
    pub fn resolve(config: Config) -> Result<Self> {
        let Config {
            paths,
            compilation,
            execution,
            debugger,
            security,
            workspace,
            inherit_env,
        } = config;

        anyhow::ensure!(
            execution.defaults.within(&execution.ceilings),
            "execution defaults {:?} exceed ceilings {:?}",
            execution.defaults,
            execution.ceilings
        );
        anyhow::ensure!(
            compilation.presets.contains_key(&compilation.default_preset),
            "default preset '{}' is not defined",
            compilation.default_preset
        );

        let compiler_path = resolve_executable(&paths.compiler)
            .with_context(|| format!("Compiler not found: {}", paths.compiler.display()))?;
        let debugger_path = resolve_executable(&paths.debugger).ok();
        if debugger_path.is_none() {
            info!(debugger = %paths.debugger.display(), "Debugger not found, debugging disabled");
        }

        let deny = DenyList::new(
            security.forbidden_commands.iter().map(String::as_str),
            security.forbidden_patterns.iter().map(String::as_str),
            security.forbidden_debugger_commands.iter().map(String::as_str),
        )?;

        let inherited_env: Vec<(String, OsString)> = inherit_env
            .vars
            .iter()
            .filter_map(|name| std::env::var_os(name).map(|value| (name.clone(), value)))
            .collect();

        Ok(Self {
            workspace_root: paths.workspace_root,
            retention: Duration::from_secs(workspace.retention_seconds),
            reaper_interval: Duration::from_secs(workspace.reaper_interval_seconds.max(1)),
            compiler: CompilerConfig {
                executable: compiler_path,
                presets: compilation.presets,
                default_preset: compilation.default_preset,
                limits: ExecutionLimits {
                    timeout_ms: compilation.timeout_ms,
                    memory_mb: compilation.memory_mb,
                    max_output_bytes: compilation.max_output_bytes,
                },
            },
            debugger: debugger_path,
            debug_limits: ExecutionLimits {
                timeout_ms: debugger.timeout_ms,
                memory_mb: debugger.memory_mb,
                max_output_bytes: debugger.max_output_bytes,
            },
            default_limits: execution.defaults,
            ceilings: execution.ceilings,
            limiter: LimiterSettings {
                kill_grace: Duration::from_millis(execution.kill_grace_ms),
                sample_interval: Duration::from_millis(execution.memory_sample_interval_ms.max(1)),
                address_space_factor: execution.address_space_factor,
                inherited_env,
            },
            deny,
            tests_dir: paths.tests_dir,
        })
    }
}

/// Resolve `program` to a canonical absolute path.
///
/// Names without a separator are searched on the daemon's `PATH`.
pub fn resolve_executable(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        anyhow::ensure!(program.is_file(), "{} is not a file", program.display());
        return program
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", program.display()));
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .flat_map(|dir| candidates(&dir, program))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.canonicalize().ok())
        .with_context(|| format!("{} not found on PATH", program.display()))
}

fn candidates(dir: &Path, program: &Path) -> Vec<PathBuf> {
    let plain = dir.join(program);
    if cfg!(windows) && program.extension().is_none() {
        vec![plain.with_extension("exe"), plain]
    } else {
        vec![plain]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.paths.compiler, PathBuf::from("g++"));
        assert_eq!(config.compilation.default_preset, "release");
        assert!(config.compilation.presets.contains_key("debug"));
        assert_eq!(config.execution.defaults, ExecutionLimits::default());
        assert_eq!(config.inherit_env.vars, vec!["PATH"]);
        assert!(!config.security.forbidden_commands.is_empty());
    }

    #[test]
    fn parse_partial_sections() {
        let json = r#"{
            "paths": {
                "workspace_root": "/srv/oi/work",
                "compiler": "/usr/bin/g++-13",
                "tests_dir": "/srv/oi/tests"
            },
            "execution": {
                "defaults": { "timeout_ms": 1000, "memory_mb": 128, "max_output_bytes": 4096 },
                "kill_grace_ms": 250
            },
            "workspace": { "retention_seconds": 60 }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.paths.workspace_root, PathBuf::from("/srv/oi/work"));
        assert_eq!(config.paths.debugger, PathBuf::from("gdb"));
        assert_eq!(config.paths.tests_dir, Some(PathBuf::from("/srv/oi/tests")));
        assert_eq!(config.execution.defaults.timeout_ms, 1000);
        assert_eq!(config.execution.kill_grace_ms, 250);
        // Untouched fields keep defaults
        assert_eq!(config.execution.ceilings.memory_mb, 1024);
        assert_eq!(config.workspace.retention_seconds, 60);
        assert_eq!(config.workspace.reaper_interval_seconds, 60);
    }

    #[test]
    fn parse_custom_preset() {
        let json = r#"{
            "compilation": {
                "default_preset": "strict",
                "presets": {
                    "strict": { "standard": "c++20", "optimization": "-O2", "flags": ["-Wall", "-Werror"] }
                }
            }
        }"#;
        let config = Config::from_json(json).unwrap();
        let strict = &config.compilation.presets["strict"];
        assert_eq!(strict.standard, "c++20");
        assert_eq!(strict.flags, vec!["-Wall", "-Werror"]);
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workspace": {"retention_seconds": 5}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.workspace.retention_seconds, 5);
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/config.json"))).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_engine_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.workspace_root = dir.path().join("ws");
        config.paths.compiler = "/bin/sh".into();
        config.paths.debugger = "/nonexistent/gdb".into();

        let resolved = EngineConfig::resolve(config).unwrap();
        assert!(resolved.compiler.executable.is_absolute());
        assert!(resolved.debugger.is_none());
        assert_eq!(resolved.retention, Duration::from_secs(600));
    }

    #[test]
    fn resolve_rejects_defaults_above_ceilings() {
        let mut config = Config::default();
        config.paths.compiler = "/bin/sh".into();
        config.execution.defaults.timeout_ms = config.execution.ceilings.timeout_ms + 1;
        assert!(EngineConfig::resolve(config).is_err());
    }

    #[test]
    fn resolve_rejects_unknown_default_preset() {
        let mut config = Config::default();
        config.paths.compiler = "/bin/sh".into();
        config.compilation.default_preset = "turbo".into();
        assert!(EngineConfig::resolve(config).is_err());
    }

    #[test]
    fn resolve_rejects_missing_compiler() {
        let mut config = Config::default();
        config.paths.compiler = "/nonexistent/g++".into();
        assert!(EngineConfig::resolve(config).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_executable_searches_path() {
        let sh = resolve_executable(Path::new("sh")).unwrap();
        assert!(sh.is_absolute());
        assert!(resolve_executable(Path::new("definitely-not-a-real-tool-xyz")).is_err());
    }
}
