//! Build-and-execute orchestration.
//!
//! An [`ExecutionRequest`] is validated, written into a fresh workspace,
//! compiled, then either run or debugged, and finally compared against the
//! expected output. Each request runs on its own task and owns its
//! workspace; only the configuration and test-case registry are shared.

pub mod comparator;
pub mod compiler;
pub mod debugger;
pub mod report;
pub mod runner;
pub mod testcase;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::sandbox::{
    sanitize_filename, CommandGuard, ExecutionLimits, ExecutionResult, ExitKind, ProcessLauncher,
    RequestedLimits, ResourceLimiter, Workspace, WorkspaceManager,
};
use comparator::{compare, ComparisonOptions, ComparisonResult};
use compiler::{CompilePreset, Compiler, SourceUnit};
use debugger::Debugger;
use runner::Runner;
use testcase::TestCaseRegistry;

/// What to do with the compiled artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    CompileRun,
    Debug,
}

/// A validated request handed over by an adapter.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub source: String,
    pub stdin: String,
    pub expected_output: Option<String>,
    pub limits: RequestedLimits,
    pub mode: Mode,
    /// Debugger script; the default script is used when absent.
    pub debug_script: Option<String>,
    /// Source file name; sanitized before use.
    pub filename: Option<String>,
    /// Compile preset name. Ignored in debug mode.
    pub preset: Option<String>,
    /// Registered test case supplying stdin and expected output.
    pub test_case: Option<String>,
    pub comparison: ComparisonOptions,
}

/// Compiler side of a report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileSummary {
    pub invocation: Vec<String>,
    pub diagnostics: String,
    pub elapsed_ms: u64,
}

/// Everything a caller gets back for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub request_id: String,
    pub mode: Mode,
    pub test_case: Option<String>,
    pub limits: ExecutionLimits,
    pub compile: CompileSummary,
    pub result: ExecutionResult,
    /// Present when an expected output was supplied in run mode.
    pub comparison: Option<ComparisonResult>,
}

/// The engine. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Engine {
    config: Arc<EngineConfig>,
    workspaces: Arc<WorkspaceManager>,
    compiler: Compiler,
    runner: Runner,
    debugger: Debugger,
    tests: Arc<TestCaseRegistry>,
}

impl Engine {
    /// Build an engine that spawns through the [`ResourceLimiter`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        let launcher = Arc::new(ResourceLimiter::new(config.limiter.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Build an engine around an arbitrary launcher.
    pub fn with_launcher(config: EngineConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        let workspaces = Arc::new(WorkspaceManager::new(
            &config.workspace_root,
            config.retention,
            config.reaper_interval,
        )?);
        let tests = Arc::new(TestCaseRegistry::load(config.tests_dir.as_deref()));

        let allowed = std::iter::once(config.compiler.executable.clone())
            .chain(config.debugger.clone())
            .collect();
        let guard = Arc::new(CommandGuard::new(allowed, config.deny.clone()));

        info!(
            workspace_root = %workspaces.root().display(),
            compiler = %config.compiler.executable.display(),
            debugger = ?config.debugger,
            test_cases = tests.len(),
            "Engine ready"
        );

        Ok(Self {
            compiler: Compiler::new(config.compiler.clone(), Arc::clone(&guard), Arc::clone(&launcher)),
            runner: Runner::new(Arc::clone(&guard), Arc::clone(&launcher)),
            debugger: Debugger::new(config.debugger.clone(), guard, launcher),
            config: Arc::new(config),
            workspaces,
            tests,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn test_cases(&self) -> &TestCaseRegistry {
        &self.tests
    }

    pub const fn debugger_available(&self) -> bool {
        self.debugger.is_available()
    }

    /// Execute `request` on a detached task.
    ///
    /// Dropping the returned future does not cancel the request: limits are
    /// still enforced and the workspace is still removed.
    pub async fn execute(self: &Arc<Self>, request: ExecutionRequest) -> Result<ExecutionReport> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.process(request).await })
            .await
            .map_err(|e| EngineError::limiter(format!("request task failed: {e}")))?
    }

    /// Compare two texts with the engine's comparator.
    pub fn compare(actual: &str, expected: &str, options: ComparisonOptions) -> ComparisonResult {
        compare(actual, expected, options)
    }

    #[instrument(skip_all, fields(mode = ?request.mode, source_len = request.source.len()))]
    async fn process(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let (stdin, expected) = match &request.test_case {
            Some(id) => {
                let case = self.tests.get(id)?;
                (case.input.clone(), Some(case.expected_output.clone()))
            }
            None => (request.stdin.clone(), request.expected_output.clone()),
        };

        let (limits, preset) = match request.mode {
            Mode::CompileRun => (
                request
                    .limits
                    .resolve(&self.config.default_limits, &self.config.ceilings),
                request.preset.as_deref(),
            ),
            Mode::Debug => (
                request
                    .limits
                    .resolve(&self.config.debug_limits, &self.config.debug_limits),
                Some(CompilePreset::DEBUG),
            ),
        };

        // Reject bad input before touching the filesystem.
        self.compiler.preset(preset)?;
        if let Some(name) = &request.filename {
            sanitize_filename(name)?;
        }
        if request.mode == Mode::Debug {
            if !self.debugger.is_available() {
                return Err(EngineError::Config("no debugger is available on this host".into()));
            }
            self.debugger.prepare_script(request.debug_script.as_deref())?;
        }
        let preset = preset.map(str::to_owned);

        let workspace = self.workspaces.create()?;
        let outcome = self
            .process_in(&workspace, request, stdin, expected, limits, preset.as_deref())
            .await;
        workspace.close().await;
        outcome
    }

    async fn process_in(
        &self,
        workspace: &Workspace,
        request: ExecutionRequest,
        stdin: String,
        expected: Option<String>,
        limits: ExecutionLimits,
        preset: Option<&str>,
    ) -> Result<ExecutionReport> {
        let request_id = workspace.id().to_string();
        info!(request_id = %request_id, timeout_ms = limits.timeout_ms, memory_mb = limits.memory_mb, "Processing request");

        let source = SourceUnit::write(workspace, request.filename.as_deref(), &request.source)?;

        let artifact = match self.compiler.compile(workspace, &source, preset).await {
            Ok(artifact) => artifact,
            Err(EngineError::Compile(e)) => {
                info!(request_id = %request_id, "Compilation rejected the source");
                let comparison = expected
                    .filter(|_| request.mode == Mode::CompileRun)
                    .map(|exp| ComparisonResult::error("", &exp, "compilation failed"));
                return Ok(ExecutionReport {
                    request_id,
                    mode: request.mode,
                    test_case: request.test_case,
                    limits,
                    result: ExecutionResult {
                        status: ExitKind::CompileError,
                        exit_code: None,
                        signal: None,
                        stdout: String::new(),
                        stderr: e.diagnostics.clone(),
                        stdout_truncated: false,
                        stderr_truncated: false,
                        elapsed_ms: e.elapsed_ms,
                        peak_memory_kb: None,
                    },
                    compile: CompileSummary {
                        invocation: e.invocation,
                        diagnostics: e.diagnostics,
                        elapsed_ms: e.elapsed_ms,
                    },
                    comparison,
                });
            }
            Err(e) => return Err(e),
        };

        let result = match request.mode {
            Mode::CompileRun => {
                self.runner
                    .run(workspace, &artifact, stdin.as_bytes(), &limits)
                    .await?
            }
            Mode::Debug => {
                self.debugger
                    .debug(
                        workspace,
                        &artifact,
                        request.debug_script.as_deref(),
                        stdin.as_bytes(),
                        &limits,
                    )
                    .await?
            }
        };

        let comparison = match (request.mode, expected) {
            (Mode::CompileRun, Some(expected)) if result.status == ExitKind::Normal => {
                Some(compare(&result.stdout, &expected, request.comparison))
            }
            (Mode::CompileRun, Some(expected)) => Some(ComparisonResult::error(
                &result.stdout,
                &expected,
                format!("program ended with status {}", result.status),
            )),
            _ => None,
        };

        if let Some(c) = &comparison {
            if !c.is_match() {
                warn!(request_id = %request_id, verdict = %c.verdict, "Output does not match");
            }
        }
        info!(
            request_id = %request_id,
            status = %result.status,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed_ms,
            "Request finished"
        );

        Ok(ExecutionReport {
            request_id,
            mode: request.mode,
            test_case: request.test_case,
            limits,
            compile: CompileSummary {
                invocation: artifact.invocation,
                diagnostics: artifact.diagnostics,
                elapsed_ms: artifact.elapsed_ms,
            },
            result,
            comparison,
        })
    }
}
