//! MCP server implementation using rmcp.
//!
//! Exposes the build-and-execute engine as MCP tools. Every tool answers
//! with a markdown report followed by the structured result as JSON.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::engine::comparator::ComparisonOptions;
use crate::engine::{report, Engine, ExecutionRequest, Mode};
use crate::error::EngineError;
use crate::sandbox::RequestedLimits;

/// MCP server for sandboxed C++ judging.
#[derive(Clone)]
pub struct SandboxServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the compile_and_run tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CompileAndRunParams {
    #[schemars(description = "C++ source code to compile and run")]
    pub code: String,

    #[schemars(description = "Text fed to the program's standard input")]
    #[serde(default)]
    pub input: String,

    #[schemars(description = "Expected output; when given, the program output is compared against it")]
    #[serde(default)]
    pub expected_output: Option<String>,

    #[schemars(description = "Source file name, e.g. 'solution.cpp'")]
    #[serde(default)]
    pub filename: Option<String>,

    #[schemars(description = "Wall-clock limit in milliseconds (clamped by the server)")]
    #[serde(default)]
    pub time_limit: Option<u64>,

    #[schemars(description = "Memory limit in megabytes (clamped by the server)")]
    #[serde(default)]
    pub memory_limit: Option<u64>,

    #[schemars(description = "Registered test case id; supplies input and expected output")]
    #[serde(default)]
    pub test_case: Option<String>,

    #[schemars(description = "Compile preset: 'release' (default) or 'debug'")]
    #[serde(default)]
    pub preset: Option<String>,

    #[schemars(description = "Ignore whitespace differences when comparing (default true)")]
    #[serde(default)]
    pub ignore_whitespace: Option<bool>,

    #[schemars(description = "Ignore case differences when comparing (default false)")]
    #[serde(default)]
    pub ignore_case: Option<bool>,
}

/// Parameters for the debug_with_gdb tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct DebugParams {
    #[schemars(description = "C++ source code to debug")]
    pub code: String,

    #[schemars(description = "GDB batch script; defaults to break main, run, backtrace, info registers")]
    #[serde(default)]
    pub gdb_script: Option<String>,

    #[schemars(description = "Text fed to the debugged program's standard input")]
    #[serde(default)]
    pub input: String,
}

/// Parameters for the compare_outputs tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompareParams {
    #[schemars(description = "Actual program output")]
    pub actual: String,

    #[schemars(description = "Expected output")]
    pub expected: String,

    #[schemars(description = "Ignore whitespace differences (default true)")]
    #[serde(default = "default_true")]
    pub ignore_whitespace: bool,

    #[schemars(description = "Ignore case differences (default false)")]
    #[serde(default)]
    pub ignore_case: bool,
}

/// Parameters for the read_test_case tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TestCaseParams {
    #[schemars(description = "Test case identifier, e.g. 'a+b'")]
    pub test_case_id: String,
}

const fn default_true() -> bool {
    true
}

#[tool_router]
impl SandboxServer {
    /// Create a new server around a shared engine.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Compile C++ code, run it on the given input and optionally judge the output.
    #[tool(description = "Compile C++ code in a sandbox, run it with the given input under time and memory limits, and compare against an expected output")]
    async fn compile_and_run(
        &self,
        Parameters(params): Parameters<CompileAndRunParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            code_len = params.code.len(),
            input_len = params.input.len(),
            test_case = ?params.test_case,
            "compile_and_run"
        );

        let defaults = ComparisonOptions::default();
        let request = ExecutionRequest {
            source: params.code,
            stdin: params.input,
            expected_output: params.expected_output,
            limits: RequestedLimits {
                timeout_ms: params.time_limit,
                memory_mb: params.memory_limit,
                max_output_bytes: None,
            },
            mode: Mode::CompileRun,
            debug_script: None,
            filename: params.filename,
            preset: params.preset,
            test_case: params.test_case,
            comparison: ComparisonOptions {
                ignore_whitespace: params.ignore_whitespace.unwrap_or(defaults.ignore_whitespace),
                ignore_case: params.ignore_case.unwrap_or(defaults.ignore_case),
            },
        };

        let report = self.engine.execute(request).await.map_err(to_mcp_error)?;
        let failed = !report.result.succeeded();
        respond(report::execution(&report), &report, failed)
    }

    /// Compile with debug symbols and run a GDB batch script against the program.
    #[tool(description = "Compile C++ code with debug symbols and run it under GDB with a batch script")]
    async fn debug_with_gdb(
        &self,
        Parameters(params): Parameters<DebugParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            code_len = params.code.len(),
            script_len = params.gdb_script.as_ref().map_or(0, String::len),
            "debug_with_gdb"
        );

        if !self.engine.debugger_available() {
            return Ok(CallToolResult::error(vec![Content::text(
                "No debugger is available on this host",
            )]));
        }

        let request = ExecutionRequest {
            source: params.code,
            stdin: params.input,
            mode: Mode::Debug,
            debug_script: params.gdb_script,
            ..ExecutionRequest::default()
        };

        let report = self.engine.execute(request).await.map_err(to_mcp_error)?;
        let failed = report.result.status == crate::sandbox::ExitKind::CompileError;
        respond(report::execution(&report), &report, failed)
    }

    /// Compare two outputs line by line.
    #[tool(description = "Compare an actual output against an expected output, optionally ignoring whitespace and case")]
    async fn compare_outputs(
        &self,
        Parameters(params): Parameters<CompareParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = Engine::compare(
            &params.actual,
            &params.expected,
            ComparisonOptions {
                ignore_whitespace: params.ignore_whitespace,
                ignore_case: params.ignore_case,
            },
        );
        respond(report::comparison(&result), &result, false)
    }

    /// Show one registered test case.
    #[tool(description = "Read a registered test case (input and expected output)")]
    async fn read_test_case(
        &self,
        Parameters(params): Parameters<TestCaseParams>,
    ) -> Result<CallToolResult, McpError> {
        let case = self
            .engine
            .test_cases()
            .get(&params.test_case_id)
            .map_err(to_mcp_error)?;
        respond(report::test_case(case), case, false)
    }

    /// List registered test cases.
    #[tool(description = "List the registered test cases")]
    async fn list_test_cases(&self) -> Result<CallToolResult, McpError> {
        let cases: Vec<_> = self.engine.test_cases().list().collect();
        respond(report::test_case_list(cases.iter().copied()), &cases, false)
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let cases: Vec<_> = self
            .engine
            .test_cases()
            .list()
            .map(|c| c.id.as_str())
            .collect();
        let limits = &self.engine.config().ceilings;

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "oi-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Compile and run C++ solutions in a confined workspace.\n\
                 \n\
                 - compile_and_run: code, input, optional expected_output / test_case\n\
                 - debug_with_gdb: code, optional gdb_script\n\
                 - compare_outputs: actual, expected\n\
                 - read_test_case / list_test_cases\n\
                 \n\
                 Limits are capped at {} ms and {} MB. Test cases: {cases:?}",
                limits.timeout_ms, limits.memory_mb
            )),
        }
    }
}

/// Markdown first, then the structured result as JSON.
fn respond<T: Serialize + ?Sized>(
    markdown: String,
    structured: &T,
    is_error: bool,
) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(structured)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))?;
    let content = vec![Content::text(markdown), Content::text(json)];
    if is_error {
        Ok(CallToolResult::error(content))
    } else {
        Ok(CallToolResult::success(content))
    }
}

/// Rejections become invalid-params errors; host faults become internal errors.
fn to_mcp_error(err: EngineError) -> McpError {
    if err.is_security_rejection() || matches!(err, EngineError::NotFound { .. }) {
        info!(error = %err, "Rejected request");
        McpError::invalid_params(err.to_string(), None)
    } else {
        error!(error = %err, "Request failed");
        McpError::internal_error(err.to_string(), None)
    }
}

/// Serve the engine over stdio.
pub async fn serve_stdio(engine: Arc<Engine>) -> anyhow::Result<()> {
    let server = SandboxServer::new(engine);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{config, outcome, RecordingLauncher};
    use crate::sandbox::ExitKind;

    fn server(launcher: Arc<RecordingLauncher>) -> (tempfile::TempDir, SandboxServer) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::with_launcher(config(dir.path().join("ws")), launcher).unwrap();
        (dir, SandboxServer::new(Arc::new(engine)))
    }

    fn text(result: &CallToolResult, index: usize) -> String {
        result.content[index]
            .as_text()
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn compile_and_run_success() {
        let launcher = Arc::new(
            RecordingLauncher::default()
                .then(outcome(ExitKind::Normal, Some(0), "", ""))
                .then(outcome(ExitKind::Normal, Some(0), "8\n", "")),
        );
        let (_dir, server) = server(launcher);
        let params = Parameters(CompileAndRunParams {
            code: "int main(){}".into(),
            input: "3 5\n".into(),
            expected_output: Some("8".into()),
            ..CompileAndRunParams::default()
        });

        let result = server.compile_and_run(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert!(text(&result, 0).contains("Comparison: MATCH"));
        let json: serde_json::Value = serde_json::from_str(&text(&result, 1)).unwrap();
        assert_eq!(json["result"]["status"], "normal");
        assert_eq!(json["comparison"]["verdict"], "match");
    }

    #[tokio::test]
    async fn compile_error_is_a_tool_error_not_a_protocol_error() {
        let launcher = Arc::new(RecordingLauncher::failing("error: expected ';'"));
        let (_dir, server) = server(launcher.clone());
        let params = Parameters(CompileAndRunParams {
            code: "int main(){ return 0 }".into(),
            ..CompileAndRunParams::default()
        });

        let result = server.compile_and_run(params).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
        assert!(text(&result, 0).contains("expected ';'"));
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn traversal_filename_is_invalid_params() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (_dir, server) = server(launcher.clone());
        let params = Parameters(CompileAndRunParams {
            code: "int main(){}".into(),
            filename: Some("../../evil.cpp".into()),
            ..CompileAndRunParams::default()
        });

        assert!(server.compile_and_run(params).await.is_err());
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn forbidden_gdb_script_is_rejected() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (_dir, server) = server(launcher.clone());
        let params = Parameters(DebugParams {
            code: "int main(){}".into(),
            gdb_script: Some("shell cat /etc/shadow".into()),
            ..DebugParams::default()
        });

        assert!(server.debug_with_gdb(params).await.is_err());
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn compare_outputs_defaults_ignore_whitespace() {
        let (_dir, server) = server(Arc::new(RecordingLauncher::default()));
        let params: CompareParams =
            serde_json::from_str(r#"{"actual": "3  5\n", "expected": "3 5"}"#).unwrap();

        let result = server.compare_outputs(Parameters(params)).await.unwrap();
        assert!(text(&result, 0).contains("Comparison: MATCH"));
    }

    #[tokio::test]
    async fn test_case_tools() {
        let (_dir, server) = server(Arc::new(RecordingLauncher::default()));

        let listed = server.list_test_cases().await.unwrap();
        assert!(text(&listed, 0).contains("fibonacci"));

        let read = server
            .read_test_case(Parameters(TestCaseParams {
                test_case_id: "a+b".into(),
            }))
            .await
            .unwrap();
        assert!(text(&read, 0).contains("3 5"));

        let missing = server
            .read_test_case(Parameters(TestCaseParams {
                test_case_id: "nope".into(),
            }))
            .await;
        assert!(missing.is_err());
    }
}
