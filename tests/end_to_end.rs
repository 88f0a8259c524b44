//! End-to-end tests against a real C++ toolchain.
//!
//! Each test returns early when `g++` is not installed.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;

use oi_sandbox::config::{resolve_executable, Config, EngineConfig};
use oi_sandbox::engine::comparator::Verdict;
use oi_sandbox::engine::{Engine, ExecutionRequest, Mode};
use oi_sandbox::sandbox::{ExitKind, RequestedLimits, MIN_MEMORY_MB};

const SUM: &str = r#"
#include <iostream>
int main() {
    long long a, b;
    std::cin >> a >> b;
    std::cout << a + b << std::endl;
}
"#;

const FIBONACCI: &str = r#"
#include <iostream>
int main() {
    int n;
    std::cin >> n;
    long long a = 0, b = 1;
    for (int i = 0; i < n; ++i) {
        long long t = a + b;
        a = b;
        b = t;
    }
    std::cout << a << "\n";
}
"#;

const SYNTAX_ERROR: &str = "int main() { return 0 }\n";

const MEMORY_HOG: &str = r#"
#include <cstring>
#include <vector>
int main() {
    std::vector<char*> blocks;
    for (;;) {
        char* block = new char[1 << 20];
        std::memset(block, 1, 1 << 20);
        blocks.push_back(block);
    }
}
"#;

const SPIN: &str = "int main() { volatile unsigned x = 0; for (;;) ++x; }\n";

fn engine() -> Option<(tempfile::TempDir, Arc<Engine>)> {
    if resolve_executable(Path::new("g++")).is_err() {
        eprintln!("g++ not found, skipping");
        return None;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.paths.workspace_root = dir.path().join("ws");
    let config = EngineConfig::resolve(config).unwrap();
    Some((dir, Arc::new(Engine::new(config).unwrap())))
}

fn leftover_workspaces(engine: &Engine) -> usize {
    std::fs::read_dir(engine.workspaces().root()).unwrap().count()
}

#[tokio::test]
async fn sum_of_two_integers() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: SUM.into(),
            stdin: "3 5".into(),
            expected_output: Some("8".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(report.result.status, ExitKind::Normal);
    assert_eq!(report.result.exit_code, Some(0));
    assert_eq!(report.result.stdout.trim(), "8");
    assert_eq!(report.comparison.unwrap().verdict, Verdict::Match);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[tokio::test]
async fn tenth_fibonacci_term() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: FIBONACCI.into(),
            stdin: "10".into(),
            expected_output: Some("55".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(report.result.status, ExitKind::Normal);
    assert_eq!(report.result.stdout.trim(), "55");
    assert!(report.comparison.unwrap().is_match());
}

#[tokio::test]
async fn registered_test_case() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: FIBONACCI.into(),
            test_case: Some("fibonacci".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert!(report.comparison.unwrap().is_match());
}

#[tokio::test]
async fn syntax_error_reports_diagnostics() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: SYNTAX_ERROR.into(),
            expected_output: Some("0".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(report.result.status, ExitKind::CompileError);
    assert!(!report.compile.diagnostics.trim().is_empty());
    assert!(report.compile.diagnostics.contains("error"));
    // Nothing ran, so there is no program output to judge.
    assert!(report.result.stdout.is_empty());
    assert_eq!(report.comparison.unwrap().verdict, Verdict::Error);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[tokio::test]
async fn unbounded_allocation_is_stopped() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: MEMORY_HOG.into(),
            limits: RequestedLimits {
                timeout_ms: Some(10_000),
                memory_mb: Some(64),
                max_output_bytes: None,
            },
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(report.result.status, ExitKind::MemoryExceeded);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[tokio::test]
async fn tiny_memory_request_still_loads_the_runtime() {
    let Some((_dir, engine)) = engine() else { return };

    for memory_mb in [1, 2] {
        let report = engine
            .execute(ExecutionRequest {
                source: SUM.into(),
                stdin: "3 5".into(),
                limits: RequestedLimits {
                    memory_mb: Some(memory_mb),
                    ..RequestedLimits::default()
                },
                ..ExecutionRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(report.limits.memory_mb, MIN_MEMORY_MB);
        assert_eq!(report.result.exit_code, Some(0), "stderr: {}", report.result.stderr);
        assert_eq!(report.result.stdout.trim(), "8");
    }
}

#[tokio::test]
async fn infinite_loop_times_out() {
    let Some((_dir, engine)) = engine() else { return };

    let report = engine
        .execute(ExecutionRequest {
            source: SPIN.into(),
            limits: RequestedLimits {
                timeout_ms: Some(500),
                ..RequestedLimits::default()
            },
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(report.result.status, ExitKind::Timeout);
    assert!(report.result.elapsed_ms < 500 + 5_000);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[tokio::test]
async fn rejected_filename_leaves_nothing_behind() {
    let Some((_dir, engine)) = engine() else { return };

    let err = engine
        .execute(ExecutionRequest {
            source: SUM.into(),
            filename: Some("../../outside.cpp".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap_err();

    assert!(err.is_security_rejection());
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[tokio::test]
async fn debugger_session_runs_script() {
    let Some((_dir, engine)) = engine() else { return };
    if !engine.debugger_available() {
        eprintln!("gdb not found, skipping");
        return;
    }

    let report = engine
        .execute(ExecutionRequest {
            source: SUM.into(),
            stdin: "1 2\n".into(),
            mode: Mode::Debug,
            debug_script: Some("break main\nrun\nbacktrace\nquit\n".into()),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();

    assert_ne!(report.result.status, ExitKind::CompileError);
    assert!(report.compile.invocation.iter().any(|a| a == "-g"));
    assert!(report.comparison.is_none());
    assert_eq!(leftover_workspaces(&engine), 0);
}
