//! Markdown rendering of engine results for tool callers.

use std::fmt::Write;

use super::comparator::{ComparisonResult, Verdict};
use super::testcase::TestCase;
use super::{ExecutionReport, Mode};
use crate::sandbox::{ExecutionResult, ExitKind};

/// Render a full request report.
pub fn execution(report: &ExecutionReport) -> String {
    let mut out = String::new();
    let title = match report.mode {
        Mode::CompileRun => "Execution",
        Mode::Debug => "Debug session",
    };
    let _ = writeln!(out, "## {title}: {}\n", headline(&report.result));
    let _ = writeln!(out, "- Request: `{}`", report.request_id);
    if let Some(id) = &report.test_case {
        let _ = writeln!(out, "- Test case: `{id}`");
    }
    let _ = writeln!(
        out,
        "- Limits: {} ms, {} MB, {} bytes of output",
        report.limits.timeout_ms, report.limits.memory_mb, report.limits.max_output_bytes
    );

    if report.result.status == ExitKind::CompileError {
        out.push_str("\n### Compiler diagnostics\n");
        fenced(&mut out, &report.compile.diagnostics);
    } else {
        result_details(&mut out, &report.result);
        if !report.compile.diagnostics.trim().is_empty() {
            out.push_str("\n### Compiler warnings\n");
            fenced(&mut out, &report.compile.diagnostics);
        }
    }

    if let Some(comparison) = &report.comparison {
        out.push('\n');
        out.push_str(&comparison_section(comparison));
    }
    out
}

/// Render a standalone comparison.
pub fn comparison(result: &ComparisonResult) -> String {
    comparison_section(result)
}

/// Render one test case.
pub fn test_case(case: &TestCase) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Test case `{}`\n", case.id);
    let _ = writeln!(out, "{}\n", case.description);
    out.push_str("### Input\n");
    fenced(&mut out, &case.input);
    out.push_str("\n### Expected output\n");
    fenced(&mut out, &case.expected_output);
    out
}

/// Render the registry index.
pub fn test_case_list<'a>(cases: impl IntoIterator<Item = &'a TestCase>) -> String {
    let mut out = String::from("## Test cases\n\n");
    let mut empty = true;
    for case in cases {
        empty = false;
        let _ = writeln!(out, "- `{}`: {}", case.id, case.description);
    }
    if empty {
        out.push_str("No test cases are registered.\n");
    }
    out
}

fn headline(result: &ExecutionResult) -> String {
    match (result.status, result.exit_code, result.signal) {
        (ExitKind::Normal, Some(code), _) => format!("exited with code {code}"),
        (ExitKind::Signaled, _, Some(sig)) => format!("terminated by signal {sig}"),
        (status, _, _) => status.to_string(),
    }
}

fn result_details(out: &mut String, result: &ExecutionResult) {
    let _ = writeln!(out, "- Elapsed: {} ms", result.elapsed_ms);
    if let Some(kb) = result.peak_memory_kb {
        let _ = writeln!(out, "- Peak memory: {kb} KB");
    }

    out.push_str("\n### stdout\n");
    fenced(out, &result.stdout);
    if result.stdout_truncated {
        out.push_str("_stdout truncated at the output limit_\n");
    }
    if !result.stderr.is_empty() {
        out.push_str("\n### stderr\n");
        fenced(out, &result.stderr);
        if result.stderr_truncated {
            out.push_str("_stderr truncated at the output limit_\n");
        }
    }
}

fn comparison_section(result: &ComparisonResult) -> String {
    let mut out = String::new();
    let mark = match result.verdict {
        Verdict::Match => "MATCH",
        Verdict::Mismatch => "MISMATCH",
        Verdict::Error => "NOT COMPARED",
    };
    let _ = writeln!(out, "### Comparison: {mark}\n");
    if let Some(reason) = &result.reason {
        let _ = writeln!(out, "{reason}\n");
    }
    let _ = writeln!(
        out,
        "- Lines: {} actual, {} expected",
        result.actual_line_count, result.expected_line_count
    );

    if result.verdict == Verdict::Mismatch {
        let _ = writeln!(out, "- Differing lines: {}\n", result.total_differences);
        out.push_str("| Line | Actual | Expected |\n|---|---|---|\n");
        for diff in &result.differences {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                diff.line,
                cell(diff.actual.as_deref()),
                cell(diff.expected.as_deref())
            );
        }
        if result.total_differences > result.differences.len() {
            let _ = writeln!(
                out,
                "\n_{} more differing lines not shown_",
                result.total_differences - result.differences.len()
            );
        }
    }
    out
}

fn cell(text: Option<&str>) -> String {
    text.map_or_else(
        || "_(missing)_".to_string(),
        |t| format!("`{}`", t.replace('|', "\\|").replace('`', "'")),
    )
}

fn fenced(out: &mut String, text: &str) {
    if text.is_empty() {
        out.push_str("_(empty)_\n");
        return;
    }
    // Longer fence than any backtick run inside the text.
    let longest = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest.max(2) + 1);
    let _ = writeln!(out, "{fence}\n{}\n{fence}", text.trim_end_matches('\n'));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::comparator::{compare, ComparisonOptions};
    use crate::engine::CompileSummary;
    use crate::sandbox::ExecutionLimits;

    fn report(status: ExitKind, stdout: &str) -> ExecutionReport {
        ExecutionReport {
            request_id: "abc".into(),
            mode: Mode::CompileRun,
            test_case: Some("a+b".into()),
            limits: ExecutionLimits::default(),
            compile: CompileSummary::default(),
            result: ExecutionResult {
                status,
                exit_code: (status == ExitKind::Normal).then_some(0),
                signal: None,
                stdout: stdout.into(),
                stderr: String::new(),
                stdout_truncated: status == ExitKind::OutputTruncated,
                stderr_truncated: false,
                elapsed_ms: 12,
                peak_memory_kb: Some(2048),
            },
            comparison: Some(compare(stdout, "8\n", ComparisonOptions::default())),
        }
    }

    #[test]
    fn renders_successful_run() {
        let text = execution(&report(ExitKind::Normal, "8\n"));
        assert!(text.contains("exited with code 0"));
        assert!(text.contains("Test case: `a+b`"));
        assert!(text.contains("```\n8\n```"));
        assert!(text.contains("Comparison: MATCH"));
        assert!(text.contains("Peak memory: 2048 KB"));
    }

    #[test]
    fn renders_mismatch_table() {
        let text = execution(&report(ExitKind::Normal, "9\n"));
        assert!(text.contains("MISMATCH"));
        assert!(text.contains("| 1 | `9` | `8` |"));
    }

    #[test]
    fn renders_truncation_note() {
        let text = execution(&report(ExitKind::OutputTruncated, "yyyy"));
        assert!(text.contains("output-truncated"));
        assert!(text.contains("stdout truncated"));
    }

    #[test]
    fn renders_compile_diagnostics() {
        let mut r = report(ExitKind::CompileError, "");
        r.compile.diagnostics = "main.cpp:1:1: error: boom".into();
        r.comparison = None;
        let text = execution(&r);
        assert!(text.contains("compile-error"));
        assert!(text.contains("Compiler diagnostics"));
        assert!(text.contains("error: boom"));
    }

    #[test]
    fn fence_outgrows_backticks_in_text() {
        let mut out = String::new();
        fenced(&mut out, "a ```` b");
        assert!(out.starts_with("`````\n"));
    }

    #[test]
    fn renders_test_case_list() {
        let registry = crate::engine::testcase::TestCaseRegistry::builtin();
        let text = test_case_list(registry.list());
        assert!(text.contains("- `a+b`"));
        assert!(text.contains("- `fibonacci`"));
        assert!(test_case_list(std::iter::empty()).contains("No test cases"));
    }
}
