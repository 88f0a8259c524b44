//! Line-oriented output comparison.

use serde::{Deserialize, Serialize};

/// Longest excerpt of either side kept in a [`ComparisonResult`].
pub const MAX_EXCERPT_CHARS: usize = 256;

/// Most differing lines listed individually.
pub const MAX_LISTED_DIFFERENCES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonOptions {
    pub ignore_whitespace: bool,
    pub ignore_case: bool,
}

impl ComparisonOptions {
    pub const STRICT: Self = Self {
        ignore_whitespace: false,
        ignore_case: false,
    };
}

impl Default for ComparisonOptions {
    /// Judges usually tolerate whitespace but not case.
    fn default() -> Self {
        Self {
            ignore_whitespace: true,
            ignore_case: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
    /// The actual output is incomplete and was not compared.
    Error,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Mismatch => "mismatch",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One differing line. `None` means the side ran out of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineDifference {
    /// 1-based line number.
    pub line: usize,
    pub actual: Option<String>,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub verdict: Verdict,
    pub first_difference: Option<LineDifference>,
    /// At most [`MAX_LISTED_DIFFERENCES`] entries.
    pub differences: Vec<LineDifference>,
    pub total_differences: usize,
    pub actual_line_count: usize,
    pub expected_line_count: usize,
    pub actual_excerpt: String,
    pub expected_excerpt: String,
    /// Set when the verdict is [`Verdict::Error`].
    pub reason: Option<String>,
}

impl ComparisonResult {
    pub fn is_match(&self) -> bool {
        self.verdict == Verdict::Match
    }

    /// Verdict for output that cannot be judged.
    pub fn error(actual: &str, expected: &str, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Error,
            first_difference: None,
            differences: Vec::new(),
            total_differences: 0,
            actual_line_count: actual.lines().count(),
            expected_line_count: expected.lines().count(),
            actual_excerpt: excerpt(actual),
            expected_excerpt: excerpt(expected),
            reason: Some(reason.into()),
        }
    }
}

/// Compare `actual` against `expected`.
pub fn compare(actual: &str, expected: &str, options: ComparisonOptions) -> ComparisonResult {
    let actual_lines = normalize(actual, options);
    let expected_lines = normalize(expected, options);

    let mut differences = Vec::new();
    let mut total = 0;
    for index in 0..actual_lines.len().max(expected_lines.len()) {
        let a = actual_lines.get(index);
        let e = expected_lines.get(index);
        if a == e {
            continue;
        }
        total += 1;
        if differences.len() < MAX_LISTED_DIFFERENCES {
            // Report the caller's text, not the folded form.
            differences.push(LineDifference {
                line: index + 1,
                actual: a.map(|_| excerpt(raw_line(actual, index, options))),
                expected: e.map(|_| excerpt(raw_line(expected, index, options))),
            });
        }
    }

    ComparisonResult {
        verdict: if total == 0 {
            Verdict::Match
        } else {
            Verdict::Mismatch
        },
        first_difference: differences.first().cloned(),
        differences,
        total_differences: total,
        actual_line_count: actual_lines.len(),
        expected_line_count: expected_lines.len(),
        actual_excerpt: excerpt(actual),
        expected_excerpt: excerpt(expected),
        reason: None,
    }
}

fn normalize(text: &str, options: ComparisonOptions) -> Vec<String> {
    let mut lines: Vec<String> = split_lines(text, options)
        .into_iter()
        .map(|line| {
            let line = if options.ignore_whitespace {
                line.split_whitespace().collect::<Vec<_>>().join(" ")
            } else {
                line.to_string()
            };
            if options.ignore_case {
                line.to_lowercase()
            } else {
                line
            }
        })
        .collect();

    if options.ignore_whitespace {
        while lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
    }
    lines
}

/// Lines of `text`. A final line terminator does not start a new line.
///
/// Without whitespace folding lines split on `\n` alone, so a `\r` stays
/// significant.
fn split_lines(text: &str, options: ComparisonOptions) -> Vec<&str> {
    if options.ignore_whitespace {
        return text.lines().collect();
    }
    if text.is_empty() {
        return Vec::new();
    }
    text.strip_suffix('\n').unwrap_or(text).split('\n').collect()
}

fn raw_line(text: &str, index: usize, options: ComparisonOptions) -> &str {
    split_lines(text, options).get(index).copied().unwrap_or_default()
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(MAX_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
