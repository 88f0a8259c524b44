//! Read-only registry of named input/expected-output pairs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::sandbox::sanitize_filename;

/// Largest test-case file loaded from disk.
const MAX_CASE_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub id: String,
    pub description: String,
    pub input: String,
    pub expected_output: String,
}

/// Test cases loaded at startup. Never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct TestCaseRegistry {
    cases: BTreeMap<String, TestCase>,
}

impl TestCaseRegistry {
    /// Registry holding only the built-in cases.
    pub fn builtin() -> Self {
        let cases = [
            TestCase {
                id: "a+b".into(),
                description: "Read two integers and print their sum.".into(),
                input: "3 5\n".into(),
                expected_output: "8\n".into(),
            },
            TestCase {
                id: "fibonacci".into(),
                description: "Read n and print the n-th Fibonacci number (F(1) = F(2) = 1).".into(),
                input: "10\n".into(),
                expected_output: "55\n".into(),
            },
        ];
        Self {
            cases: cases.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    /// Built-in cases plus `<id>.in` / `<id>.out` pairs found in `dir`.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut registry = Self::builtin();
        if let Some(dir) = dir {
            let found = Self::scan_dir(dir);
            info!(path = %dir.display(), count = found.len(), "Loaded test cases");
            registry.cases.extend(found);
        }
        registry
    }

    /// Scan `dir` for test-case pairs. Unreadable or unpaired entries are skipped.
    pub fn scan_dir(dir: &Path) -> BTreeMap<String, TestCase> {
        let mut cases = BTreeMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot read test case directory");
                return cases;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Error reading test case directory entry");
                    continue;
                }
            };

            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("in") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match sanitize_filename(stem) {
                Ok(safe) if safe.as_str() == stem => {}
                _ => {
                    warn!(path = %path.display(), "Skipping test case: unsafe identifier");
                    continue;
                }
            }

            let out_path = path.with_extension("out");
            let (input, expected_output) = match (read_case_file(&path), read_case_file(&out_path)) {
                (Ok(input), Ok(output)) => (input, output),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping test case");
                    continue;
                }
            };

            debug!(id = stem, "Found test case");
            cases.insert(
                stem.to_string(),
                TestCase {
                    id: stem.to_string(),
                    description: format!("Loaded from {}", path.display()),
                    input,
                    expected_output,
                },
            );
        }

        cases
    }

    /// Look up a test case.
    ///
    /// Identifiers carrying path separators or null bytes are rejected.
    pub fn get(&self, id: &str) -> Result<&TestCase> {
        let safe = sanitize_filename(id)?;
        self.cases
            .get(id)
            .or_else(|| self.cases.get(safe.as_str()))
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    pub fn list(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

fn read_case_file(path: &Path) -> std::io::Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_CASE_FILE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{size} bytes exceeds the {MAX_CASE_FILE_BYTES} byte limit"),
        ));
    }
    std::fs::read_to_string(path)
}
