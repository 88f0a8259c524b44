//! Executable allow-list and argument deny-list.
//!
//! The allow-list is the primary control: only the compiler and debugger
//! resolved at startup, or an artifact confined under a workspace, may be
//! spawned, and arguments always travel as a discrete vector with no shell
//! in between. The deny-list is a second layer over anything caller-shaped.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::path_guard;
use crate::error::{EngineError, Result};

/// Destructive shell fragments, matched case-insensitively as substrings.
pub const DEFAULT_FORBIDDEN_SUBSTRINGS: &[&str] = &[
    "rm -rf",
    "rm -r ",
    "rmdir /s",
    "del /f",
    "del /s",
    "rd /s",
    "format c:",
    "mkfs",
    "dd if=",
    "shutdown",
    "reboot",
    "poweroff",
    "halt -",
    "init 0",
    "kill -9",
    "killall",
    "pkill",
    "taskkill",
    "sudo ",
    "chmod 777",
    ":(){",
];

/// Shell-escape and redirection shapes, matched case-insensitively.
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    r"&&\s*rm",
    r";\s*rm",
    r"\|\s*rm",
    r"`.*`",
    r"\$\(.*\)",
    r">\s*/dev/",
    r">>\s*/dev/",
    r"\bsystem\s*\(",
    r"\bpopen\s*\(",
    r"\bexec[lv]p?e?\s*\(",
    r"\$_shell\s*\(",
];

/// Debugger commands that reach the host: shells, interpreters, file
/// writes, process attachment and remote targets. `with` and `eval` are
/// here because they run another command the line screen never sees.
pub const DEFAULT_FORBIDDEN_DEBUGGER_COMMANDS: &[&str] = &[
    "!",
    "|",
    "shell",
    "pipe",
    "python",
    "python-interactive",
    "pi",
    "py",
    "guile",
    "gu",
    "source",
    "make",
    "cd",
    "dump",
    "append",
    "restore",
    "save",
    "attach",
    "detach",
    "target",
    "file",
    "exec-file",
    "core-file",
    "generate-core-file",
    "gcore",
    "add-symbol-file",
    "symbol-file",
    "define",
    "document",
    "alias",
    "compile",
    "call",
    "set",
    "tty",
    "with",
    "w",
    "eval",
    "interpreter-exec",
];

/// Debugger `set` sub-commands that stay harmless.
const ALLOWED_DEBUGGER_SETTINGS: &[&str] = &[
    "pagination",
    "confirm",
    "print",
    "listsize",
    "width",
    "height",
    "var",
    "variable",
    "disassembly-flavor",
    "language",
    "breakpoint",
];

/// Explicit, reviewable deny-list data.
#[derive(Debug, Clone)]
pub struct DenyList {
    substrings: Vec<String>,
    patterns: Vec<Regex>,
    debugger_commands: Vec<String>,
}

impl Default for DenyList {
    fn default() -> Self {
        Self::new(
            DEFAULT_FORBIDDEN_SUBSTRINGS.iter().copied(),
            DEFAULT_FORBIDDEN_PATTERNS.iter().copied(),
            DEFAULT_FORBIDDEN_DEBUGGER_COMMANDS.iter().copied(),
        )
        .unwrap_or_else(|_| Self::empty())
    }
}

impl DenyList {
    pub fn new<'a>(
        substrings: impl IntoIterator<Item = &'a str>,
        patterns: impl IntoIterator<Item = &'a str>,
        debugger_commands: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| EngineError::Config(format!("bad deny pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            substrings: substrings.into_iter().map(str::to_lowercase).collect(),
            patterns,
            debugger_commands: debugger_commands
                .into_iter()
                .map(str::to_lowercase)
                .collect(),
        })
    }

    const fn empty() -> Self {
        Self {
            substrings: Vec::new(),
            patterns: Vec::new(),
            debugger_commands: Vec::new(),
        }
    }

    /// Return the first deny-list entry matching `text`.
    pub fn first_match(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        if let Some(hit) = self.substrings.iter().find(|s| lowered.contains(s.as_str())) {
            return Some(hit.clone());
        }
        self.patterns
            .iter()
            .find(|p| p.is_match(text))
            .map(|p| p.as_str().to_string())
    }

    /// Return the first debugger script line that invokes a forbidden command.
    pub fn first_forbidden_debugger_line<'s>(&self, script: &'s str) -> Option<&'s str> {
        script.lines().find(|line| {
            let trimmed = line.trim_start();
            // `!cmd` and `|cmd` need no separating space.
            if trimmed.starts_with('!') || trimmed.starts_with('|') {
                return self.debugger_commands.iter().any(|c| c == "!" || c == "|");
            }
            let mut words = trimmed.split_whitespace();
            let Some(first) = words.next() else {
                return false;
            };
            let first = first.to_lowercase();
            let Some(command) = self.resolve_debugger_command(&first) else {
                return false;
            };
            if command == "set" {
                let setting = words.next().unwrap_or_default().to_lowercase();
                return !ALLOWED_DEBUGGER_SETTINGS.contains(&setting.as_str());
            }
            true
        })
    }

    /// Map `word` to the forbidden command it names, if any.
    ///
    /// The debugger accepts unambiguous prefixes, so `she` runs `shell`.
    fn resolve_debugger_command(&self, word: &str) -> Option<&str> {
        if let Some(exact) = self.debugger_commands.iter().find(|c| *c == word) {
            return Some(exact);
        }
        if word.len() < MIN_ABBREVIATION || DEBUGGER_ALIASES.contains(&word) {
            return None;
        }
        self.debugger_commands
            .iter()
            .find(|c| c.len() > word.len() && c.starts_with(word))
            .map(String::as_str)
    }
}

/// Shortest prefix the debugger expands to a full command name.
const MIN_ABBREVIATION: usize = 2;

/// Short words that are aliases of harmless commands rather than prefixes.
const DEBUGGER_ALIASES: &[&str] = &["do", "dow", "down", "fin", "fo", "frame", "tb"];

/// Screens executables and argument vectors before anything is spawned.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed: Vec<PathBuf>,
    deny: DenyList,
}

impl CommandGuard {
    /// `allowed` holds the canonical compiler and debugger paths.
    pub const fn new(allowed: Vec<PathBuf>, deny: DenyList) -> Self {
        Self { allowed, deny }
    }

    pub const fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    /// Authorize `executable` with `argv` for a request owning `workspace_root`.
    ///
    /// The executable must be an allow-listed tool or a file confined under
    /// the workspace. Every argument is then screened against the deny-list.
    pub fn authorize<S: AsRef<OsStr>>(
        &self,
        executable: &Path,
        argv: &[S],
        workspace_root: &Path,
    ) -> Result<()> {
        let is_tool = self.allowed.iter().any(|a| a == executable);
        if !is_tool && path_guard::confine(executable, workspace_root).is_err() {
            warn!(executable = %executable.display(), "Rejected executable outside allow-list");
            return Err(EngineError::forbidden(format!(
                "executable not allowed: {}",
                executable.display()
            )));
        }

        for arg in argv {
            let arg = arg.as_ref().to_string_lossy();
            if let Some(hit) = self.deny.first_match(&arg) {
                warn!(pattern = %hit, "Rejected argument matching deny-list");
                return Err(EngineError::forbidden(format!(
                    "argument matches deny-list entry {hit:?}"
                )));
            }
        }

        Ok(())
    }

    /// Screen caller-supplied debugger script content.
    pub fn authorize_script(&self, script: &str) -> Result<()> {
        if let Some(line) = self.deny.first_forbidden_debugger_line(script) {
            warn!(line = %line.trim(), "Rejected debugger command");
            return Err(EngineError::forbidden(format!(
                "debugger command not allowed: {}",
                line.trim()
            )));
        }
        if let Some(hit) = self.deny.first_match(script) {
            warn!(pattern = %hit, "Rejected debugger script matching deny-list");
            return Err(EngineError::forbidden(format!(
                "debugger script matches deny-list entry {hit:?}"
            )));
        }
        Ok(())
    }
}
