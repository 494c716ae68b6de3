//! Shared value types for both patch formats.

use serde::{Deserialize, Serialize};

/// Per-file outcome of a patch application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileApplyStatus {
    /// File was created.
    Create,
    /// Every chunk for the file applied.
    Update,
    /// Some chunks applied, others failed to locate.
    PartialUpdate,
    /// File was deleted.
    Delete,
}

/// What a patch section asks to do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Update,
    Delete,
}

/// A structured error produced while parsing or applying a patch.
///
/// `line` is 1-based and points into the patch text for parse errors and
/// into the chunk header for application errors. `filename` is the target
/// file when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchError {
    pub msg: String,
    pub line: Option<usize>,
    pub hint: Option<String>,
    pub filename: Option<String>,
}

impl PatchError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            line: None,
            hint: None,
            filename: None,
        }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// A concrete change to one file, ready to be written.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub kind: ActionKind,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    pub move_path: Option<String>,
}

/// An ordered set of file changes produced from a parsed patch.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub changes: Vec<(String, FileChange)>,
}

pub(crate) fn join_lines(lines: &[String], eol: bool) -> String {
    let mut s = lines.join("\n");
    if eol {
        s.push('\n');
    }
    s
}
