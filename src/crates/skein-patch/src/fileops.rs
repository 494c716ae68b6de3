//! File operation backends used by the patch processors.
//!
//! Processors never touch the filesystem directly; they go through
//! [`PatchFileOps`] so tests can run fully in memory and so every resolved
//! path is checked against the project root in one place.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Kind of change recorded in the [`PatchFileOps::changes_map`] accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Contract for file operations used by patch processors.
///
/// Implementations must enforce path safety and keep `changes_map` current.
pub trait PatchFileOps {
    fn open(&mut self, rel: &str) -> io::Result<String>;
    fn write(&mut self, rel: &str, content: &str) -> io::Result<()>;
    fn delete(&mut self, rel: &str) -> io::Result<()>;

    /// Relative path -> change kind for everything touched so far.
    fn changes_map(&self) -> &BTreeMap<String, ChangeKind>;
}

/// Filesystem-backed implementation rooted at `base_path`.
///
/// Absolute paths and paths that escape the base directory are rejected.
pub struct FsPatchFileOps {
    base_path: PathBuf,
    changes: BTreeMap<String, ChangeKind>,
}

impl FsPatchFileOps {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            changes: BTreeMap::new(),
        }
    }

    fn resolve_safe(&self, rel: &str) -> io::Result<PathBuf> {
        if rel.starts_with('/') || rel.starts_with('~') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Absolute paths are not allowed: {rel}"),
            ));
        }
        // Lexical normalization: the target may not exist yet, so canonicalize
        // is not an option. Walk the components and refuse to climb above base.
        let mut normalized = PathBuf::new();
        for comp in Path::new(rel).components() {
            match comp {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("Path escapes project root: {rel}"),
                        ));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Absolute paths are not allowed: {rel}"),
                    ));
                }
            }
        }
        Ok(self.base_path.join(normalized))
    }

    fn record(&mut self, rel: &str, change: ChangeKind) {
        match self.changes.get(rel) {
            None => {
                self.changes.insert(rel.to_string(), change);
            }
            Some(ChangeKind::Deleted) if change != ChangeKind::Deleted => {}
            Some(ChangeKind::Created) if change == ChangeKind::Updated => {}
            Some(_) => {
                self.changes.insert(rel.to_string(), change);
            }
        }
    }
}

impl PatchFileOps for FsPatchFileOps {
    fn open(&mut self, rel: &str) -> io::Result<String> {
        let path = self.resolve_safe(rel)?;
        fs::read_to_string(path)
    }

    fn write(&mut self, rel: &str, content: &str) -> io::Result<()> {
        let path = self.resolve_safe(rel)?;
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        self.record(
            rel,
            if existed {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            },
        );
        Ok(())
    }

    fn delete(&mut self, rel: &str) -> io::Result<()> {
        let path = self.resolve_safe(rel)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.record(rel, ChangeKind::Deleted);
        Ok(())
    }

    fn changes_map(&self) -> &BTreeMap<String, ChangeKind> {
        &self.changes
    }
}

/// In-memory implementation used by tests and dry runs.
#[derive(Default)]
pub struct MemoryPatchFileOps {
    pub files: BTreeMap<String, String>,
    changes: BTreeMap<String, ChangeKind>,
}

impl MemoryPatchFileOps {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self {
            files,
            changes: BTreeMap::new(),
        }
    }
}

impl PatchFileOps for MemoryPatchFileOps {
    fn open(&mut self, rel: &str) -> io::Result<String> {
        self.files
            .get(rel)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {rel}")))
    }

    fn write(&mut self, rel: &str, content: &str) -> io::Result<()> {
        let existed = self.files.contains_key(rel);
        self.files.insert(rel.to_string(), content.to_string());
        let kind = if existed {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        if self.changes.get(rel) != Some(&ChangeKind::Deleted) || kind == ChangeKind::Created {
            self.changes.insert(rel.to_string(), kind);
        }
        Ok(())
    }

    fn delete(&mut self, rel: &str) -> io::Result<()> {
        self.files.remove(rel);
        self.changes.insert(rel.to_string(), ChangeKind::Deleted);
        Ok(())
    }

    fn changes_map(&self) -> &BTreeMap<String, ChangeKind> {
        &self.changes
    }
}
