use std::collections::{BTreeMap, HashSet};
use std::io;

use skein_patch::{ChangeKind, PatchError, PatchFileOps};

/// In-memory ops that records opens, writes and deletes, and can be told to
/// fail specific paths to exercise the apply-phase error paths.
#[derive(Default)]
pub struct RecordingOps {
    pub files: BTreeMap<String, String>,
    pub writes: BTreeMap<String, String>,
    pub deletes: Vec<String>,
    pub opened: Vec<String>,
    pub fail_writes: HashSet<String>,
    pub fail_deletes: HashSet<String>,
    changes: BTreeMap<String, ChangeKind>,
}

impl RecordingOps {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::default()
        }
    }
}

impl PatchFileOps for RecordingOps {
    fn open(&mut self, rel: &str) -> io::Result<String> {
        self.opened.push(rel.to_string());
        self.files
            .get(rel)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {rel}")))
    }

    fn write(&mut self, rel: &str, content: &str) -> io::Result<()> {
        if self.fail_writes.contains(rel) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        let existed = self.files.contains_key(rel);
        self.writes.insert(rel.to_string(), content.to_string());
        self.files.insert(rel.to_string(), content.to_string());
        self.changes.insert(
            rel.to_string(),
            if existed {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            },
        );
        Ok(())
    }

    fn delete(&mut self, rel: &str) -> io::Result<()> {
        if self.fail_deletes.contains(rel) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            ));
        }
        self.files.remove(rel);
        self.deletes.push(rel.to_string());
        self.changes.insert(rel.to_string(), ChangeKind::Deleted);
        Ok(())
    }

    fn changes_map(&self) -> &BTreeMap<String, ChangeKind> {
        &self.changes
    }
}

pub fn has_error(errors: &[PatchError], needle: &str) -> bool {
    errors.iter().any(|e| e.msg.contains(needle))
}
