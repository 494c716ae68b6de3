//! Patch engine for skein.
//!
//! Two deterministic textual diff formats are supported:
//!
//! - `v4a`: structural patches with `*** Begin Patch` envelopes, per-file
//!   Add/Update/Delete sections and `@@`-separated context chunks.
//! - `patch`: fenced SEARCH/REPLACE blocks with exact matching.
//!
//! [`apply_patch`] runs a patch through a [`PatchFileOps`] backend and
//! produces a per-file status map, structured errors and a human-readable
//! summary suitable for feeding back to a model.

mod fileops;
mod models;
mod search_replace;
mod v4a;

use std::collections::BTreeMap;
use std::path::Path;

pub use fileops::{ChangeKind, FsPatchFileOps, MemoryPatchFileOps, PatchFileOps};
pub use models::{ActionKind, FileApplyStatus, PatchError};
pub use search_replace::{process_search_replace_patch, SEARCH_REPLACE_SYSTEM_INSTRUCTION};
pub use v4a::{process_v4a_patch, V4A_SYSTEM_INSTRUCTION};

/// Supported patch format identifiers.
pub fn supported_formats() -> &'static [&'static str] {
    &["v4a", "patch"]
}

/// System instruction for the given format, for inclusion in LLM prompts.
pub fn system_instruction(fmt: &str) -> Option<&'static str> {
    match fmt.to_ascii_lowercase().as_str() {
        "v4a" => Some(V4A_SYSTEM_INSTRUCTION),
        "patch" => Some(SEARCH_REPLACE_SYSTEM_INSTRUCTION),
        _ => None,
    }
}

/// Outcome of [`apply_patch`].
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Human-readable summary of applied changes and errors.
    pub summary: String,
    /// `success` when no errors were recorded, `fail` otherwise.
    pub outcome: &'static str,
    /// Relative path -> change kind for everything actually written.
    pub changes: BTreeMap<String, ChangeKind>,
    /// Per-file application status keyed by the original path.
    pub statuses: BTreeMap<String, FileApplyStatus>,
    /// Structured parse/match/apply errors.
    pub errors: Vec<PatchError>,
}

/// Apply a patch in the given format against `base_path`.
pub fn apply_patch(fmt: &str, text: &str, base_path: &Path) -> Result<ApplyOutcome, String> {
    let mut ops = FsPatchFileOps::new(base_path);
    apply_patch_with_ops(fmt, text, &mut ops)
}

/// Apply a patch through a caller-provided file operations backend.
pub fn apply_patch_with_ops(
    fmt: &str,
    text: &str,
    ops: &mut dyn PatchFileOps,
) -> Result<ApplyOutcome, String> {
    let (statuses, errors) = match fmt.to_ascii_lowercase().as_str() {
        "v4a" => process_v4a_patch(text, ops),
        "patch" => process_search_replace_patch(text, ops),
        other => return Err(format!("Unsupported patch format: {other}")),
    };

    let changes = ops.changes_map().clone();
    let (summary, outcome) = summarize(&statuses, &errors, &changes);
    Ok(ApplyOutcome {
        summary,
        outcome,
        changes,
        statuses,
        errors,
    })
}

fn files_with_status(
    statuses: &BTreeMap<String, FileApplyStatus>,
    status: FileApplyStatus,
) -> Vec<String> {
    statuses
        .iter()
        .filter(|(_, s)| **s == status)
        .map(|(f, _)| f.clone())
        .collect()
}

fn push_file_list(lines: &mut Vec<String>, header: &str, files: &[String]) {
    if files.is_empty() {
        return;
    }
    lines.push(header.to_string());
    for f in files {
        lines.push(format!("* {f}"));
    }
}

fn summarize(
    statuses: &BTreeMap<String, FileApplyStatus>,
    errors: &[PatchError],
    changes: &BTreeMap<String, ChangeKind>,
) -> (String, &'static str) {
    let created = files_with_status(statuses, FileApplyStatus::Create);
    let updated_full = files_with_status(statuses, FileApplyStatus::Update);
    let updated_partial = files_with_status(statuses, FileApplyStatus::PartialUpdate);
    let deleted = files_with_status(statuses, FileApplyStatus::Delete);

    let mut lines: Vec<String> = Vec::new();

    if !errors.is_empty() {
        let applied: Vec<String> = changes.keys().cloned().collect();
        let applied_created: Vec<String> =
            created.iter().filter(|f| applied.contains(f)).cloned().collect();
        let applied_updated: Vec<String> = updated_full
            .iter()
            .filter(|f| applied.contains(f))
            .cloned()
            .collect();
        let applied_partial: Vec<String> = updated_partial
            .iter()
            .filter(|f| applied.contains(f))
            .cloned()
            .collect();
        let applied_deleted: Vec<String> =
            deleted.iter().filter(|f| applied.contains(f)).cloned().collect();
        let mut failed_files: Vec<String> = errors
            .iter()
            .filter_map(|e| e.filename.clone())
            .collect();
        failed_files.sort();
        failed_files.dedup();
        let not_applied_failed: Vec<String> = failed_files
            .iter()
            .filter(|f| !applied.contains(f))
            .cloned()
            .collect();

        if applied.is_empty() {
            lines.push("Patch application failed. No changes were applied.".to_string());
        } else {
            lines.push("Patch application completed with errors. Summary:".to_string());
            push_file_list(&mut lines, "Added files (fully applied):", &applied_created);
            push_file_list(&mut lines, "Fully updated files:", &applied_updated);
            push_file_list(
                &mut lines,
                "Partially updated files (some chunks failed):",
                &applied_partial,
            );
            push_file_list(&mut lines, "Deleted files (fully applied):", &applied_deleted);
        }

        let mut targets: Vec<String> = applied_partial;
        targets.extend(not_applied_failed);
        targets.sort();
        targets.dedup();
        if !targets.is_empty() {
            lines.push(
                "Please regenerate patch chunks for the failed parts in these files:".to_string(),
            );
            for f in &targets {
                lines.push(format!("* {f}"));
            }
            lines.push(
                "If there were other files that were not mentioned in this response, regenerate \
                 chunks for them as well. You might want to re-read the source files."
                    .to_string(),
            );
        }

        lines.push("Errors:".to_string());
        for e in errors {
            let loc = match (&e.filename, e.line) {
                (Some(f), Some(l)) => format!("{f}:{l}: "),
                (Some(f), None) => format!("{f}: "),
                _ => String::new(),
            };
            lines.push(format!("* {loc}{}", e.msg));
            if let Some(hint) = &e.hint {
                lines.push(format!("  Hint: {hint}"));
            }
        }
        (lines.join("\n"), "fail")
    } else {
        lines.push("Applied patch successfully.".to_string());
        push_file_list(&mut lines, "Added files:", &created);
        push_file_list(&mut lines, "Fully updated files:", &updated_full);
        push_file_list(&mut lines, "Partially updated files:", &updated_partial);
        push_file_list(&mut lines, "Deleted files:", &deleted);
        (lines.join("\n"), "success")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn unsupported_format_is_rejected() {
        let mut ops = MemoryPatchFileOps::default();
        let err = apply_patch_with_ops("unified", "", &mut ops).unwrap_err();
        assert!(err.contains("Unsupported patch format"));
    }

    #[test]
    fn summary_success_lists_files_by_kind() {
        let mut files = BTreeMap::new();
        files.insert("f.txt".to_string(), "pre\n old\npost\n".to_string());
        let mut ops = MemoryPatchFileOps::new(files);
        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n \
                     pre\n\
                     - old\n\
                     + new\n \
                     post\n\
                     *** Add File: new.txt\n\
                     + hello\n\
                     *** Delete File: gone.txt\n\
                     *** End Patch";
        let outcome = apply_patch_with_ops("v4a", patch, &mut ops).unwrap();
        assert_eq!(outcome.outcome, "success");
        assert!(outcome.summary.starts_with("Applied patch successfully."));
        assert!(outcome.summary.contains("* f.txt"));
        assert!(outcome.summary.contains("* new.txt"));
        assert!(outcome.summary.contains("* gone.txt"));
    }

    #[test]
    fn summary_failure_without_changes() {
        let mut ops = MemoryPatchFileOps::default();
        let outcome = apply_patch_with_ops("v4a", "no envelope here", &mut ops).unwrap();
        assert_eq!(outcome.outcome, "fail");
        assert!(outcome
            .summary
            .starts_with("Patch application failed. No changes were applied."));
        assert!(outcome.summary.contains("Missing *** Begin Patch"));
    }
}
