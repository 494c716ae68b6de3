//! Fenced SEARCH/REPLACE patch format.
//!
//! Each block is a fenced region whose first line is the relative file
//! path, followed by `<<<<<<< SEARCH`, the exact current content, `=======`,
//! the replacement content and `>>>>>>> REPLACE`. Empty SEARCH with content
//! in REPLACE adds a file; the inverse deletes it; both non-empty updates
//! the first exact occurrence. Multiple blocks per file apply in order.
//! There is no fuzzy matching in this format.

use std::collections::BTreeMap;

use crate::fileops::PatchFileOps;
use crate::models::{join_lines, ActionKind, Commit, FileApplyStatus, FileChange, PatchError};
use crate::v4a::is_relative_path;

/// System instruction handed to models that emit SEARCH/REPLACE patches.
pub const SEARCH_REPLACE_SYSTEM_INSTRUCTION: &str = r#"# Patch format: SEARCH/REPLACE blocks

**OUTPUT:** Only patch blocks. No prose before/between/after.

## Format
Emit exactly one SEARCH/REPLACE fenced block per change using the file's language tag:

```<lang>
<full/path/to/file>
<<<<<<< SEARCH
<contiguous lines that EXACTLY match current content>
=======
<replacement lines>
>>>>>>> REPLACE
```

Edits: use the format above.
Adds (new file): leave SEARCH empty; put full file contents in REPLACE.
Deletes: put entire current file in SEARCH; leave REPLACE empty.

## Rules
1. SEARCH must match character-for-character (whitespace, quotes, comments).
2. Include enough lines in SEARCH to uniquely identify the lines being replaced.
3. SEARCH/REPLACE only changes the first occurrence.
4. Multiple blocks per file are allowed, but blocks must not overlap and each
   block needs its own fence.
5. Keep changes small; break larger changes into a series of blocks.
"#;

const SEARCH_MARK: &str = "<<<<<<< SEARCH";
const SPLIT_MARK: &str = "=======";
const REPLACE_MARK: &str = ">>>>>>> REPLACE";

#[derive(Debug, Clone)]
struct SrAction {
    kind: ActionKind,
    search: Vec<String>,
    replace: Vec<String>,
    start_line: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct SrPatch {
    files: Vec<(String, Vec<SrAction>)>,
}

impl SrPatch {
    fn entry(&mut self, path: &str) -> &mut Vec<SrAction> {
        if let Some(idx) = self.files.iter().position(|(p, _)| p == path) {
            &mut self.files[idx].1
        } else {
            self.files.push((path.to_string(), Vec::new()));
            &mut self.files.last_mut().unwrap().1
        }
    }
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn parse_patch(text: &str) -> (SrPatch, Vec<PatchError>) {
    let mut errors: Vec<PatchError> = Vec::new();
    let mut patch = SrPatch::default();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0usize;

    // Skip forward to the next fence line, consuming it when present.
    fn skip_to_fence_end(lines: &[&str], mut i: usize) -> usize {
        while i < lines.len() && !is_fence(lines[i]) {
            i += 1;
        }
        if i < lines.len() {
            i += 1;
        }
        i
    }

    while i < lines.len() {
        if !is_fence(lines[i]) {
            i += 1;
            continue;
        }

        let fence_start_line = i + 1;
        i += 1;
        if i >= lines.len() {
            errors.push(
                PatchError::new("Unterminated code fence")
                    .with_line(fence_start_line)
                    .with_hint("Add closing fence for the patch block"),
            );
            break;
        }

        let path_line_no = i + 1;
        let path = lines[i].trim().to_string();
        i += 1;
        if !is_relative_path(&path) {
            errors.push(
                PatchError::new(format!("Path must be relative: {path:?}"))
                    .with_line(path_line_no)
                    .with_hint("Use a relative repo path")
                    .with_filename(path),
            );
            i = skip_to_fence_end(&lines, i);
            continue;
        }

        if i >= lines.len() || lines[i].trim() != SEARCH_MARK {
            errors.push(
                PatchError::new("Missing <<<<<<< SEARCH marker")
                    .with_line(i + 1)
                    .with_filename(path),
            );
            i = skip_to_fence_end(&lines, i);
            continue;
        }
        i += 1;

        let mut search_lines: Vec<String> = Vec::new();
        let mut broke_on_fence = false;
        while i < lines.len() && lines[i].trim() != SPLIT_MARK {
            if is_fence(lines[i]) {
                errors.push(
                    PatchError::new("Missing ======= split marker")
                        .with_line(i + 1)
                        .with_filename(path.clone()),
                );
                broke_on_fence = true;
                break;
            }
            search_lines.push(lines[i].to_string());
            i += 1;
        }
        if broke_on_fence || i >= lines.len() || lines[i].trim() != SPLIT_MARK {
            i = skip_to_fence_end(&lines, i);
            continue;
        }
        i += 1;

        let mut replace_lines: Vec<String> = Vec::new();
        let mut broke_on_fence = false;
        while i < lines.len() && lines[i].trim() != REPLACE_MARK {
            if is_fence(lines[i]) {
                errors.push(
                    PatchError::new("Missing >>>>>>> REPLACE marker")
                        .with_line(i + 1)
                        .with_filename(path.clone()),
                );
                broke_on_fence = true;
                break;
            }
            replace_lines.push(lines[i].to_string());
            i += 1;
        }
        if broke_on_fence || i >= lines.len() || lines[i].trim() != REPLACE_MARK {
            i = skip_to_fence_end(&lines, i);
            continue;
        }
        i += 1;

        if i >= lines.len() || !is_fence(lines[i]) {
            let mut err = PatchError::new("Missing closing code fence").with_filename(path.clone());
            if i < lines.len() {
                err.line = Some(i + 1);
            }
            errors.push(err);
            i = skip_to_fence_end(&lines, i);
        } else {
            i += 1;
        }

        // A single empty line counts as empty content.
        if search_lines.len() == 1 && search_lines[0].is_empty() {
            search_lines.clear();
        }
        if replace_lines.len() == 1 && replace_lines[0].is_empty() {
            replace_lines.clear();
        }

        let kind = match (!search_lines.is_empty(), !replace_lines.is_empty()) {
            (true, false) => ActionKind::Delete,
            (false, true) => ActionKind::Add,
            (true, true) => ActionKind::Update,
            (false, false) => {
                errors.push(
                    PatchError::new("Empty patch block (no SEARCH and no REPLACE content)")
                        .with_line(path_line_no)
                        .with_filename(path),
                );
                continue;
            }
        };
        patch.entry(&path).push(SrAction {
            kind,
            search: search_lines,
            replace: replace_lines,
            start_line: Some(path_line_no),
        });
    }

    (patch, errors)
}

fn find_subsequence(hay: &[String], needle: &[String]) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&start| hay[start..start + needle.len()] == *needle)
}

fn build_commits(
    patch: SrPatch,
    files: &BTreeMap<String, String>,
) -> (Vec<Commit>, Vec<PatchError>, BTreeMap<String, FileApplyStatus>) {
    let mut errors: Vec<PatchError> = Vec::new();
    let mut changes: Vec<(String, FileChange)> = Vec::new();
    let mut status_map: BTreeMap<String, FileApplyStatus> = BTreeMap::new();

    for (path, actions) in patch.files {
        if actions.is_empty() {
            continue;
        }

        let first = &actions[0];
        let mut deleted = false;
        let mut any_failed = false;
        let mut applied_any = false;

        let (mut file_lines, had_eol, existed, original, rest): (
            Vec<String>,
            bool,
            bool,
            Option<String>,
            &[SrAction],
        ) = match first.kind {
            ActionKind::Add => (first.replace.clone(), false, false, None, &actions[1..]),
            ActionKind::Delete => {
                deleted = true;
                (Vec::new(), false, true, None, &[])
            }
            ActionKind::Update => {
                let Some(original) = files.get(&path) else {
                    errors.push(
                        PatchError::new(format!("No loaded content for file: {path}"))
                            .with_hint("Ensure the file exists and is readable for update.")
                            .with_filename(path.clone())
                            .with_line(first.start_line.unwrap_or(0)),
                    );
                    status_map.insert(path, FileApplyStatus::PartialUpdate);
                    continue;
                };
                (
                    original.lines().map(|s| s.to_string()).collect(),
                    original.ends_with('\n'),
                    true,
                    Some(original.clone()),
                    &actions[..],
                )
            }
        };

        for act in rest {
            match act.kind {
                ActionKind::Add => {
                    errors.push(
                        PatchError::new(format!("Ignoring Add block not at start for {path}"))
                            .with_line(act.start_line.unwrap_or(0))
                            .with_hint("Only the first block may be an Add for a new file")
                            .with_filename(path.clone()),
                    );
                    any_failed = true;
                }
                ActionKind::Delete => {
                    deleted = true;
                    break;
                }
                ActionKind::Update => match find_subsequence(&file_lines, &act.search) {
                    Some(start) => {
                        let end = start + act.search.len();
                        let mut next = file_lines[..start].to_vec();
                        next.extend(act.replace.iter().cloned());
                        next.extend(file_lines[end..].iter().cloned());
                        file_lines = next;
                        applied_any = true;
                    }
                    None => {
                        let block = act.search.join("\n");
                        errors.push(
                            PatchError::new(format!(
                                "Failed to locate exact SEARCH block in {path}"
                            ))
                            .with_hint(format!(
                                "SEARCH content must match current file exactly. Block not \
                                 found:\n---\n{block}\n---"
                            ))
                            .with_filename(path.clone())
                            .with_line(act.start_line.unwrap_or(0)),
                        );
                        any_failed = true;
                    }
                },
            }
        }

        if deleted {
            changes.push((
                path.clone(),
                FileChange {
                    kind: ActionKind::Delete,
                    old_content: None,
                    new_content: None,
                    move_path: None,
                },
            ));
            status_map.insert(path, FileApplyStatus::Delete);
            continue;
        }

        if !existed {
            let new_content = join_lines(&file_lines, had_eol);
            changes.push((
                path.clone(),
                FileChange {
                    kind: ActionKind::Add,
                    old_content: None,
                    new_content: Some(new_content),
                    move_path: None,
                },
            ));
            status_map.insert(
                path,
                if any_failed {
                    FileApplyStatus::PartialUpdate
                } else {
                    FileApplyStatus::Create
                },
            );
        } else {
            status_map.insert(
                path.clone(),
                if any_failed {
                    FileApplyStatus::PartialUpdate
                } else {
                    FileApplyStatus::Update
                },
            );
            if applied_any {
                let new_content = join_lines(&file_lines, had_eol);
                changes.push((
                    path,
                    FileChange {
                        kind: ActionKind::Update,
                        old_content: original,
                        new_content: Some(new_content),
                        move_path: None,
                    },
                ));
            }
        }
    }

    let commits = if changes.is_empty() {
        Vec::new()
    } else {
        vec![Commit { changes }]
    };
    (commits, errors, status_map)
}

fn apply_commits(commits: Vec<Commit>, ops: &mut dyn PatchFileOps) -> Vec<PatchError> {
    let mut errors: Vec<PatchError> = Vec::new();
    for commit in commits {
        for (path, change) in commit.changes {
            let result = match change.kind {
                ActionKind::Add | ActionKind::Update => {
                    ops.write(&path, change.new_content.as_deref().unwrap_or(""))
                }
                ActionKind::Delete => ops.delete(&path),
            };
            if let Err(e) = result {
                errors.push(
                    PatchError::new(format!("Failed to apply change to file: {path}"))
                        .with_hint(e.to_string())
                        .with_filename(path.clone()),
                );
            }
        }
    }
    errors
}

/// Parse and apply a SEARCH/REPLACE patch through the given file operations.
pub fn process_search_replace_patch(
    text: &str,
    ops: &mut dyn PatchFileOps,
) -> (BTreeMap<String, FileApplyStatus>, Vec<PatchError>) {
    let (patch, parse_errors) = parse_patch(text);
    if !parse_errors.is_empty() {
        return (BTreeMap::new(), parse_errors);
    }

    // Only paths whose block sequence actually updates existing content need
    // to be read; pure adds and deletes skip the filesystem round trip.
    let mut files: BTreeMap<String, String> = BTreeMap::new();
    let mut read_errors: Vec<PatchError> = Vec::new();
    for (path, actions) in &patch.files {
        let first_is_add = actions.first().map(|a| a.kind) == Some(ActionKind::Add);
        let needs_read = actions.iter().any(|a| a.kind == ActionKind::Update) && !first_is_add;
        if needs_read {
            match ops.open(path) {
                Ok(content) => {
                    files.insert(path.clone(), content);
                }
                Err(e) => read_errors.push(
                    PatchError::new(format!("Failed to read file: {path}"))
                        .with_hint(e.to_string())
                        .with_filename(path.clone()),
                ),
            }
        }
    }
    if !read_errors.is_empty() {
        return (BTreeMap::new(), read_errors);
    }

    let (commits, build_errors, status_map) = build_commits(patch, &files);
    let apply_errors = apply_commits(commits, ops);
    let mut all_errors = build_errors;
    all_errors.extend(apply_errors);
    (status_map, all_errors)
}
