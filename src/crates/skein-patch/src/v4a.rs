//! V4A structural patch format.
//!
//! The envelope is `*** Begin Patch` / `*** End Patch`; inside it, per-file
//! sections start with `*** Add File:`, `*** Update File:` or
//! `*** Delete File:`. Update sections hold change chunks separated by `@@`
//! anchors (optionally labeled with a symbol that narrows the search
//! window). Chunk lines are prefixed with a space (context), `-` (delete)
//! or `+` (add); a completely empty line is blank context.
//!
//! Parsing is best effort: noise outside the envelope is ignored and errors
//! accumulate with location, hint and filename instead of aborting at the
//! first problem. Matching is linear with one repair rule: when the file
//! has a blank line the pattern lacks, an empty context item is inserted
//! into the pattern (before a non-empty context line, or at a deletion
//! boundary) and the repair is persisted into the chunk so the replacement
//! buffer stays consistent.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::fileops::PatchFileOps;
use crate::models::{join_lines, ActionKind, Commit, FileApplyStatus, FileChange, PatchError};

/// System instruction handed to models that emit V4A patches.
pub const V4A_SYSTEM_INSTRUCTION: &str = r#"# Rules
* You must output *exactly one* fenced code block labeled patch for all changes of all files.
* No prose before or after.
* Do not wrap the patch in JSON/YAML/strings.
* Never escape quotes, backslashes or newlines unless they literally appear in the source file.

Required envelope:
```patch
*** Begin Patch
[YOUR_PATCH]
*** End Patch
```

Allowed section headers per file:
- `*** Add File: <relative/path>`
- `*** Update File: <relative/path>`
- `*** Delete File: <relative/path>`
For Update sections, an optional move directive may precede the first change:
- `*** Move to: <relative/new/path>`

Update chunks use exact context and edits:
- Non-blank context lines start with one leading space followed by the exact text.
- Change lines start with - (old) or + (new) followed by the exact text.
- A blank context line is completely empty (no spaces).
- Include at least one line of pre- and post-context; add up to 3 to disambiguate.
- Use @@ to separate multiple chunks within a file; a labeled anchor such as
  `@@ class BaseClass` narrows the search to lines at or after the label.

Each file path appears once; order chunks top-to-bottom as they occur in the file.
Preserve each line's bytes exactly, including tabs and trailing-newline semantics.
"#;

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const MOVE_TO_PREFIX: &str = "*** Move to:";
const ANCHOR_PREFIX: &str = "@@";

fn file_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\*\*\*\s+(Add|Update|Delete)\s+File:\s+(.+)$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NeedleKind {
    Anchor,
    Context,
    Delete,
}

#[derive(Debug, Clone)]
struct NeedleItem {
    kind: NeedleKind,
    text: String,
}

/// One insertion group inside a chunk.
///
/// `start_pat_index` is a position in the context/delete-only pattern. For
/// `del_count > 0` the additions are emitted after the last deleted line of
/// the group; for `del_count == 0` they are emitted at the position without
/// consuming any file lines. `start_pat_index == pattern_len` appends at the
/// end of the chunk.
#[derive(Debug, Clone)]
struct EditGroup {
    start_pat_index: usize,
    del_count: usize,
    additions: Vec<String>,
}

#[derive(Debug, Clone)]
struct Chunk {
    items: Vec<NeedleItem>,
    edits: Vec<EditGroup>,
    start_line: Option<usize>,
}

#[derive(Debug, Clone)]
struct PatchAction {
    kind: ActionKind,
    chunks: Vec<Chunk>,
    move_path: Option<String>,
}

impl PatchAction {
    fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            chunks: Vec::new(),
            move_path: None,
        }
    }
}

/// Parsed patch: file sections in order of first appearance.
#[derive(Debug, Clone, Default)]
struct Patch {
    files: Vec<(String, Vec<PatchAction>)>,
}

impl Patch {
    fn entry(&mut self, path: &str) -> &mut Vec<PatchAction> {
        if let Some(idx) = self.files.iter().position(|(p, _)| p == path) {
            &mut self.files[idx].1
        } else {
            self.files.push((path.to_string(), Vec::new()));
            &mut self.files.last_mut().unwrap().1
        }
    }
}

pub(crate) fn is_relative_path(p: &str) -> bool {
    if p.is_empty() {
        return false;
    }
    if p.starts_with('/') || p.starts_with('\\') {
        return false;
    }
    // Windows drive prefix such as C:\ or C:/
    let bytes = p.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
    {
        return false;
    }
    true
}

/// Render a chunk back in its diff-like quoted form for error hints.
fn render_chunk_block(ch: &Chunk) -> String {
    let mut out: Vec<String> = Vec::new();
    for it in &ch.items {
        if it.kind == NeedleKind::Anchor {
            out.push(format!("{ANCHOR_PREFIX} {}", it.text).trim_end().to_string());
        }
    }
    let pat: Vec<&NeedleItem> = ch
        .items
        .iter()
        .filter(|it| it.kind != NeedleKind::Anchor)
        .collect();
    let pat_len = pat.len();
    let mut emitted = vec![false; ch.edits.len()];
    for (jj, item) in pat.iter().enumerate() {
        for (gi, g) in ch.edits.iter().enumerate() {
            if g.del_count == 0 && g.start_pat_index == jj && !emitted[gi] {
                for a in &g.additions {
                    out.push(format!("+{a}"));
                }
                emitted[gi] = true;
            }
        }
        match item.kind {
            NeedleKind::Context => out.push(format!(" {}", item.text)),
            NeedleKind::Delete => {
                out.push(format!("-{}", item.text));
                for (gi, g) in ch.edits.iter().enumerate() {
                    if g.del_count > 0
                        && g.start_pat_index <= jj
                        && jj < g.start_pat_index + g.del_count
                        && jj == g.start_pat_index + g.del_count - 1
                        && !emitted[gi]
                    {
                        for a in &g.additions {
                            out.push(format!("+{a}"));
                        }
                        emitted[gi] = true;
                    }
                }
            }
            NeedleKind::Anchor => {}
        }
    }
    for (gi, g) in ch.edits.iter().enumerate() {
        if g.start_pat_index == pat_len && !emitted[gi] {
            for a in &g.additions {
                out.push(format!("+{a}"));
            }
            emitted[gi] = true;
        }
    }
    out.join("\n")
}

struct Parser<'a> {
    errors: &'a mut Vec<PatchError>,
    patch: Patch,
    current_path: Option<String>,
    current_action_idx: Option<(usize, usize)>,
    skip_current_file: bool,
    pending_anchors: Vec<String>,
    chunk: Option<Chunk>,
    chunk_has_mods: bool,
    group_open: bool,
    pat_index_in_chunk: usize,
}

impl<'a> Parser<'a> {
    fn new(errors: &'a mut Vec<PatchError>) -> Self {
        Self {
            errors,
            patch: Patch::default(),
            current_path: None,
            current_action_idx: None,
            skip_current_file: false,
            pending_anchors: Vec::new(),
            chunk: None,
            chunk_has_mods: false,
            group_open: false,
            pat_index_in_chunk: 0,
        }
    }

    fn error(&mut self, err: PatchError) {
        self.errors.push(err);
    }

    fn current_action(&mut self) -> Option<&mut PatchAction> {
        let (fi, ai) = self.current_action_idx?;
        Some(&mut self.patch.files[fi].1[ai])
    }

    fn current_action_kind(&self) -> Option<ActionKind> {
        let (fi, ai) = self.current_action_idx?;
        Some(self.patch.files[fi].1[ai].kind)
    }

    fn start_chunk_if_needed(&mut self, line_no: usize) {
        if self.chunk.is_none() {
            let mut chunk = Chunk {
                items: Vec::new(),
                edits: Vec::new(),
                start_line: Some(line_no),
            };
            for a in self.pending_anchors.drain(..) {
                chunk.items.push(NeedleItem {
                    kind: NeedleKind::Anchor,
                    text: a,
                });
            }
            self.chunk = Some(chunk);
            self.chunk_has_mods = false;
            self.group_open = false;
            self.pat_index_in_chunk = 0;
        }
    }

    fn finish_chunk_if_any(&mut self) {
        let Some(chunk) = self.chunk.take() else {
            self.pending_anchors.clear();
            return;
        };
        let has_context = chunk.items.iter().any(|it| it.kind == NeedleKind::Context);
        let kind = self.current_action_kind();
        let path = self.current_path.clone();
        if !self.chunk_has_mods {
            // A context-only block inside an Add section is the file content
            // itself; for Update it is a silent no-op and dropped here.
            if kind == Some(ActionKind::Add) && has_context {
                let additions: Vec<String> = chunk
                    .items
                    .iter()
                    .filter(|it| it.kind == NeedleKind::Context)
                    .map(|it| it.text.clone())
                    .collect();
                let mut chunk = chunk;
                chunk.edits.push(EditGroup {
                    start_pat_index: 0,
                    del_count: 0,
                    additions,
                });
                if let Some(action) = self.current_action() {
                    action.chunks.push(chunk);
                }
            }
        } else {
            if kind == Some(ActionKind::Add) && has_context {
                let line = chunk.start_line;
                self.error(PatchError {
                    msg: format!(
                        "Add file section for {} must not contain context",
                        path.as_deref().unwrap_or("<unknown>")
                    ),
                    line,
                    hint: Some("Remove context lines for Add sections; only use + lines".into()),
                    filename: path.clone(),
                });
            }
            if let Some(action) = self.current_action() {
                action.chunks.push(chunk);
            }
        }
        self.chunk_has_mods = false;
        self.group_open = false;
        self.pat_index_in_chunk = 0;
    }

    fn push_delete(&mut self, text: String, line_no: usize) {
        self.start_chunk_if_needed(line_no);
        let pat_index = self.pat_index_in_chunk;
        let group_open = self.group_open;
        let chunk = self.chunk.as_mut().unwrap();
        if !group_open {
            chunk.edits.push(EditGroup {
                start_pat_index: pat_index,
                del_count: 0,
                additions: Vec::new(),
            });
            self.group_open = true;
        }
        chunk.items.push(NeedleItem {
            kind: NeedleKind::Delete,
            text,
        });
        chunk.edits.last_mut().unwrap().del_count += 1;
        self.pat_index_in_chunk += 1;
        self.chunk_has_mods = true;
    }

    fn push_add(&mut self, text: String, line_no: usize) {
        self.start_chunk_if_needed(line_no);
        let pat_index = self.pat_index_in_chunk;
        let group_open = self.group_open;
        let chunk = self.chunk.as_mut().unwrap();
        if !group_open {
            chunk.edits.push(EditGroup {
                start_pat_index: pat_index,
                del_count: 0,
                additions: Vec::new(),
            });
            self.group_open = true;
        }
        chunk.edits.last_mut().unwrap().additions.push(text);
        self.chunk_has_mods = true;
    }

    fn push_context(&mut self, text: String, line_no: usize) {
        self.start_chunk_if_needed(line_no);
        let chunk = self.chunk.as_mut().unwrap();
        chunk.items.push(NeedleItem {
            kind: NeedleKind::Context,
            text,
        });
        self.pat_index_in_chunk += 1;
        // Context closes the current edit group; the next +/- opens a new one.
        self.group_open = false;
    }
}

fn parse_v4a_patch(text: &str) -> (Patch, Vec<PatchError>) {
    let mut errors: Vec<PatchError> = Vec::new();
    let lines: Vec<&str> = text.lines().collect();

    let begin_idxs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.trim() == BEGIN_MARKER)
        .map(|(i, _)| i)
        .collect();
    let end_idxs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.trim() == END_MARKER)
        .map(|(i, _)| i)
        .collect();

    if begin_idxs.is_empty() {
        return (
            Patch::default(),
            vec![PatchError::new("Missing *** Begin Patch")
                .with_hint("Ensure patch is wrapped with *** Begin Patch / *** End Patch")],
        );
    }
    if end_idxs.is_empty() {
        return (
            Patch::default(),
            vec![PatchError::new("Missing *** End Patch")
                .with_hint("Ensure patch is wrapped with *** Begin Patch / *** End Patch")],
        );
    }
    if begin_idxs.len() > 1 {
        let extras: Vec<String> = begin_idxs[1..].iter().map(|i| (i + 1).to_string()).collect();
        return (
            Patch::default(),
            vec![PatchError::new("Multiple *** Begin Patch markers found")
                .with_line(begin_idxs[1] + 1)
                .with_hint(format!(
                    "Merge all changes into a single patch enclosed by one *** Begin Patch and \
                     one *** End Patch. Extra BEGIN markers at lines: {}",
                    extras.join(", ")
                ))],
        );
    }

    let first_begin = begin_idxs[0];
    let ends_after: Vec<usize> = end_idxs.iter().copied().filter(|i| *i > first_begin).collect();
    if ends_after.is_empty() {
        errors.push(
            PatchError::new("No *** End Patch after *** Begin Patch")
                .with_line(first_begin + 1)
                .with_hint("Add *** End Patch after this line"),
        );
        return (Patch::default(), errors);
    }
    if end_idxs.len() > 1 {
        let first_end = ends_after[0];
        let extras: Vec<usize> = end_idxs.iter().copied().filter(|i| *i != first_end).collect();
        errors.push(
            PatchError::new("Multiple *** End Patch markers found; using the first after begin")
                .with_line(extras.first().map(|i| i + 1).unwrap_or(first_end + 1))
                .with_hint(format!(
                    "Extra END markers at lines: {}",
                    extras
                        .iter()
                        .map(|i| (i + 1).to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
        );
    }
    let first_end = ends_after[0];

    let mut parser = Parser::new(&mut errors);

    for (offset, raw_line) in lines[first_begin + 1..first_end].iter().enumerate() {
        let line_no = first_begin + 2 + offset;
        let raw_line = *raw_line;

        if let Some(caps) = file_header_re().captures(raw_line) {
            parser.finish_chunk_if_any();
            parser.chunk = None;
            parser.chunk_has_mods = false;
            parser.pending_anchors.clear();

            let action_word = caps.get(1).unwrap().as_str();
            let path = caps.get(2).unwrap().as_str().trim().to_string();
            parser.current_path = Some(path.clone());
            parser.current_action_idx = None;
            parser.skip_current_file = false;

            if !is_relative_path(&path) {
                parser.error(
                    PatchError::new(format!("Path must be relative: {path:?}"))
                        .with_line(line_no)
                        .with_hint("Use a relative path, not absolute")
                        .with_filename(path),
                );
                parser.skip_current_file = true;
                continue;
            }

            let kind = match action_word {
                "Add" => ActionKind::Add,
                "Update" => ActionKind::Update,
                "Delete" => ActionKind::Delete,
                _ => unreachable!("header regex admits Add/Update/Delete only"),
            };
            let actions = parser.patch.entry(&path);
            actions.push(PatchAction::new(kind));
            let ai = actions.len() - 1;
            let fi = parser
                .patch
                .files
                .iter()
                .position(|(p, _)| *p == path)
                .unwrap();
            parser.current_action_idx = Some((fi, ai));
            continue;
        }

        if parser.current_path.is_none()
            || parser.current_action_idx.is_none()
            || parser.skip_current_file
        {
            continue;
        }
        let current_path = parser.current_path.clone().unwrap();

        if raw_line.starts_with(MOVE_TO_PREFIX) {
            let move_to = raw_line[MOVE_TO_PREFIX.len()..].trim().to_string();
            let kind = parser.current_action_kind().unwrap();
            let has_chunks = parser.chunk.is_some()
                || parser
                    .current_action()
                    .map(|a| !a.chunks.is_empty())
                    .unwrap_or(false);
            let has_move = parser
                .current_action()
                .map(|a| a.move_path.is_some())
                .unwrap_or(false);
            if kind != ActionKind::Update {
                parser.error(
                    PatchError::new(format!(
                        "Move directive is only valid in Update sections: {current_path}"
                    ))
                    .with_line(line_no)
                    .with_filename(current_path.clone()),
                );
            } else if has_chunks {
                parser.error(
                    PatchError::new(format!(
                        "Move directive must appear before any change blocks in {current_path}"
                    ))
                    .with_line(line_no)
                    .with_filename(current_path.clone()),
                );
            } else if has_move {
                parser.error(
                    PatchError::new(format!("Duplicate Move directive in {current_path}"))
                        .with_line(line_no)
                        .with_filename(current_path.clone()),
                );
            } else if !is_relative_path(&move_to) {
                parser.error(
                    PatchError::new(format!("Path must be relative: {move_to:?}"))
                        .with_line(line_no)
                        .with_hint("Use a relative path for Move to")
                        .with_filename(current_path.clone()),
                );
            } else if let Some(action) = parser.current_action() {
                action.move_path = Some(move_to);
            }
            continue;
        }

        if parser.current_action_kind() == Some(ActionKind::Delete) {
            if !raw_line.trim().is_empty() {
                parser.error(
                    PatchError::new(format!(
                        "Delete file section for {current_path} must not contain changes or content"
                    ))
                    .with_line(line_no)
                    .with_hint(
                        "Delete sections must not include anchors, +/- lines, or context/content",
                    )
                    .with_filename(current_path.clone()),
                );
            }
            continue;
        }

        if let Some(anchor) = raw_line.strip_prefix(ANCHOR_PREFIX) {
            // @@ breaks the current chunk; the label (if any) seeds the next.
            parser.finish_chunk_if_any();
            let anchor = anchor.strip_prefix(' ').unwrap_or(anchor);
            parser.pending_anchors.push(anchor.to_string());
            continue;
        }

        if let Some(text) = raw_line.strip_prefix('-') {
            parser.push_delete(text.to_string(), line_no);
            continue;
        }
        if let Some(text) = raw_line.strip_prefix('+') {
            parser.push_add(text.to_string(), line_no);
            continue;
        }
        if raw_line.trim().is_empty() {
            parser.push_context(String::new(), line_no);
            continue;
        }
        if let Some(text) = raw_line.strip_prefix(' ') {
            parser.push_context(text.to_string(), line_no);
            continue;
        }

        // Add sections are permissive: bare lines become file content.
        if parser.current_action_kind() == Some(ActionKind::Add) {
            parser.push_add(raw_line.to_string(), line_no);
            continue;
        }

        parser.error(
            PatchError::new(format!(
                "Invalid patch line in {current_path}: must start with @@, -, +, or a space"
            ))
            .with_line(line_no)
            .with_hint(
                "Lines inside file sections must start with '@@', '-', '+', or a single leading \
                 space for context. Blank lines are allowed as empty context.",
            )
            .with_filename(current_path.clone()),
        );
    }

    parser.finish_chunk_if_any();
    let patch = parser.patch;
    (patch, errors)
}

struct ChunkMatch {
    start: usize,
    end: usize,
    replacement: Vec<String>,
}

/// Linear, anchor-aware search for one chunk.
///
/// The needle is the ordered list of context and delete lines; additions
/// are insertion-only and never searched for. Labeled anchors restrict
/// candidate starts to positions at or after the earliest line containing
/// the label. On success the blank-line repairs are persisted into the
/// chunk and the replacement buffer for the matched region is returned.
fn find_chunk_linear(
    file_lines: &[String],
    chunk: &mut Chunk,
    start_min: usize,
) -> Result<ChunkMatch, String> {
    let pat_items_idx: Vec<usize> = chunk
        .items
        .iter()
        .enumerate()
        .filter(|(_, it)| it.kind != NeedleKind::Anchor)
        .map(|(i, _)| i)
        .collect();
    let pat: Vec<(NeedleKind, String)> = pat_items_idx
        .iter()
        .map(|&i| (chunk.items[i].kind, chunk.items[i].text.clone()))
        .collect();
    let pat_len = pat.len();
    let n_lines = file_lines.len();
    if pat_len == 0 {
        return Err("Empty change block (no context/deletions)".to_string());
    }

    let mut lower_bound = start_min;
    let anchor_positions: Vec<usize> = chunk
        .items
        .iter()
        .filter(|it| it.kind == NeedleKind::Anchor && !it.text.is_empty())
        .filter_map(|it| file_lines.iter().position(|l| l.contains(&it.text)))
        .collect();
    if let Some(min_anchor) = anchor_positions.iter().min() {
        lower_bound = lower_bound.max(*min_anchor);
    }
    let upper = if n_lines >= pat_len {
        n_lines - pat_len + 1
    } else {
        lower_bound
    };

    for start in lower_bound..upper.max(lower_bound) {
        let mut i = start;
        let mut j = 0usize;
        let mut prev_matched_any = false;
        let mut insert_positions: Vec<usize> = Vec::new();
        let mut ok = true;

        while j < pat_len {
            if i >= n_lines {
                ok = false;
                break;
            }
            let (kind, ref expected) = pat[j];
            let actual = &file_lines[i];
            if actual == expected {
                prev_matched_any = true;
                i += 1;
                j += 1;
                continue;
            }
            if actual.is_empty() {
                // Missing blank before a non-empty context line.
                if kind == NeedleKind::Context && !expected.is_empty() {
                    insert_positions.push(j);
                    i += 1;
                    prev_matched_any = true;
                    continue;
                }
                // Extra blank at a deletion boundary.
                if kind == NeedleKind::Delete && prev_matched_any {
                    insert_positions.push(j);
                    i += 1;
                    continue;
                }
            }
            ok = false;
            break;
        }

        if !ok {
            continue;
        }

        // Persist the blank-line repairs into the chunk so the replacement
        // buffer and any later re-match see the same pattern.
        if !insert_positions.is_empty() {
            let mut items_idx_for_pat = pat_items_idx.clone();
            insert_positions.sort_unstable();
            for &pos in &insert_positions {
                let insert_at = items_idx_for_pat[pos];
                chunk.items.insert(
                    insert_at,
                    NeedleItem {
                        kind: NeedleKind::Context,
                        text: String::new(),
                    },
                );
                for idx in items_idx_for_pat.iter_mut().skip(pos) {
                    *idx += 1;
                }
                for g in &mut chunk.edits {
                    if g.start_pat_index >= pos {
                        g.start_pat_index += 1;
                    }
                }
            }
        }

        let pat_built: Vec<(NeedleKind, String)> = chunk
            .items
            .iter()
            .filter(|it| it.kind != NeedleKind::Anchor)
            .map(|it| (it.kind, it.text.clone()))
            .collect();
        let mut replacement: Vec<String> = Vec::new();
        let mut group_progress: BTreeMap<usize, usize> = BTreeMap::new();
        let mut inserted = vec![false; chunk.edits.len()];
        let mut k = start;
        for (jj, (kind, _)) in pat_built.iter().enumerate() {
            for (gi, g) in chunk.edits.iter().enumerate() {
                if g.del_count == 0 && g.start_pat_index == jj && !inserted[gi] {
                    replacement.extend(g.additions.iter().cloned());
                    inserted[gi] = true;
                }
            }
            match kind {
                NeedleKind::Context => {
                    replacement.push(file_lines[k].clone());
                    k += 1;
                }
                NeedleKind::Delete => {
                    k += 1;
                    for (gi, g) in chunk.edits.iter().enumerate() {
                        if g.del_count > 0
                            && g.start_pat_index <= jj
                            && jj < g.start_pat_index + g.del_count
                        {
                            let progress = group_progress.entry(gi).or_insert(0);
                            *progress += 1;
                            if *progress == g.del_count && !inserted[gi] {
                                replacement.extend(g.additions.iter().cloned());
                                inserted[gi] = true;
                            }
                        }
                    }
                }
                NeedleKind::Anchor => {}
            }
        }
        let pat_len_now = pat_built.len();
        for (gi, g) in chunk.edits.iter().enumerate() {
            if g.start_pat_index == pat_len_now && !inserted[gi] {
                replacement.extend(g.additions.iter().cloned());
                inserted[gi] = true;
            }
        }
        return Ok(ChunkMatch {
            start,
            end: start + pat_len_now,
            replacement,
        });
    }

    let block = render_chunk_block(chunk);
    Err(format!(
        "Change block not found. Here is the block you provided:\n---\n{block}\n---"
    ))
}

fn format_block_excerpt(file_lines: &[String], s: usize, e: usize) -> String {
    const MAX_LINES: usize = 8;
    let segment: Vec<String> = file_lines[s.min(file_lines.len())..e.min(file_lines.len())].to_vec();
    let segment = if segment.len() > MAX_LINES {
        let mut short: Vec<String> = segment[..MAX_LINES / 2].to_vec();
        short.push("...".to_string());
        short.extend(segment[segment.len() - MAX_LINES / 2..].iter().cloned());
        short
    } else {
        segment
    };
    segment
        .iter()
        .map(|ln| format!("  | {ln}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_commits(
    patch: Patch,
    files: &BTreeMap<String, String>,
) -> (Vec<Commit>, Vec<PatchError>, BTreeMap<String, FileApplyStatus>) {
    let mut errors: Vec<PatchError> = Vec::new();
    let mut changes: Vec<(String, FileChange)> = Vec::new();
    let mut status_map: BTreeMap<String, FileApplyStatus> = BTreeMap::new();

    // Flatten each file's sections into one effective action, rejecting
    // contradictory combinations up front. A Delete followed by an Add is a
    // replace; everything else mixing kinds is an error.
    let mut effective: Vec<(String, PatchAction)> = Vec::new();
    for (path, actions) in patch.files {
        let num_creates = actions.iter().filter(|a| a.kind == ActionKind::Add).count();
        let num_deletes = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Delete)
            .count();
        let has_update = actions.iter().any(|a| a.kind == ActionKind::Update);

        if num_creates > 1 {
            errors.push(
                PatchError::new(format!("Multiple Add File sections for {path}"))
                    .with_filename(path.clone()),
            );
            continue;
        }
        if num_deletes > 1 {
            errors.push(
                PatchError::new(format!("Multiple Delete File sections for {path}"))
                    .with_filename(path.clone()),
            );
            continue;
        }

        if num_creates == 1 {
            if has_update {
                errors.push(
                    PatchError::new(format!("Cannot mix Update and Add sections for {path}"))
                        .with_filename(path.clone()),
                );
                continue;
            }
            let create_idx = actions.iter().position(|a| a.kind == ActionKind::Add).unwrap();
            if num_deletes == 1 {
                let delete_idx = actions
                    .iter()
                    .position(|a| a.kind == ActionKind::Delete)
                    .unwrap();
                if delete_idx > create_idx {
                    errors.push(
                        PatchError::new(format!("Add must follow Delete for {path}"))
                            .with_filename(path.clone()),
                    );
                    continue;
                }
            }
            effective.push((path, actions.into_iter().nth(create_idx).unwrap()));
        } else if num_deletes == 1 {
            if has_update {
                errors.push(
                    PatchError::new(format!("Cannot mix Delete and Update sections for {path}"))
                        .with_filename(path.clone()),
                );
                continue;
            }
            let idx = actions
                .iter()
                .position(|a| a.kind == ActionKind::Delete)
                .unwrap();
            effective.push((path, actions.into_iter().nth(idx).unwrap()));
        } else if has_update {
            let mut merged = PatchAction::new(ActionKind::Update);
            for ua in actions.into_iter().filter(|a| a.kind == ActionKind::Update) {
                merged.chunks.extend(ua.chunks);
                if ua.move_path.is_some() {
                    merged.move_path = ua.move_path;
                }
            }
            effective.push((path, merged));
        }
    }

    if !errors.is_empty() {
        return (Vec::new(), errors, BTreeMap::new());
    }

    for (path, mut action) in effective {
        match action.kind {
            ActionKind::Add => {
                let mut add_lines: Vec<String> = Vec::new();
                for ch in &action.chunks {
                    for g in &ch.edits {
                        add_lines.extend(g.additions.iter().cloned());
                    }
                }
                let new_content = join_lines(&add_lines, false);
                changes.push((
                    path.clone(),
                    FileChange {
                        kind: ActionKind::Add,
                        old_content: None,
                        new_content: Some(new_content),
                        move_path: None,
                    },
                ));
                status_map.insert(path, FileApplyStatus::Create);
                continue;
            }
            ActionKind::Delete => {
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
            ActionKind::Update => {}
        }

        // Update sections without any +/- lines would silently no-op, which
        // always means the model emitted a broken patch; call it out.
        if action.chunks.is_empty() {
            errors.push(
                PatchError::new(format!("No change lines (+/-) provided for file: {path}"))
                    .with_hint(
                        "Update sections must include '-' for removed lines and '+' for added \
                         lines, with surrounding context lines that start with a single space. \
                         Pure context blocks are ignored for Update.",
                    )
                    .with_filename(path.clone()),
            );
            continue;
        }

        let Some(original) = files.get(&path) else {
            errors.push(
                PatchError::new(format!("No loaded content for file: {path}"))
                    .with_hint("Load files before building commits or ensure the file exists for update.")
                    .with_filename(path.clone()),
            );
            continue;
        };
        let had_eol = original.ends_with('\n');
        let file_lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

        // Phase 1: locate every chunk. Re-matching at the end of the last
        // match disambiguates repeated identical blocks before the final
        // ordering check.
        let mut located: Vec<(usize, usize, Vec<String>, Option<usize>)> = Vec::new();
        let mut any_failed = false;
        let mut last_start: Option<usize> = None;
        let mut last_end: Option<usize> = None;
        for ch in &mut action.chunks {
            let start_line = ch.start_line;
            let matched = match find_chunk_linear(&file_lines, ch, 0) {
                Ok(m) => m,
                Err(hint) => {
                    errors.push(
                        PatchError::new(format!("Failed to locate change block in {path}"))
                            .with_line(start_line.unwrap_or(0))
                            .with_hint(hint)
                            .with_filename(path.clone()),
                    );
                    any_failed = true;
                    continue;
                }
            };
            let mut matched = matched;
            if let Some(prev_end) = last_end {
                if matched.start < prev_end {
                    if let Ok(m2) = find_chunk_linear(&file_lines, ch, prev_end) {
                        matched = m2;
                    }
                }
            }
            if let Some(prev_start) = last_start {
                if matched.start < prev_start {
                    errors.push(
                        PatchError::new(format!("Out-of-order change block in {path}"))
                            .with_line(start_line.unwrap_or(0))
                            .with_hint(
                                "Ensure blocks are ordered top-to-bottom as they appear in the \
                                 file, or add @@ anchors to disambiguate.",
                            )
                            .with_filename(path.clone()),
                    );
                    any_failed = true;
                    continue;
                }
            }
            last_start = Some(matched.start);
            last_end = Some(matched.end);
            located.push((matched.start, matched.end, matched.replacement, start_line));
        }

        if located.is_empty() {
            continue;
        }

        // Phase 2: overlapping matched ranges abort this file entirely.
        located.sort_by_key(|t| t.0);
        let mut overlaps_found = false;
        for pair in located.windows(2) {
            let (s1, e1, _, l1) = (&pair[0].0, &pair[0].1, &pair[0].2, pair[0].3);
            let (s2, e2, _, l2) = (&pair[1].0, &pair[1].1, &pair[1].2, pair[1].3);
            if e1 > s2 {
                overlaps_found = true;
                let hint = format!(
                    "Two change blocks overlap in their context/deletion ranges. First block \
                     covers [{s1}, {e1}), second covers [{s2}, {e2}).\nFirst block excerpt:\n{}\n\
                     Second block excerpt:\n{}\nReorder the chunks or regenerate the patch to \
                     avoid overlapping contexts.",
                    format_block_excerpt(&file_lines, *s1, *e1),
                    format_block_excerpt(&file_lines, *s2, *e2),
                );
                let line = match (l1, l2) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                };
                let mut err = PatchError::new(format!("Overlapping change blocks detected in {path}"))
                    .with_hint(hint)
                    .with_filename(path.clone());
                err.line = line;
                errors.push(err);
            }
        }
        if overlaps_found {
            continue;
        }

        // Phase 3: splice the replacement buffers into the file.
        let mut result: Vec<String> = Vec::new();
        let mut cursor = 0usize;
        for (start, end, replacement, _) in &located {
            result.extend(file_lines[cursor..*start].iter().cloned());
            result.extend(replacement.iter().cloned());
            cursor = *end;
        }
        result.extend(file_lines[cursor..].iter().cloned());

        let new_content = join_lines(&result, had_eol);
        changes.push((
            path.clone(),
            FileChange {
                kind: ActionKind::Update,
                old_content: Some(original.clone()),
                new_content: Some(new_content),
                move_path: action.move_path.clone(),
            },
        ));
        status_map.insert(
            path,
            if any_failed {
                FileApplyStatus::PartialUpdate
            } else {
                FileApplyStatus::Update
            },
        );
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
                    let target = change.move_path.clone().unwrap_or_else(|| path.clone());
                    let content = change.new_content.clone().unwrap_or_default();
                    ops.write(&target, &content).and_then(|()| {
                        if change.kind == ActionKind::Update && change.move_path.is_some() {
                            ops.delete(&path)
                        } else {
                            Ok(())
                        }
                    })
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

/// Parse and apply a V4A patch through the given file operations.
///
/// Parse errors short-circuit with no writes; matching failures are
/// reported per chunk and may leave files partially updated. The status
/// map records the per-file outcome under the original path.
pub fn process_v4a_patch(
    text: &str,
    ops: &mut dyn PatchFileOps,
) -> (BTreeMap<String, FileApplyStatus>, Vec<PatchError>) {
    let (patch, mut errors) = parse_v4a_patch(text);
    if !errors.is_empty() {
        // Attach a source snippet to invalid-line errors when the target
        // file is readable; it is the fastest way to regenerate the chunk.
        for e in &mut errors {
            if e.msg.starts_with("Invalid patch line in ") {
                if let Some(filename) = e.filename.clone() {
                    if let Ok(src) = ops.open(&filename) {
                        let snippet = format!("```\n{src}\n```");
                        e.hint = Some(match e.hint.take() {
                            Some(h) => format!("{h}\n\n{snippet}"),
                            None => snippet,
                        });
                    }
                }
            }
        }
        return (BTreeMap::new(), errors);
    }

    let mut files: BTreeMap<String, String> = BTreeMap::new();
    let mut read_errors: Vec<PatchError> = Vec::new();
    for (path, actions) in &patch.files {
        if actions.iter().any(|a| a.kind == ActionKind::Update) {
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
