mod common;

use common::{has_error, RecordingOps};
use skein_patch::{process_search_replace_patch, FileApplyStatus};

fn lines(parts: &[&str]) -> String {
    parts.join("\n")
}

#[test]
fn add_file_from_empty_search() {
    let text = lines(&[
        "```text",
        "new.txt",
        "<<<<<<< SEARCH",
        "=======",
        "Hello",
        "World",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(statuses["new.txt"], FileApplyStatus::Create);
    assert_eq!(ops.writes["new.txt"].trim(), "Hello\nWorld");
}

#[test]
fn update_replaces_first_exact_occurrence() {
    let text = lines(&[
        "```text",
        "file.txt",
        "<<<<<<< SEARCH",
        "old",
        "=======",
        "new",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("file.txt", "pre\nold\npost\n")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(errors.is_empty());
    assert_eq!(statuses["file.txt"], FileApplyStatus::Update);
    assert_eq!(ops.writes["file.txt"], "pre\nnew\npost\n");
}

#[test]
fn search_not_found_marks_partial_update() {
    let text = lines(&[
        "```text",
        "file.txt",
        "<<<<<<< SEARCH",
        "missing",
        "=======",
        "NEW",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("file.txt", "pre\nactual\npost\n")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert_eq!(statuses["file.txt"], FileApplyStatus::PartialUpdate);
    assert!(!ops.writes.contains_key("file.txt"));
    let err = errors
        .iter()
        .find(|e| e.msg.contains("Failed to locate exact SEARCH"))
        .expect("locate error");
    assert_eq!(err.filename.as_deref(), Some("file.txt"));
    let hint = err.hint.as_deref().unwrap_or("");
    assert!(hint.contains("Block not found"));
    assert!(hint.contains("missing"));
}

#[test]
fn delete_with_empty_replace() {
    let text = lines(&[
        "```text",
        "dead.txt",
        "<<<<<<< SEARCH",
        "some content",
        "=======",
        "",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("dead.txt", "some content\n")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(errors.is_empty());
    assert_eq!(statuses["dead.txt"], FileApplyStatus::Delete);
    assert_eq!(ops.deletes, vec!["dead.txt"]);
    assert!(ops.writes.is_empty());
}

#[test]
fn multiple_blocks_per_file_apply_in_order() {
    let text = lines(&[
        "```text",
        "file.txt",
        "<<<<<<< SEARCH",
        "old1",
        "=======",
        "new1",
        ">>>>>>> REPLACE",
        "```",
        "```text",
        "file.txt",
        "<<<<<<< SEARCH",
        "old2",
        "=======",
        "new2",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("file.txt", "pre\nold1\nmid\nold2\npost\n")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(errors.is_empty());
    assert_eq!(statuses["file.txt"], FileApplyStatus::Update);
    assert_eq!(ops.writes["file.txt"], "pre\nnew1\nmid\nnew2\npost\n");
    assert_eq!(ops.opened, vec!["file.txt"]);
}

#[test]
fn absolute_path_rejected() {
    let text = lines(&[
        "```text",
        "/abs.txt",
        "<<<<<<< SEARCH",
        "",
        "=======",
        "data",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(statuses.is_empty());
    assert!(has_error(&errors, "Path must be relative"));
    assert!(ops.writes.is_empty());
    assert!(ops.deletes.is_empty());
}

#[test]
fn read_error_short_circuits() {
    let text = lines(&[
        "```text",
        "missing.txt",
        "<<<<<<< SEARCH",
        "OLD",
        "=======",
        "NEW",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(statuses.is_empty());
    assert!(ops.writes.is_empty());
    assert!(errors
        .iter()
        .any(|e| e.msg.contains("Failed to read file") && e.filename.as_deref() == Some("missing.txt")));
}

#[test]
fn mixed_batch_with_read_failure_applies_nothing() {
    let text = lines(&[
        "```text",
        "new.txt",
        "<<<<<<< SEARCH",
        "",
        "=======",
        "hello",
        ">>>>>>> REPLACE",
        "```",
        "```text",
        "upd.txt",
        "<<<<<<< SEARCH",
        "X",
        "=======",
        "Y",
        ">>>>>>> REPLACE",
        "```",
        "```text",
        "missing.txt",
        "<<<<<<< SEARCH",
        "OLD",
        "=======",
        "NEW",
        ">>>>>>> REPLACE",
        "```",
        "```text",
        "gone.txt",
        "<<<<<<< SEARCH",
        "something",
        "=======",
        "",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("upd.txt", "A\nX\nB\n"), ("gone.txt", "something")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(statuses.is_empty());
    assert!(ops.writes.is_empty());
    assert!(ops.deletes.is_empty());
    assert!(errors
        .iter()
        .any(|e| e.filename.as_deref() == Some("missing.txt") && e.msg.contains("Failed to read file")));
}

#[test]
fn missing_search_marker_is_reported() {
    let text = lines(&[
        "```text",
        "file.txt",
        "not a marker",
        "=======",
        "x",
        ">>>>>>> REPLACE",
        "```",
    ]);
    let mut ops = RecordingOps::with_files(&[("file.txt", "a\n")]);

    let (statuses, errors) = process_search_replace_patch(&text, &mut ops);

    assert!(statuses.is_empty());
    assert!(has_error(&errors, "Missing <<<<<<< SEARCH marker"));
}
