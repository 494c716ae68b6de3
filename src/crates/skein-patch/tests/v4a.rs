mod common;

use common::{has_error, RecordingOps};
use skein_patch::{process_v4a_patch, FileApplyStatus};

fn lines(parts: &[&str]) -> String {
    parts.join("\n")
}

#[test]
fn end_to_end_valid_patch_with_noise_multiple_files() {
    let patch_text = lines(&[
        "Noise preface that should be ignored.",
        "*** Begin Patch",
        "*** Update File: src/foo.py",
        "@@ class Foo",
        "@@     def bar(self):",
        " ctx1",
        " ctx2",
        " ctx3",
        "- old_line",
        "+ new_line",
        " ctxA",
        " ctxB",
        " ctxC",
        "@@",
        " p1",
        " p2",
        " p3",
        "- remove_this",
        "+ add_that",
        " s1",
        " s2",
        " s3",
        "*** Add File: src/new_file.txt",
        "+ newly added line 1",
        "+ newly added line 2",
        "*** Delete File: src/obsolete.txt",
        "*** End Patch",
        "Noise footer that must be ignored.",
    ]);
    let mut ops = RecordingOps::with_files(&[(
        "src/foo.py",
        "ctx1\nctx2\nctx3\n old_line\nctxA\nctxB\nctxC\nmid\np1\np2\np3\n remove_this\ns1\ns2\ns3\n",
    )]);

    let (statuses, errs) = process_v4a_patch(&patch_text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert_eq!(ops.opened, vec!["src/foo.py"]);
    assert_eq!(
        ops.writes["src/foo.py"],
        "ctx1\nctx2\nctx3\n new_line\nctxA\nctxB\nctxC\nmid\np1\np2\np3\n add_that\ns1\ns2\ns3\n"
    );
    assert_eq!(
        ops.writes["src/new_file.txt"],
        " newly added line 1\n newly added line 2"
    );
    assert_eq!(ops.deletes, vec!["src/obsolete.txt"]);
    assert_eq!(statuses["src/foo.py"], FileApplyStatus::Update);
    assert_eq!(statuses["src/new_file.txt"], FileApplyStatus::Create);
    assert_eq!(statuses["src/obsolete.txt"], FileApplyStatus::Delete);
}

#[test]
fn multiple_update_blocks_are_merged() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/dup.py",
        "@@",
        "- a",
        "+ b",
        "*** Update File: src/dup.py",
        "@@",
        "- c",
        "+ d",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/dup.py", " a\n c\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.opened, vec!["src/dup.py"]);
    assert_eq!(ops.writes["src/dup.py"], " b\n d\n");
    assert!(ops.deletes.is_empty());
    assert_eq!(statuses["src/dup.py"], FileApplyStatus::Update);
}

#[test]
fn delete_and_create_is_a_replace() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Delete File: src/a.txt",
        "*** Add File: src/a.txt",
        "+ new content",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/a.txt", "old content")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert!(ops.opened.is_empty());
    assert_eq!(ops.writes["src/a.txt"], " new content");
    assert!(ops.deletes.is_empty());
    assert_eq!(statuses["src/a.txt"], FileApplyStatus::Create);
}

#[test]
fn create_and_update_is_error() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/a.txt",
        "+ new content",
        "*** Update File: src/a.txt",
        "@@",
        "- a",
        "+ b",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/a.txt", "a")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Cannot mix Update and Add sections"));
    assert!(ops.writes.is_empty());
    assert!(ops.deletes.is_empty());
    assert!(statuses.is_empty());
}

#[test]
fn create_and_delete_is_error() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/a.txt",
        "+ new content",
        "*** Delete File: src/a.txt",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Add must follow Delete for"));
    assert!(ops.writes.is_empty());
    assert!(statuses.is_empty());
}

#[test]
fn absolute_path_is_error() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: /abs/path.py",
        "@@",
        "- a",
        "+ b",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Path must be relative"));
    assert!(ops.writes.is_empty());
    assert!(statuses.is_empty());
}

#[test]
fn delete_section_must_not_have_content() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Delete File: data.bin",
        "- should not be here",
        "@@ anchor",
        "+ nor this",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Delete file section"));
    assert!(statuses.is_empty());
    assert!(ops.writes.is_empty());
    assert!(ops.deletes.is_empty());
}

#[test]
fn missing_envelope_markers() {
    let mut ops = RecordingOps::default();
    let (_, errs) = process_v4a_patch("*** End Patch", &mut ops);
    assert!(has_error(&errs, "Missing *** Begin Patch"));

    let mut ops = RecordingOps::default();
    let (_, errs) = process_v4a_patch("*** Begin Patch", &mut ops);
    assert!(has_error(&errs, "Missing *** End Patch"));

    let multi = lines(&[
        "x",
        "*** Begin Patch",
        "*** Update File: a.txt",
        "@@",
        "- a",
        "+ b",
        "*** Begin Patch",
        "*** End Patch",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("a.txt", " a\n")]);
    let (_, errs) = process_v4a_patch(&multi, &mut ops);
    assert!(has_error(&errs, "Multiple *** Begin Patch"));
}

#[test]
fn unmatched_context_reports_locate_failure() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/x.py",
        " ctx1",
        " ctx2",
        " ctx3",
        "- a",
        "+ b",
        " ctxA",
        " ctxB",
        " ctxC",
        "- c",
        "+ d",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/x.py", "")]);

    let (_, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Failed to locate change block"));
}

#[test]
fn reads_update_targets_only() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: exists.txt",
        "@@",
        "- a",
        "+ b",
        "*** Add File: added.txt",
        "+ created",
        "*** Delete File: missing.txt",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("exists.txt", " a\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.opened, vec!["exists.txt"]);
    assert_eq!(ops.writes["exists.txt"], " b\n");
    assert_eq!(ops.writes["added.txt"], " created");
    assert_eq!(ops.deletes, vec!["missing.txt"]);
    assert_eq!(statuses["exists.txt"], FileApplyStatus::Update);
    assert_eq!(statuses["added.txt"], FileApplyStatus::Create);
    assert_eq!(statuses["missing.txt"], FileApplyStatus::Delete);
}

#[test]
fn add_file_rejects_context_mixed_with_additions() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/new_module.py",
        " # pre1",
        " # pre2",
        " # pre3",
        "+ line1",
        "+ line2",
        " # post1",
        " # post2",
        " # post3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "must not contain context"));
    assert!(statuses.is_empty());
    assert!(ops.writes.is_empty());
}

#[test]
fn add_file_only_additions_ok() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/only_adds.py",
        "+ line1",
        "+ line2",
        "+ line3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.writes["src/only_adds.py"], " line1\n line2\n line3");
    assert_eq!(statuses["src/only_adds.py"], FileApplyStatus::Create);
}

#[test]
fn multi_file_apply_calls_io() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: f.txt",
        " pre",
        "- old",
        "+ new",
        " post",
        "*** Add File: new.txt",
        "+ hello",
        "*** Delete File: gone.txt",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("f.txt", "pre\n old\npost\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.opened, vec!["f.txt"]);
    assert_eq!(ops.writes["f.txt"], "pre\n new\npost\n");
    assert_eq!(ops.writes["new.txt"], " hello");
    assert_eq!(ops.deletes, vec!["gone.txt"]);
    assert_eq!(statuses["f.txt"], FileApplyStatus::Update);
    assert_eq!(statuses["new.txt"], FileApplyStatus::Create);
    assert_eq!(statuses["gone.txt"], FileApplyStatus::Delete);
}

#[test]
fn write_and_delete_errors_are_appended() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: f.txt",
        " pre",
        "- old",
        "+ new",
        " post",
        "*** Add File: new.txt",
        "+ hello",
        "*** Delete File: gone.txt",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("f.txt", "pre\n old\npost\n")]);
    ops.fail_writes.insert("new.txt".to_string());
    ops.fail_deletes.insert("gone.txt".to_string());

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert_eq!(errs.len(), 2);
    assert!(errs
        .iter()
        .any(|e| e.msg.contains("Failed to apply change to file: new.txt")
            && e.hint.as_deref().unwrap_or("").contains("disk full")));
    assert!(errs
        .iter()
        .any(|e| e.msg.contains("Failed to apply change to file: gone.txt")
            && e.hint.as_deref().unwrap_or("").contains("read-only filesystem")));
    assert_eq!(ops.writes["f.txt"], "pre\n new\npost\n");
    assert_eq!(statuses["f.txt"], FileApplyStatus::Update);
    assert_eq!(statuses["new.txt"], FileApplyStatus::Create);
    assert_eq!(statuses["gone.txt"], FileApplyStatus::Delete);
}

#[test]
fn partial_apply_collects_errors() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: f.txt",
        " pre",
        "- OLDX",
        "+ NEWX",
        " post",
        "@@",
        " x",
        " y",
        " z",
        "- a",
        "+ b",
        " u",
        " v",
        " w",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("f.txt", "pre\nOLD\npost\nmid\nx\ny\nz\n a\nu\nv\nw\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert_eq!(errs.len(), 1);
    assert!(errs[0].msg.contains("Failed to locate change block"));
    assert_eq!(ops.writes["f.txt"], "pre\nOLD\npost\nmid\nx\ny\nz\n b\nu\nv\nw\n");
    assert_eq!(statuses["f.txt"], FileApplyStatus::PartialUpdate);
}

#[test]
fn anchors_narrow_multiple_chunks() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/multi.py",
        "@@ class A",
        " a1",
        " a2",
        " a3",
        "- X",
        "+ Y",
        " a4",
        " a5",
        " a6",
        "@@ class B",
        " b1",
        " b2",
        " b3",
        "- P",
        "+ Q",
        " b4",
        " b5",
        " b6",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[(
        "src/multi.py",
        "a1\na2\na3\n X\na4\na5\na6\nmid\nb1\nb2\nb3\n P\nb4\nb5\nb6\n",
    )]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(
        ops.writes["src/multi.py"],
        "a1\na2\na3\n Y\na4\na5\na6\nmid\nb1\nb2\nb3\n Q\nb4\nb5\nb6\n"
    );
    assert_eq!(statuses["src/multi.py"], FileApplyStatus::Update);
}

#[test]
fn unmatched_block_hint_quotes_the_block() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/t.py",
        " ctx1",
        " ctx2",
        " ctx3",
        "- old",
        "+ new",
        " ctxA",
        " ctxB",
        " ctxC",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("src/t.py", "ctx1\nctx2\nctx3\nNOT_OLD\nctxA\nctxB\nctxC\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(statuses.is_empty());
    assert!(ops.writes.is_empty());
    assert_eq!(errs.len(), 1);
    assert!(errs[0].msg.contains("Failed to locate change block"));
    let hint = errs[0].hint.as_deref().unwrap_or("");
    assert!(hint.contains("Change block not found. Here is the block you provided:"));
    assert!(hint.contains(" ctx1"));
    assert!(hint.contains("- old"));
    assert!(hint.contains("+ new"));
    assert!(hint.contains(" ctxC"));
}

#[test]
fn context_normalization_with_extra_blank_lines() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/ctx_norm_apply.py",
        " header1",
        "",
        "- old",
        "+ new",
        " footer1",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("src/ctx_norm_apply.py", "header1\n\n\n old\nfooter1\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert_eq!(
        ops.writes["src/ctx_norm_apply.py"],
        "header1\n\n\n new\nfooter1\n"
    );
    assert_eq!(statuses["src/ctx_norm_apply.py"], FileApplyStatus::Update);
}

#[test]
fn handles_missing_blank_line_in_context() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/missing_blank.py",
        " header1",
        "- old",
        "+ new",
        " footer1",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("src/missing_blank.py", "header1\n\n old\nfooter1\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert_eq!(
        ops.writes["src/missing_blank.py"],
        "header1\n\n new\nfooter1\n"
    );
    assert_eq!(statuses["src/missing_blank.py"], FileApplyStatus::Update);
}

#[test]
fn add_file_without_plus_lines_treated_as_content() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/raw_add.txt",
        " line1",
        " line2",
        " line3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.writes["src/raw_add.txt"], "line1\nline2\nline3");
    assert_eq!(statuses["src/raw_add.txt"], FileApplyStatus::Create);
}

#[test]
fn add_file_context_only_block_keeps_blank_lines() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Add File: src/raw_and_blank.txt",
        " line1",
        "",
        " line3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::default();

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(statuses["src/raw_and_blank.txt"], FileApplyStatus::Create);
    assert_eq!(ops.writes["src/raw_and_blank.txt"], "line1\n\nline3");
}

#[test]
fn update_without_mods_reports_error() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/empty.py",
        "@@",
        " ctx1",
        " ctx2",
        " ctx3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/empty.py", "ctx1\nctx2\nctx3\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(ops.writes.is_empty());
    assert!(statuses.is_empty());
    assert_eq!(errs.len(), 1);
    assert!(errs[0]
        .msg
        .contains("No change lines (+/-) provided for file: src/empty.py"));
    assert_eq!(errs[0].filename.as_deref(), Some("src/empty.py"));
}

#[test]
fn interleaved_additions_and_deletions_in_single_chunk() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/inter.txt",
        " A",
        "- B",
        "+ C",
        " D",
        "- E",
        "+ F",
        " G",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/inter.txt", "A\n B\nD\n E\nG\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert!(ops.deletes.is_empty());
    assert_eq!(ops.writes["src/inter.txt"], "A\n C\nD\n F\nG\n");
    assert_eq!(statuses["src/inter.txt"], FileApplyStatus::Update);
}

#[test]
fn out_of_order_chunks_partial_update() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/order.txt",
        " L3",
        "- B",
        "+ Y",
        " L5",
        "@@",
        " L1",
        "- A",
        "+ X",
        " L3",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/order.txt", "L1\n A\nL3\n B\nL5\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert_eq!(ops.opened, vec!["src/order.txt"]);
    assert!(has_error(&errs, "Out-of-order change block"));
    assert_eq!(ops.writes["src/order.txt"], "L1\n A\nL3\n Y\nL5\n");
    assert_eq!(statuses["src/order.txt"], FileApplyStatus::PartialUpdate);
}

#[test]
fn update_with_move_renames_file() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/a.txt",
        "*** Move to: src/renamed.txt",
        " pre",
        "- old",
        "+ new",
        " post",
        "*** End Patch",
    ]);
    let mut ops = RecordingOps::with_files(&[("src/a.txt", "pre\n old\npost\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty());
    assert_eq!(ops.opened, vec!["src/a.txt"]);
    assert!(ops.writes.contains_key("src/renamed.txt"));
    assert!(!ops.writes.contains_key("src/a.txt"));
    assert_eq!(ops.deletes, vec!["src/a.txt"]);
    assert_eq!(ops.writes["src/renamed.txt"], "pre\n new\npost\n");
    assert_eq!(statuses["src/a.txt"], FileApplyStatus::Update);
}

#[test]
fn interleaved_replace_and_delete_in_one_block() {
    let patch_text = lines(&[
        "",
        "*** Begin Patch",
        "*** Update File: src/ui/terminal/app.py",
        "@@",
        " async def run_terminal(project: Project) -> None:",
        "-    # Backward-compatible wrapper",
        "-    app = TerminalApp(project)",
        "-    await app.run()",
        "+    # Thin wrapper: defer to TerminalApp for all terminal behavior.",
        "+    app = TerminalApp(project)",
        "+    await app.run()",
        "-    try:",
        "-        hist_path = data_dir / \"terminal_history\"",
        "-        session = PromptSession(history=FileHistory(str(hist_path)))",
        "-    except Exception:",
        "-        session = PromptSession()",
        "+",
        "*** End Patch",
        "    ",
    ]);

    let initial_content = lines(&[
        "",
        "async def run_terminal(project: Project) -> None:",
        "    # Backward-compatible wrapper",
        "    app = TerminalApp(project)",
        "    await app.run()",
        "    try:",
        "        hist_path = data_dir / \"terminal_history\"",
        "        session = PromptSession(history=FileHistory(str(hist_path)))",
        "    except Exception:",
        "        session = PromptSession()",
        "",
        "@click.command()",
        "",
    ]);

    let expected = lines(&[
        "",
        "async def run_terminal(project: Project) -> None:",
        "    # Thin wrapper: defer to TerminalApp for all terminal behavior.",
        "    app = TerminalApp(project)",
        "    await app.run()",
        "",
        "",
        "@click.command()",
        "",
    ]);

    let mut ops = RecordingOps::with_files(&[("src/ui/terminal/app.py", &initial_content)]);

    let (statuses, errs) = process_v4a_patch(&patch_text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert!(ops.deletes.is_empty());
    assert_eq!(ops.writes["src/ui/terminal/app.py"], expected);
    assert_eq!(statuses["src/ui/terminal/app.py"], FileApplyStatus::Update);
}

#[test]
fn duplicate_identical_blocks_apply_to_both_occurrences() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/llm/mod.rs",
        "@@",
        " # Test",
        "-# Foobar",
        "+# Bazz",
        "@@",
        " # Test",
        "-# Foobar",
        "+# Bazz",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("src/llm/mod.rs", "# Test\n# Foobar\n# Test\n# Foobar\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert_eq!(
        ops.writes["src/llm/mod.rs"],
        "# Test\n# Bazz\n# Test\n# Bazz\n"
    );
    assert_eq!(statuses["src/llm/mod.rs"], FileApplyStatus::Update);
}

#[test]
fn triple_identical_blocks_apply_to_all_occurrences() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/repeated.py",
        "@@",
        "-tc.status = ToolCallStatus.rejected",
        "+tc.status = v_state.ToolCallStatus.rejected",
        "@@",
        "-tc.status = ToolCallStatus.rejected",
        "+tc.status = v_state.ToolCallStatus.rejected",
        "@@",
        "-tc.status = ToolCallStatus.rejected",
        "+tc.status = v_state.ToolCallStatus.rejected",
        "*** End Patch",
    ]);
    let initial = "tc.status = ToolCallStatus.rejected\n".repeat(3);
    let mut ops = RecordingOps::with_files(&[("src/repeated.py", &initial)]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    assert_eq!(
        ops.writes["src/repeated.py"],
        "tc.status = v_state.ToolCallStatus.rejected\n".repeat(3)
    );
    assert_eq!(statuses["src/repeated.py"], FileApplyStatus::Update);
}

#[test]
fn delete_then_restore_round_trips_content() {
    let original = "alpha\nbeta\ngamma\n";
    let mut ops = RecordingOps::with_files(&[("f.txt", original)]);

    let remove = lines(&[
        "*** Begin Patch",
        "*** Update File: f.txt",
        " alpha",
        "- beta",
        " gamma",
        "*** End Patch",
    ]);
    let (_, errs) = process_v4a_patch(&remove, &mut ops);
    assert!(errs.is_empty());
    assert_eq!(ops.files["f.txt"], "alpha\ngamma\n");

    let restore = lines(&[
        "*** Begin Patch",
        "*** Update File: f.txt",
        " alpha",
        "+ beta",
        " gamma",
        "*** End Patch",
    ]);
    let (_, errs) = process_v4a_patch(&restore, &mut ops);
    assert!(errs.is_empty());
    assert_eq!(ops.files["f.txt"], original);
}

#[test]
fn overlapping_chunks_abort_the_file() {
    let text = lines(&[
        "*** Begin Patch",
        "*** Update File: src/overlap.txt",
        " one",
        " two",
        "- three",
        "+ THREE",
        " four",
        "@@",
        " two",
        "- three",
        "+ 333",
        " four",
        " five",
        "*** End Patch",
    ]);
    let mut ops =
        RecordingOps::with_files(&[("src/overlap.txt", "one\ntwo\n three\nfour\nfive\n")]);

    let (statuses, errs) = process_v4a_patch(&text, &mut ops);

    assert!(has_error(&errs, "Overlapping change blocks detected"));
    let overlap = errs
        .iter()
        .find(|e| e.msg.contains("Overlapping change blocks"))
        .unwrap();
    let hint = overlap.hint.as_deref().unwrap_or("");
    assert!(hint.contains("First block excerpt:"));
    assert!(hint.contains("Second block excerpt:"));
    assert!(!ops.writes.contains_key("src/overlap.txt"));
    assert!(!statuses.contains_key("src/overlap.txt"));
}
