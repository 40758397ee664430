use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_selectiond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn selectiond");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}
fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn unknown_kind_fails_recompute_and_leaves_marks_untouched() {
    let workspace = temp_dir("selectiond-integrity-kind");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "g", "name": "G", "kind": "group", "policy": "best" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "q", "parentId": "g", "name": "Q", "kind": "test", "policy": "best" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "terms.upsert",
        json!({ "term": { "id": "T1", "courseItemId": "g", "activeFrom": "2025-03-01T08:00:00Z" } }),
    );
    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.record",
        json!({
            "courseId": "c1",
            "result": { "id": "r1", "studentId": "s1", "courseItemId": "q", "termId": "T1", "points": 7, "createdAt": "2025-03-02T08:00:00Z" }
        }),
    );
    assert_eq!(recorded.get("selected").and_then(|v| v.as_bool()), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "q", "parentId": "g", "name": "Q", "kind": "survey", "policy": "best" } }),
    );
    let failed = request(
        &mut stdin,
        &mut reader,
        "7",
        "selection.recompute",
        json!({ "courseId": "c1", "rootItemId": "g", "studentId": "s1" }),
    );
    assert_eq!(error_code(&failed), Some("configuration_integrity"));
    assert_eq!(
        failed.pointer("/error/details/itemId").and_then(|v| v.as_str()),
        Some("q")
    );

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.record",
        json!({
            "courseId": "c1",
            "result": { "id": "r2", "studentId": "s1", "courseItemId": "q", "termId": "T1", "points": 9 }
        }),
    );
    assert_eq!(stored.get("resultId").and_then(|v| v.as_str()), Some("r2"));
    assert!(stored.get("selection").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        stored.pointer("/selectionError/code").and_then(|v| v.as_str()),
        Some("configuration_integrity")
    );
    assert_eq!(
        stored.pointer("/selectionError/details/itemId").and_then(|v| v.as_str()),
        Some("q")
    );

    let corrected = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.updatePoints",
        json!({ "resultId": "r1", "points": 3 }),
    );
    assert_eq!(
        corrected.pointer("/selectionError/code").and_then(|v| v.as_str()),
        Some("configuration_integrity")
    );
    assert_eq!(corrected.get("selected").and_then(|v| v.as_bool()), Some(true));

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "9b",
        "results.list",
        json!({ "courseId": "c1", "studentId": "s1" }),
    );
    let results = list.get("results").and_then(|v| v.as_array()).expect("results");
    assert_eq!(results.len(), 2, "a failed recompute keeps the stored attempt");
    let by_id = |id: &str| {
        results
            .iter()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id))
            .cloned()
            .expect("stored result")
    };
    let r1 = by_id("r1");
    assert_eq!(r1.get("points").and_then(|v| v.as_f64()), Some(3.0));
    assert_eq!(r1.get("selected").and_then(|v| v.as_bool()), Some(true));
    let r2 = by_id("r2");
    assert_eq!(r2.get("selected").and_then(|v| v.as_bool()), Some(false));

    let tree = request(
        &mut stdin,
        &mut reader,
        "10",
        "items.tree",
        json!({ "courseId": "c1", "rootItemId": "g" }),
    );
    assert_eq!(error_code(&tree), Some("configuration_integrity"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_item_definitions_are_reported() {
    let workspace = temp_dir("selectiond-integrity-defs");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "median", "name": "M", "kind": "test", "policy": "median" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "leafy", "name": "L", "kind": "activity", "policy": "best", "chooseMin": 1 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "range", "name": "R", "kind": "group", "policy": "best", "chooseMin": 3, "chooseMax": 1 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "items.upsert",
        json!({ "courseId": "c1", "item": { "id": "ok", "name": "Fine", "kind": "test", "policy": "last" } }),
    );

    for (n, root) in ["median", "leafy", "range"].iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("check-{}", n),
            "selection.recompute",
            json!({ "courseId": "c1", "rootItemId": root, "studentId": "s1" }),
        );
        assert_eq!(error_code(&resp), Some("configuration_integrity"), "root {}", root);
        assert_eq!(
            resp.pointer("/error/details/itemId").and_then(|v| v.as_str()),
            Some(*root)
        );
    }

    // A broken sibling does not block an unrelated root.
    let fine = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "selection.recompute",
        json!({ "courseId": "c1", "rootItemId": "ok", "studentId": "s1" }),
    );
    assert_eq!(fine.get("rootItemId").and_then(|v| v.as_str()), Some("ok"));

    let course = request(
        &mut stdin,
        &mut reader,
        "7",
        "selection.recomputeCourse",
        json!({ "courseId": "c1", "studentId": "s1" }),
    );
    assert_eq!(error_code(&course), Some("configuration_integrity"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "selection.recompute",
        json!({ "courseId": "c1", "rootItemId": "ghost", "studentId": "s1" }),
    );
    assert_eq!(error_code(&missing), Some("tree_load_failed"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn requests_before_workspace_select_are_refused() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "selection.recompute",
        json!({ "courseId": "c1", "rootItemId": "g", "studentId": "s1" }),
    );
    assert_eq!(error_code(&resp), Some("no_workspace"));
    drop(stdin);
    let _ = child.wait();
}
