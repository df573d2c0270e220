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
    let exe = env!("CARGO_BIN_EXE_reportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reportd");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("reportd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], true);
    assert!(health["result"]["workspacePath"].is_null());

    // Workspace-bound methods refuse to run before a workspace is chosen.
    let setup_before = request(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(error_code(&setup_before), Some("no_workspace"));
    let exam_before = request(
        &mut stdin,
        &mut reader,
        "3",
        "reports.compute",
        json!({ "examId": "e1" }),
    );
    assert_eq!(error_code(&exam_before), Some("no_workspace"));

    let selected = request(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);
    assert!(workspace.join("reports.sqlite3").is_file());

    let calls = [
        ("setup.get", json!({})),
        ("grades.resolve", json!({ "percentage": 91, "gradeLevel": "10" })),
        ("reports.compute", json!({ "examId": "missing" })),
        ("reports.open", json!({ "reportId": "missing" })),
        ("layout.plan", json!({ "reportId": "missing", "estimate": true })),
        ("layout.request", json!({ "reportId": "missing" })),
        ("layout.commit", json!({ "generation": 1, "estimate": true })),
        ("layout.current", json!({})),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let _ = request(&mut stdin, &mut reader, &format!("m{}", i), method, params);
    }

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "reports.compute",
        json!({ "examId": "missing" }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    let payload = json!({ "id": "6", "method": "reports.nope", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    writeln!(stdin, "this is not json").expect("write junk");
    stdin.flush().expect("flush junk");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let junk: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(error_code(&junk), Some("bad_json"));

    // The loop survives malformed input.
    let health = request(&mut stdin, &mut reader, "7", "health", json!({}));
    assert_eq!(
        health["result"]["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
