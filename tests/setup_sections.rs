use rusqlite::Connection;
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

fn request_raw(
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
    let value = request_raw(stdin, reader, id, method, params);
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

#[test]
fn setup_defaults_updates_and_validation() {
    let workspace = temp_dir("reportd-setup-sections");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        defaults["grading"],
        json!({ "defaultSchemeId": null, "rankBy": "grandTotal" })
    );
    assert_eq!(
        defaults["reports"],
        json!({ "includeTe": true, "includeCe": true, "defaultDisplayMode": "both" })
    );
    assert_eq!(defaults["layout"]["safetyBufferPx"], 50);
    assert_eq!(defaults["layout"]["debounceMs"], 300);
    assert_eq!(defaults["layout"]["verticalPaddingPx"], 76);
    assert_eq!(defaults["layout"]["defaultOrientation"], "portrait");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "layout",
            "patch": { "safetyBufferPx": 80, "defaultOrientation": "Landscape" }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "rankBy": "percentage" } }),
    );
    let updated = request_ok(&mut stdin, &mut reader, "5", "setup.get", json!({}));
    assert_eq!(updated["layout"]["safetyBufferPx"], 80);
    assert_eq!(updated["layout"]["defaultOrientation"], "landscape");
    assert_eq!(updated["layout"]["debounceMs"], 300);
    assert_eq!(updated["grading"]["rankBy"], "percentage");

    let rejected = [
        json!({ "section": "layout", "patch": { "debounceMs": 6000 } }),
        json!({ "section": "layout", "patch": { "safetyBufferPx": "wide" } }),
        json!({ "section": "reports", "patch": { "defaultDisplayMode": "chart" } }),
        json!({ "section": "reports", "patch": { "colour": true } }),
        json!({ "section": "printer", "patch": {} }),
        json!({ "section": "grading", "patch": "rankBy" }),
    ];
    for (i, params) in rejected.into_iter().enumerate() {
        let resp = request_raw(&mut stdin, &mut reader, &format!("bad{}", i), "setup.update", params);
        assert_eq!(resp["error"]["code"], "bad_params", "case {}", i);
    }

    // Rejected patches leave saved values alone.
    let after = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(after, updated);

    // New reports pick up the saved defaults.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.compute",
        json!({
            "snapshot": {
                "class": { "id": "c", "gradeLevel": "6" },
                "exam": { "id": "e", "subjectConfigs": [{ "subjectId": "m", "maxTe": 50 }] },
                "students": [{ "id": "x" }]
            }
        }),
    );
    assert_eq!(report["options"]["rankBy"], "percentage");
    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "layout.plan",
        json!({ "reportId": report["reportId"], "estimate": true }),
    );
    assert_eq!(plan["options"]["orientation"], "landscape");
    assert_eq!(plan["options"]["safetyBufferPx"], 80.0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_saved_settings_fall_back_to_defaults() {
    let workspace = temp_dir("reportd-setup-malformed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    {
        let conn = Connection::open(workspace.join("reports.sqlite3")).expect("open workspace db");
        conn.execute(
            "INSERT INTO settings(key, value_json) VALUES('setup.layout', ?)",
            [json!({ "debounceMs": -5, "safetyBufferPx": 120, "legacy": 1 }).to_string()],
        )
        .expect("seed malformed setting");
    }

    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["layout"]["debounceMs"], 300);
    assert_eq!(setup["layout"]["safetyBufferPx"], 120);
    assert!(setup["layout"].get("legacy").is_none());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
