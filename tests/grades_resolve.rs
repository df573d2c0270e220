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

fn resolve(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, "grades.resolve", params);
    assert_eq!(value["ok"], true, "grades.resolve failed: {}", value);
    value["result"].clone()
}

#[test]
fn fixed_tiers_and_inline_schemes() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let r = resolve(&mut stdin, &mut reader, "1", json!({ "percentage": 91, "gradeLevel": "10" }));
    assert_eq!(r["grade"], "A+");
    assert_eq!(r["tier"], "secondary");
    assert!(r["schemeId"].is_null());

    let r = resolve(&mut stdin, &mut reader, "2", json!({ "percentage": 81, "gradeLevel": "7" }));
    assert_eq!(r["grade"], "A");
    assert_eq!(r["tier"], "upperPrimary");
    assert_eq!(r["labels"], json!(["A", "B", "C", "D", "E"]));

    let schemes = json!([{
        "id": "lp",
        "applicableClasses": ["3"],
        "boundaries": [{ "grade": "A", "minPercent": 80 }, { "grade": "B", "minPercent": 50 }]
    }]);
    let r = resolve(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "percentage": 65, "gradeLevel": "3", "schemes": schemes.clone() }),
    );
    assert_eq!(r["grade"], "B");
    assert_eq!(r["tier"], "scheme");
    assert_eq!(r["schemeId"], "lp");

    let r = resolve(
        &mut stdin,
        &mut reader,
        "4",
        json!({ "percentage": 10, "gradeLevel": "3", "schemes": schemes }),
    );
    assert_eq!(r["grade"], "F");

    // NaN has no JSON form; null stands in for it.
    let r = resolve(&mut stdin, &mut reader, "5", json!({ "percentage": null, "gradeLevel": "10" }));
    assert_eq!(r["grade"], "-");

    let r = resolve(&mut stdin, &mut reader, "6", json!({ "percentage": 65, "gradeLevel": "3" }));
    assert_eq!(r["grade"], "-");
    assert!(r["tier"].is_null());
    assert_eq!(r["labels"], json!([]));

    let bad = request_raw(
        &mut stdin,
        &mut reader,
        "7",
        "grades.resolve",
        json!({ "percentage": "high", "gradeLevel": "3" }),
    );
    assert_eq!(bad["error"]["code"], "bad_params");
    let missing_level = request_raw(
        &mut stdin,
        &mut reader,
        "8",
        "grades.resolve",
        json!({ "percentage": 50 }),
    );
    assert_eq!(missing_level["error"]["code"], "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn workspace_schemes_and_explicit_scheme_id() {
    let workspace = temp_dir("reportd-grades-resolve");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let selected = request_raw(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);
    {
        let conn = Connection::open(workspace.join("reports.sqlite3")).expect("open workspace db");
        conn.execute_batch(
            "INSERT INTO grade_schemes(id, name, applicable_classes, sort_order) VALUES
                ('kg', 'Kindergarten', 'LKG, UKG', 1),
                ('lp', 'Lower primary', '[\"1\",\"2\",\"3\",\"4\"]', 2);
             INSERT INTO grade_boundaries(scheme_id, grade, min_percent) VALUES
                ('kg', 'Star', 50),
                ('lp', 'A', 80),
                ('lp', 'B', 50);",
        )
        .expect("seed schemes");
    }

    let r = resolve(&mut stdin, &mut reader, "2", json!({ "percentage": 85, "gradeLevel": "2" }));
    assert_eq!(r["schemeId"], "lp");
    assert_eq!(r["grade"], "A");

    let r = resolve(&mut stdin, &mut reader, "3", json!({ "percentage": 70, "gradeLevel": "ukg" }));
    assert_eq!(r["schemeId"], "kg");
    assert_eq!(r["grade"], "Star");

    // Fixed tiers still win for classes 5 to 10.
    let r = resolve(
        &mut stdin,
        &mut reader,
        "4",
        json!({ "percentage": 85, "gradeLevel": "9", "schemeId": "lp" }),
    );
    assert_eq!(r["tier"], "secondary");
    assert_eq!(r["grade"], "A");

    let r = resolve(
        &mut stdin,
        &mut reader,
        "5",
        json!({ "percentage": 60, "gradeLevel": "2", "schemeId": "kg" }),
    );
    assert_eq!(r["grade"], "Star");

    let unknown = request_raw(
        &mut stdin,
        &mut reader,
        "6",
        "grades.resolve",
        json!({ "percentage": 60, "gradeLevel": "2", "schemeId": "nope" }),
    );
    assert_eq!(unknown["error"]["code"], "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
