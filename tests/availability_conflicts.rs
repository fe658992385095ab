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
    let exe = env!("CARGO_BIN_EXE_proctord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn proctord");
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
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn check(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    supervisor_id: &str,
    starts_at: &str,
    ends_at: &str,
) -> bool {
    let result = request_ok(
        stdin,
        reader,
        id,
        "scheduling.checkAvailability",
        json!({
            "supervisorId": supervisor_id,
            "startsAt": starts_at,
            "endsAt": ends_at
        }),
    );
    result
        .get("available")
        .and_then(|v| v.as_bool())
        .expect("available")
}

#[test]
fn confirmed_assignment_blocks_overlapping_windows_only() {
    let workspace = temp_dir("proctor-availability");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "supervisors.create",
        json!({ "displayName": "Dana", "email": "dana@school.test" }),
    );
    let dana = result
        .get("supervisorId")
        .and_then(|v| v.as_str())
        .expect("supervisorId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sessions.create",
        json!({
            "title": "Morning sitting",
            "startsAt": "2026-06-03T10:00:00Z",
            "endsAt": "2026-06-03T12:00:00Z",
            "requiredCount": 1
        }),
    );
    let session_id = created
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scheduling.autoAssign",
        json!({ "sessionId": session_id }),
    );
    let assignment_id = assigned
        .pointer("/assignments/0/id")
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.confirm",
        json!({ "assignmentId": assignment_id }),
    );

    // Overlapping request is blocked in both directions of the overlap.
    assert!(!check(
        &mut stdin,
        &mut reader,
        "6",
        &dana,
        "2026-06-03T11:00:00Z",
        "2026-06-03T13:00:00Z"
    ));
    assert!(!check(
        &mut stdin,
        &mut reader,
        "7",
        &dana,
        "2026-06-03T09:00:00Z",
        "2026-06-03T10:30:00Z"
    ));

    // Half-open semantics: a window starting exactly at the booked end
    // (or ending at the booked start) is free.
    assert!(check(
        &mut stdin,
        &mut reader,
        "8",
        &dana,
        "2026-06-03T12:00:00Z",
        "2026-06-03T14:00:00Z"
    ));
    assert!(check(
        &mut stdin,
        &mut reader,
        "9",
        &dana,
        "2026-06-03T08:00:00Z",
        "2026-06-03T10:00:00Z"
    ));

    // Zero-length probes never conflict.
    assert!(check(
        &mut stdin,
        &mut reader,
        "10",
        &dana,
        "2026-06-03T11:00:00Z",
        "2026-06-03T11:00:00Z"
    ));

    // Declining the assignment frees the window again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "assignments.decline",
        json!({ "assignmentId": assignment_id }),
    );
    assert!(check(
        &mut stdin,
        &mut reader,
        "12",
        &dana,
        "2026-06-03T11:00:00Z",
        "2026-06-03T13:00:00Z"
    ));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
