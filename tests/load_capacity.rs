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

#[test]
fn supervisors_at_capacity_are_not_candidates() {
    let workspace = temp_dir("proctor-capacity");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let supervisor_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "supervisors.create",
        json!({
            "displayName": "Uma",
            "email": "uma@school.test",
            "maxLoad": 1
        }),
    )
    .get("supervisorId")
    .and_then(|v| v.as_str())
    .expect("supervisorId")
    .to_string();

    // Two sittings on different days, so only capacity can rule Uma out.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sessions.create",
        json!({
            "title": "Monday sitting",
            "startsAt": "2026-06-08T09:00:00Z",
            "endsAt": "2026-06-08T11:00:00Z",
            "requiredCount": 1
        }),
    )
    .get("sessionId")
    .and_then(|v| v.as_str())
    .expect("sessionId")
    .to_string();
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.create",
        json!({
            "title": "Tuesday sitting",
            "startsAt": "2026-06-09T09:00:00Z",
            "endsAt": "2026-06-09T11:00:00Z",
            "requiredCount": 1
        }),
    )
    .get("sessionId")
    .and_then(|v| v.as_str())
    .expect("sessionId")
    .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scheduling.autoAssign",
        json!({ "sessionId": first }),
    );
    assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(true));

    // At maxLoad 1 with one committed assignment, Uma is out of the pool.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scheduling.autoAssign",
        json!({ "sessionId": second }),
    );
    assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        result.get("reason").and_then(|v| v.as_str()),
        Some("insufficient_candidates")
    );
    assert_eq!(result.get("shortfall").and_then(|v| v.as_i64()), Some(1));

    // Raising the ceiling brings her back.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "supervisors.update",
        json!({ "supervisorId": supervisor_id, "patch": { "maxLoad": 2 } }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scheduling.autoAssign",
        json!({ "sessionId": second }),
    );
    assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unavailable_status_excludes_from_selection() {
    let workspace = temp_dir("proctor-status");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let supervisor_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "supervisors.create",
        json!({ "displayName": "Vera", "email": "vera@school.test" }),
    )
    .get("supervisorId")
    .and_then(|v| v.as_str())
    .expect("supervisorId")
    .to_string();
    let session_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sessions.create",
        json!({
            "title": "Evening sitting",
            "startsAt": "2026-06-10T17:00:00Z",
            "endsAt": "2026-06-10T19:00:00Z",
            "requiredCount": 1
        }),
    )
    .get("sessionId")
    .and_then(|v| v.as_str())
    .expect("sessionId")
    .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "supervisors.setStatus",
        json!({ "supervisorId": supervisor_id, "status": "on_leave" }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scheduling.autoAssign",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(result.get("shortfall").and_then(|v| v.as_i64()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "supervisors.setStatus",
        json!({ "supervisorId": supervisor_id, "status": "available" }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scheduling.autoAssign",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
