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
fn suggest_returns_capped_descending_scores_and_never_writes() {
    let workspace = temp_dir("proctor-suggest");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Five available supervisors, differentiated only by preferred windows.
    let names = ["Ewan", "Fay", "Gil", "Hana", "Ivo"];
    let mut ids: Vec<String> = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let result = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "supervisors.create",
            json!({
                "displayName": name,
                "email": format!("{}@school.test", name.to_lowercase())
            }),
        );
        ids.push(
            result
                .get("supervisorId")
                .and_then(|v| v.as_str())
                .expect("supervisorId")
                .to_string(),
        );
    }
    // Hana declares two preferred windows, Fay one; the rest none.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "w1",
        "supervisors.windows.set",
        json!({
            "supervisorId": ids[3],
            "windows": [
                { "dayOfWeek": 0, "startMinute": 480, "endMinute": 720, "isPreferred": true },
                { "dayOfWeek": 2, "startMinute": 480, "endMinute": 720, "isPreferred": true }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "w2",
        "supervisors.windows.set",
        json!({
            "supervisorId": ids[1],
            "windows": [
                { "dayOfWeek": 1, "startMinute": 540, "endMinute": 660, "isPreferred": true },
                { "dayOfWeek": 4, "startMinute": 540, "endMinute": 660, "isPreferred": false }
            ]
        }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sessions.create",
        json!({
            "title": "Single seat",
            "startsAt": "2026-06-04T09:00:00Z",
            "endsAt": "2026-06-04T11:00:00Z",
            "requiredCount": 1
        }),
    );
    let session_id = created
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scheduling.suggest",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(result.get("requiredCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(result.get("availableCount").and_then(|v| v.as_i64()), Some(5));

    // requiredCount 1 with the default multiplier caps the list at 2.
    let suggestions = result
        .get("suggestions")
        .and_then(|v| v.as_array())
        .expect("suggestions array");
    assert_eq!(suggestions.len(), 2);

    let scores: Vec<i64> = suggestions
        .iter()
        .map(|s| s.get("score").and_then(|v| v.as_i64()).expect("score"))
        .collect();
    assert!(scores[0] >= scores[1], "scores must be descending: {:?}", scores);

    // Hana (two preferred windows) outranks Fay (one), who outranks the rest.
    assert_eq!(
        suggestions[0]
            .pointer("/supervisor/displayName")
            .and_then(|v| v.as_str()),
        Some("Hana")
    );
    assert_eq!(scores[0], 120);
    assert_eq!(
        suggestions[1]
            .pointer("/supervisor/displayName")
            .and_then(|v| v.as_str()),
        Some("Fay")
    );
    assert_eq!(scores[1], 110);

    // Read-only: no assignments and no load changes.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.list",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    let supervisors = request_ok(&mut stdin, &mut reader, "5", "supervisors.list", json!({}));
    for row in supervisors
        .get("supervisors")
        .and_then(|v| v.as_array())
        .expect("supervisors array")
    {
        assert_eq!(row.get("currentLoad").and_then(|v| v.as_i64()), Some(0));
    }

    // A flat load penalty of zero leaves only the preference bonus.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({
            "section": "scheduling",
            "patch": { "scoreBase": 50, "preferredBonus": 20 }
        }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scheduling.suggest",
        json!({ "sessionId": session_id }),
    );
    let top = result
        .pointer("/suggestions/0/score")
        .and_then(|v| v.as_i64());
    assert_eq!(top, Some(90));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
