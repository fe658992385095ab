use crate::assign::TimeWindow;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn db(code: &'static str, e: impl ToString) -> Self {
        Self {
            code,
            message: e.to_string(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn exams_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let supervisors_per_session = match params.get("supervisorsPerSession") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let n = v
                .as_i64()
                .filter(|n| *n >= 1)
                .ok_or_else(|| HandlerErr::bad_params("supervisorsPerSession must be >= 1"))?;
            Some(n)
        }
    };

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, name, supervisors_per_session) VALUES(?, ?, ?)",
        (&exam_id, &name, supervisors_per_session),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "examId": exam_id, "name": name }))
}

fn exams_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               e.id, e.name, e.supervisors_per_session,
               (SELECT COUNT(*) FROM exam_sessions es WHERE es.exam_id = e.id) AS session_count
             FROM exams e
             ORDER BY e.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "supervisorsPerSession": r.get::<_, Option<i64>>(2)?,
                "sessionCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "exams": rows }))
}

fn sessions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let starts_at = get_required_str(params, "startsAt")?;
    let ends_at = get_required_str(params, "endsAt")?;
    let window = TimeWindow::parse(&starts_at, &ends_at).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.message,
        details: None,
    })?;
    // Zero-length and inverted windows are rejected here so the conflict
    // checker never has to reason about them.
    if window.start >= window.end {
        return Err(HandlerErr::bad_params("startsAt must be before endsAt"));
    }

    let exam_id = match params.get("examId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let id = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("examId must be string or null"))?;
            let exists = conn
                .query_row("SELECT 1 FROM exams WHERE id = ?", [id], |r| {
                    r.get::<_, i64>(0)
                })
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?
                .is_some();
            if !exists {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "exam not found".to_string(),
                    details: None,
                });
            }
            Some(id.to_string())
        }
    };
    let room = match params.get("room") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| HandlerErr::bad_params("room must be string or null"))?
                .trim()
                .to_string(),
        ),
    };
    let required_count = match params.get("requiredCount") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let n = v
                .as_i64()
                .filter(|n| *n >= 1)
                .ok_or_else(|| HandlerErr::bad_params("requiredCount must be >= 1"))?;
            Some(n)
        }
    };

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_sessions(id, exam_id, title, room, starts_at, ends_at, required_count)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &exam_id,
            &title,
            &room,
            &starts_at,
            &ends_at,
            required_count,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_sessions" })),
    })?;
    Ok(json!({ "sessionId": session_id }))
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_filter = params.get("examId").and_then(|v| v.as_str());
    let base = "SELECT
                  es.id, es.exam_id, es.title, es.room, es.starts_at, es.ends_at,
                  es.required_count,
                  (SELECT COUNT(*) FROM session_assignments sa
                   WHERE sa.session_id = es.id
                     AND sa.status IN ('assigned', 'confirmed')) AS staffed_count
                FROM exam_sessions es";
    let (sql, bind): (String, Vec<&str>) = match exam_filter {
        Some(exam_id) => (
            format!("{} WHERE es.exam_id = ? ORDER BY es.starts_at", base),
            vec![exam_id],
        ),
        None => (format!("{} ORDER BY es.starts_at", base), vec![]),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "examId": r.get::<_, Option<String>>(1)?,
                "title": r.get::<_, String>(2)?,
                "room": r.get::<_, Option<String>>(3)?,
                "startsAt": r.get::<_, String>(4)?,
                "endsAt": r.get::<_, String>(5)?,
                "requiredCount": r.get::<_, Option<i64>>(6)?,
                "staffedCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "sessions": rows }))
}

fn sessions_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = conn
        .query_row(
            "SELECT id, exam_id, title, room, starts_at, ends_at, required_count
             FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "examId": r.get::<_, Option<String>>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "room": r.get::<_, Option<String>>(3)?,
                    "startsAt": r.get::<_, String>(4)?,
                    "endsAt": r.get::<_, String>(5)?,
                    "requiredCount": r.get::<_, Option<i64>>(6)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(session) = session else {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT sa.id, sa.supervisor_id, s.display_name, sa.role, sa.status,
                    sa.assigned_at, sa.confirmed_at
             FROM session_assignments sa
             JOIN supervisors s ON s.id = sa.supervisor_id
             WHERE sa.session_id = ?
             ORDER BY sa.assigned_at",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let assignments = stmt
        .query_map([&session_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "supervisorId": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "assignedAt": r.get::<_, String>(5)?,
                "confirmedAt": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "session": session, "assignments": assignments }))
}

fn sessions_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let exists = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // Committed assignments still count against their supervisor's load;
    // release before the rows go away.
    if let Err(e) = tx.execute(
        "UPDATE supervisors
         SET current_load = MAX(current_load - 1, 0),
             load_version = load_version + 1
         WHERE id IN (
           SELECT supervisor_id FROM session_assignments
           WHERE session_id = ? AND status IN ('assigned', 'confirmed')
         )",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db("db_update_failed", e));
    }
    if let Err(e) = tx.execute(
        "DELETE FROM session_assignments WHERE session_id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "session_assignments" })),
        });
    }
    if let Err(e) = tx.execute("DELETE FROM exam_sessions WHERE id = ?", [&session_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exam_sessions" })),
        });
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(with_conn(state, req, exams_create)),
        "exams.list" => Some(with_conn(state, req, |c, _| exams_list(c))),
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.list" => Some(with_conn(state, req, sessions_list)),
        "sessions.get" => Some(with_conn(state, req, sessions_get)),
        "sessions.delete" => Some(with_conn(state, req, sessions_delete)),
        _ => None,
    }
}
