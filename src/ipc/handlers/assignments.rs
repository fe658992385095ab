use crate::assign::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(code: &'static str, e: impl ToString) -> Self {
        Self {
            code,
            message: e.to_string(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

#[derive(Debug, Clone)]
struct AssignmentRow {
    id: String,
    session_id: String,
    supervisor_id: String,
    role: String,
    status: String,
}

fn load_assignment(
    conn: &Connection,
    assignment_id: &str,
) -> Result<AssignmentRow, HandlerErr> {
    conn.query_row(
        "SELECT id, session_id, supervisor_id, role, status
         FROM session_assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(AssignmentRow {
                id: r.get(0)?,
                session_id: r.get(1)?,
                supervisor_id: r.get(2)?,
                role: r.get(3)?,
                status: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "assignment not found".to_string(),
        details: None,
    })
}

fn assignments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(session_id) = params.get("sessionId").and_then(|v| v.as_str()) {
        clauses.push("sa.session_id = ?");
        binds.push(Value::Text(session_id.to_string()));
    }
    if let Some(supervisor_id) = params.get("supervisorId").and_then(|v| v.as_str()) {
        clauses.push("sa.supervisor_id = ?");
        binds.push(Value::Text(supervisor_id.to_string()));
    }
    if let Some(status) = params.get("status").and_then(|v| v.as_str()) {
        if assign::AssignmentStatus::parse(status).is_none() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "status must be one of: assigned, confirmed, declined, replaced"
                    .to_string(),
                details: None,
            });
        }
        clauses.push("sa.status = ?");
        binds.push(Value::Text(status.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT sa.id, sa.session_id, sa.supervisor_id, s.display_name,
                es.title, sa.role, sa.status, sa.assigned_at, sa.confirmed_at
         FROM session_assignments sa
         JOIN supervisors s ON s.id = sa.supervisor_id
         JOIN exam_sessions es ON es.id = sa.session_id{}
         ORDER BY sa.assigned_at",
        where_sql
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sessionId": r.get::<_, String>(1)?,
                "supervisorId": r.get::<_, String>(2)?,
                "displayName": r.get::<_, String>(3)?,
                "sessionTitle": r.get::<_, String>(4)?,
                "role": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "assignedAt": r.get::<_, String>(7)?,
                "confirmedAt": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "assignments": rows }))
}

fn assignments_confirm(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let row = load_assignment(conn, &assignment_id)?;
    if row.status != "assigned" {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("cannot confirm an assignment in status {}", row.status),
            details: None,
        });
    }
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE session_assignments
         SET status = 'confirmed', confirmed_at = ?
         WHERE id = ?",
        (&now, &assignment_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "status": "confirmed", "confirmedAt": now }))
}

/// Flip the assignment out of the active set and give the slot back to the
/// supervisor's load, atomically.
fn release_assignment(
    conn: &Connection,
    row: &AssignmentRow,
    new_status: &str,
) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if let Err(e) = tx.execute(
        "UPDATE session_assignments SET status = ? WHERE id = ?",
        (new_status, &row.id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db("db_update_failed", e));
    }
    if let Err(e) = tx.execute(
        "UPDATE supervisors
         SET current_load = MAX(current_load - 1, 0),
             load_version = load_version + 1,
             updated_at = ?
         WHERE id = ?",
        (Utc::now().to_rfc3339(), &row.supervisor_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db("db_update_failed", e));
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(())
}

fn assignments_decline(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let row = load_assignment(conn, &assignment_id)?;
    if row.status != "assigned" && row.status != "confirmed" {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("cannot decline an assignment in status {}", row.status),
            details: None,
        });
    }
    release_assignment(conn, &row, "declined")?;
    Ok(json!({ "ok": true, "status": "declined" }))
}

fn assignments_replace(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let row = load_assignment(conn, &assignment_id)?;
    if row.status != "assigned" && row.status != "confirmed" {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("cannot replace an assignment in status {}", row.status),
            details: None,
        });
    }
    let session = match assign::load_session(conn, &row.session_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return Err(HandlerErr {
                code: "not_found",
                message: "session not found".to_string(),
                details: None,
            })
        }
        Err(e) => {
            return Err(HandlerErr {
                code: "db_query_failed",
                message: e.message,
                details: None,
            })
        }
    };

    release_assignment(conn, &row, "replaced")?;

    // Backfill the vacated role with the best remaining candidate. The
    // outgoing supervisor is excluded explicitly: their slot was just
    // released, so the conflict check alone no longer rules them out.
    let candidates = assign::select_candidates(conn, &session.window).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.message,
        details: None,
    })?;
    let Some(pick) = candidates.iter().find(|c| c.id != row.supervisor_id) else {
        return Ok(json!({ "ok": true, "status": "replaced", "replacement": null }));
    };

    let role = match row.role.as_str() {
        "primary" => Role::Primary,
        "secondary" => Role::Secondary,
        _ => Role::Assistant,
    };
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let replacement_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO session_assignments(
            id, session_id, supervisor_id, role, status, assigned_at
         ) VALUES(?, ?, ?, ?, 'assigned', ?)",
        (&replacement_id, &row.session_id, &pick.id, role.as_str(), &now),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db("db_insert_failed", e));
    }
    let changed = match tx.execute(
        "UPDATE supervisors
         SET current_load = current_load + 1,
             load_version = load_version + 1,
             updated_at = ?
         WHERE id = ? AND load_version = ?",
        (&now, &pick.id, pick.load_version),
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return Err(HandlerErr::db("db_update_failed", e));
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "conflict",
            message: "replacement supervisor load changed concurrently".to_string(),
            details: None,
        });
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "ok": true,
        "status": "replaced",
        "replacement": {
            "id": replacement_id,
            "supervisorId": pick.id,
            "displayName": pick.display_name,
            "role": role.as_str(),
            "status": "assigned",
            "assignedAt": now,
        }
    }))
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
        "assignments.list" => Some(with_conn(state, req, assignments_list)),
        "assignments.confirm" => Some(with_conn(state, req, assignments_confirm)),
        "assignments.decline" => Some(with_conn(state, req, assignments_decline)),
        "assignments.replace" => Some(with_conn(state, req, assignments_replace)),
        _ => None,
    }
}
