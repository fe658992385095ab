use crate::assign::SupervisorStatus;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("{} must be string or null", key),
                details: None,
            }),
    }
}

fn supervisor_exists(conn: &Connection, supervisor_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM supervisors WHERE id = ?",
        [supervisor_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn parse_status(raw: &str) -> Result<SupervisorStatus, HandlerErr> {
    SupervisorStatus::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be one of: available, unavailable, on_leave".to_string(),
        details: None,
    })
}

fn supervisors_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               s.id, s.display_name, s.email, s.phone, s.department, s.status,
               s.current_load, s.max_load,
               (SELECT COUNT(*) FROM supervisor_windows w
                WHERE w.supervisor_id = s.id) AS window_count,
               (SELECT COUNT(*) FROM supervisor_windows w
                WHERE w.supervisor_id = s.id AND w.is_preferred = 1) AS preferred_count,
               (SELECT COUNT(*) FROM session_assignments sa
                WHERE sa.supervisor_id = s.id
                  AND sa.status IN ('assigned', 'confirmed')) AS active_assignments
             FROM supervisors s
             ORDER BY s.display_name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "department": r.get::<_, Option<String>>(4)?,
                "status": r.get::<_, String>(5)?,
                "currentLoad": r.get::<_, i64>(6)?,
                "maxLoad": r.get::<_, i64>(7)?,
                "windowCount": r.get::<_, i64>(8)?,
                "preferredWindowCount": r.get::<_, i64>(9)?,
                "activeAssignments": r.get::<_, i64>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "supervisors": rows }))
}

fn supervisors_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?.trim().to_string();
    if display_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "displayName must not be empty".to_string(),
            details: None,
        });
    }
    let email = get_required_str(params, "email")?.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(HandlerErr {
            code: "bad_params",
            message: "email must contain @".to_string(),
            details: None,
        });
    }
    let phone = get_optional_str(params, "phone")?;
    let department = get_optional_str(params, "department")?;
    let status = match params.get("status").and_then(|v| v.as_str()) {
        Some(raw) => parse_status(raw)?,
        None => SupervisorStatus::Available,
    };
    let max_load = match params.get("maxLoad") {
        None => 6,
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "maxLoad must be integer".to_string(),
                details: None,
            })?;
            if n < 1 {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "maxLoad must be >= 1".to_string(),
                    details: None,
                });
            }
            n
        }
    };

    let supervisor_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO supervisors(
            id, display_name, email, phone, department, status,
            current_load, max_load, load_version, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, 0, ?, 0, ?)",
        (
            &supervisor_id,
            &display_name,
            &email,
            &phone,
            &department,
            status.as_str(),
            max_load,
            &now,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "supervisors" })),
    })?;

    Ok(json!({ "supervisorId": supervisor_id }))
}

fn supervisors_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    if !supervisor_exists(conn, &supervisor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "patch must be an object".to_string(),
            details: None,
        });
    };

    for (key, value) in patch {
        match key.as_str() {
            "displayName" => {
                let name = value
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HandlerErr {
                        code: "bad_params",
                        message: "displayName must be a non-empty string".to_string(),
                        details: None,
                    })?;
                run_patch_update(conn, "display_name", &supervisor_id, &name)?;
            }
            "email" => {
                let email = value
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| s.contains('@'))
                    .ok_or_else(|| HandlerErr {
                        code: "bad_params",
                        message: "email must contain @".to_string(),
                        details: None,
                    })?;
                run_patch_update(conn, "email", &supervisor_id, &email)?;
            }
            "phone" | "department" => {
                let column = if key == "phone" { "phone" } else { "department" };
                if value.is_null() {
                    let sql = format!(
                        "UPDATE supervisors SET {} = NULL, updated_at = ? WHERE id = ?",
                        column
                    );
                    conn.execute(&sql, (Utc::now().to_rfc3339(), &supervisor_id))
                        .map_err(|e| HandlerErr {
                            code: "db_update_failed",
                            message: e.to_string(),
                            details: None,
                        })?;
                } else {
                    let s = value.as_str().ok_or_else(|| HandlerErr {
                        code: "bad_params",
                        message: format!("{} must be string or null", key),
                        details: None,
                    })?;
                    run_patch_update(conn, column, &supervisor_id, s.trim())?;
                }
            }
            "maxLoad" => {
                let n = value.as_i64().filter(|n| *n >= 1).ok_or_else(|| HandlerErr {
                    code: "bad_params",
                    message: "maxLoad must be an integer >= 1".to_string(),
                    details: None,
                })?;
                conn.execute(
                    "UPDATE supervisors SET max_load = ?, updated_at = ? WHERE id = ?",
                    (n, Utc::now().to_rfc3339(), &supervisor_id),
                )
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: None,
                })?;
            }
            other => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("unknown patch field: {}", other),
                    details: None,
                })
            }
        }
    }

    Ok(json!({ "ok": true }))
}

fn run_patch_update(
    conn: &Connection,
    column: &str,
    supervisor_id: &str,
    value: &str,
) -> Result<(), HandlerErr> {
    let sql = format!(
        "UPDATE supervisors SET {} = ?, updated_at = ? WHERE id = ?",
        column
    );
    conn.execute(&sql, (value, Utc::now().to_rfc3339(), supervisor_id))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "supervisors" })),
        })?;
    Ok(())
}

fn supervisors_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    if !supervisor_exists(conn, &supervisor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }
    conn.execute(
        "UPDATE supervisors SET status = ?, updated_at = ? WHERE id = ?",
        (status.as_str(), Utc::now().to_rfc3339(), &supervisor_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true, "status": status.as_str() }))
}

fn supervisors_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    if !supervisor_exists(conn, &supervisor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        (
            "DELETE FROM session_assignments WHERE supervisor_id = ?",
            "session_assignments",
        ),
        (
            "DELETE FROM supervisor_windows WHERE supervisor_id = ?",
            "supervisor_windows",
        ),
        ("DELETE FROM supervisors WHERE id = ?", "supervisors"),
    ] {
        if let Err(e) = tx.execute(sql, [&supervisor_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true }))
}

fn windows_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    if !supervisor_exists(conn, &supervisor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }
    let Some(windows) = params.get("windows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing windows".to_string(),
            details: None,
        });
    };

    struct ParsedWindow {
        day_of_week: i64,
        start_minute: i64,
        end_minute: i64,
        is_preferred: bool,
    }

    let mut parsed = Vec::with_capacity(windows.len());
    for (i, raw) in windows.iter().enumerate() {
        let day_of_week = raw
            .get("dayOfWeek")
            .and_then(|v| v.as_i64())
            .filter(|d| (0..=6).contains(d))
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("windows[{}].dayOfWeek must be in 0..=6", i),
                details: None,
            })?;
        let start_minute = raw
            .get("startMinute")
            .and_then(|v| v.as_i64())
            .filter(|m| (0..=1440).contains(m))
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("windows[{}].startMinute must be in 0..=1440", i),
                details: None,
            })?;
        let end_minute = raw
            .get("endMinute")
            .and_then(|v| v.as_i64())
            .filter(|m| (0..=1440).contains(m))
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("windows[{}].endMinute must be in 0..=1440", i),
                details: None,
            })?;
        if start_minute >= end_minute {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("windows[{}] must have startMinute < endMinute", i),
                details: None,
            });
        }
        let is_preferred = raw
            .get("isPreferred")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        parsed.push(ParsedWindow {
            day_of_week,
            start_minute,
            end_minute,
            is_preferred,
        });
    }

    // Replace-all semantics: the supplied list is the whole weekly pattern.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx.execute(
        "DELETE FROM supervisor_windows WHERE supervisor_id = ?",
        [&supervisor_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "supervisor_windows" })),
        });
    }
    for w in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO supervisor_windows(
                id, supervisor_id, day_of_week, start_minute, end_minute, is_preferred
             ) VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &supervisor_id,
                w.day_of_week,
                w.start_minute,
                w.end_minute,
                w.is_preferred as i64,
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "supervisor_windows" })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "windowCount": parsed.len() }))
}

fn windows_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    if !supervisor_exists(conn, &supervisor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, day_of_week, start_minute, end_minute, is_preferred
             FROM supervisor_windows
             WHERE supervisor_id = ?
             ORDER BY day_of_week, start_minute",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&supervisor_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "dayOfWeek": r.get::<_, i64>(1)?,
                "startMinute": r.get::<_, i64>(2)?,
                "endMinute": r.get::<_, i64>(3)?,
                "isPreferred": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "windows": rows }))
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
        "supervisors.list" => Some(with_conn(state, req, |c, _| supervisors_list(c))),
        "supervisors.create" => Some(with_conn(state, req, supervisors_create)),
        "supervisors.update" => Some(with_conn(state, req, supervisors_update)),
        "supervisors.setStatus" => Some(with_conn(state, req, supervisors_set_status)),
        "supervisors.delete" => Some(with_conn(state, req, supervisors_delete)),
        "supervisors.windows.set" => Some(with_conn(state, req, windows_set)),
        "supervisors.windows.list" => Some(with_conn(state, req, windows_list)),
        _ => None,
    }
}
