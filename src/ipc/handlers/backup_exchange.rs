use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

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

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn get_path(params: &serde_json::Value, key: &str) -> Result<PathBuf, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn resolve_workspace(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<PathBuf, HandlerErr> {
    if let Some(p) = params.get("workspacePath").and_then(|v| v.as_str()) {
        return Ok(PathBuf::from(p));
    }
    state.workspace.clone().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match resolve_workspace(state, &req.params) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match get_path(&req.params, "outPath") {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "outPath": out_path.to_string_lossy(),
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:?}"), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match resolve_workspace(state, &req.params) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    let in_path = match get_path(&req.params, "inPath") {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "backup_import_failed", format!("{e:?}"), None),
    };

    // The restored file replaced the one under the open connection; reopen
    // so subsequent requests see the imported data.
    if state.workspace.as_deref() == Some(workspace.as_path()) {
        match db::open_db(&workspace) {
            Ok(conn) => state.db = Some(conn),
            Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
        }
    }

    ok(
        &req.id,
        json!({ "bundleFormatDetected": summary.bundle_format_detected }),
    )
}

fn export_schedule_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = params
        .get("sessionId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing sessionId".to_string(),
            details: None,
        })?;
    let out_path = get_path(params, "outPath")?;

    let session: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT title, starts_at, ends_at, room FROM exam_sessions WHERE id = ?",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((title, starts_at, ends_at, room)) = session else {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT sa.role, sa.status, s.display_name, s.email, sa.assigned_at, sa.confirmed_at
             FROM session_assignments sa
             JOIN supervisors s ON s.id = sa.supervisor_id
             WHERE sa.session_id = ?
             ORDER BY sa.assigned_at",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows: Vec<(String, String, String, String, String, Option<String>)> = stmt
        .query_map([session_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut out = String::new();
    out.push_str("session_title,starts_at,ends_at,room,role,status,display_name,email,assigned_at,confirmed_at\n");
    for (role, status, display_name, email, assigned_at, confirmed_at) in &rows {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&title),
            csv_quote(&starts_at),
            csv_quote(&ends_at),
            csv_quote(room.as_deref().unwrap_or("")),
            csv_quote(role),
            csv_quote(status),
            csv_quote(display_name),
            csv_quote(email),
            csv_quote(assigned_at),
            csv_quote(confirmed_at.as_deref().unwrap_or("")),
        ));
    }

    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return Err(HandlerErr {
                code: "io_failed",
                message: e.to_string(),
                details: None,
            });
        }
    }
    std::fs::write(&out_path, out).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "outPath": out_path.to_string_lossy() })),
    })?;

    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "rowCount": rows.len(),
    }))
}

fn handle_export_schedule_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match export_schedule_csv(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        "exchange.exportScheduleCsv" => Some(handle_export_schedule_csv(state, req)),
        _ => None,
    }
}
