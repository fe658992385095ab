use crate::assign::{self, Candidate, Role, SessionInfo};
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

fn load_session_or_not_found(
    conn: &Connection,
    session_id: &str,
) -> Result<SessionInfo, HandlerErr> {
    match assign::load_session(conn, session_id) {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        }),
        Err(e) => Err(HandlerErr {
            code: "db_query_failed",
            message: e.message,
            details: None,
        }),
    }
}

fn count_active_assignments(conn: &Connection, session_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM session_assignments
         WHERE session_id = ? AND status IN ('assigned', 'confirmed')",
        [session_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

struct CommitErr {
    code: &'static str,
    message: String,
}

/// One assignment write plus the load bump, atomically. The load update is
/// guarded by the supervisor's load_version so a concurrent orchestration
/// that bumped the same supervisor first turns this write into a conflict
/// instead of a silent over-commit.
fn commit_assignment(
    conn: &Connection,
    session_id: &str,
    supervisor_id: &str,
    load_version: i64,
    role: Role,
) -> Result<serde_json::Value, CommitErr> {
    let tx = conn.unchecked_transaction().map_err(|e| CommitErr {
        code: "db_tx_failed",
        message: e.to_string(),
    })?;
    let assignment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO session_assignments(
            id, session_id, supervisor_id, role, status, assigned_at
         ) VALUES(?, ?, ?, ?, 'assigned', ?)",
        (&assignment_id, session_id, supervisor_id, role.as_str(), &now),
    ) {
        let _ = tx.rollback();
        return Err(CommitErr {
            code: "db_insert_failed",
            message: e.to_string(),
        });
    }
    let changed = match tx.execute(
        "UPDATE supervisors
         SET current_load = current_load + 1,
             load_version = load_version + 1,
             updated_at = ?
         WHERE id = ? AND load_version = ?",
        (&now, supervisor_id, load_version),
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return Err(CommitErr {
                code: "db_update_failed",
                message: e.to_string(),
            });
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return Err(CommitErr {
            code: "conflict",
            message: "supervisor load changed concurrently".to_string(),
        });
    }
    if let Err(e) = tx.commit() {
        return Err(CommitErr {
            code: "db_commit_failed",
            message: e.to_string(),
        });
    }
    Ok(json!({
        "id": assignment_id,
        "sessionId": session_id,
        "supervisorId": supervisor_id,
        "role": role.as_str(),
        "status": "assigned",
        "assignedAt": now,
    }))
}

/// Re-reads the supervisor row and tries the commit once more. Used for the
/// single automatic retry after a conflict or write failure.
fn retry_commit(
    conn: &Connection,
    session_id: &str,
    supervisor_id: &str,
    role: Role,
) -> Result<serde_json::Value, CommitErr> {
    let fresh: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT current_load, max_load, load_version FROM supervisors WHERE id = ?",
            [supervisor_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CommitErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    let Some((current_load, max_load, load_version)) = fresh else {
        return Err(CommitErr {
            code: "not_found",
            message: "supervisor disappeared during assignment".to_string(),
        });
    };
    if current_load >= max_load {
        return Err(CommitErr {
            code: "conflict",
            message: "supervisor reached capacity concurrently".to_string(),
        });
    }
    commit_assignment(conn, session_id, supervisor_id, load_version, role)
}

fn auto_assign(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = load_session_or_not_found(conn, &session_id)?;
    let required = match params.get("requiredCount") {
        None => resolve_required(conn, &session)?,
        Some(v) if v.is_null() => resolve_required(conn, &session)?,
        Some(v) => v.as_i64().filter(|n| *n >= 1).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "requiredCount must be >= 1".to_string(),
            details: None,
        })?,
    };

    let staffed = count_active_assignments(conn, &session_id)?;
    if staffed >= required {
        // Re-running after success is a no-op, not an accident that adds
        // more supervisors past the requirement.
        return Ok(json!({
            "success": false,
            "reason": "already_staffed",
            "assignments": [],
            "shortfall": 0,
            "requiredCount": required,
            "staffedCount": staffed,
        }));
    }
    let slots = (required - staffed) as usize;

    let candidates = assign::select_candidates(conn, &session.window).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.message,
        details: None,
    })?;

    // All-or-nothing: an under-staffed session must be a visible decision
    // by the caller, never a silent partial commit.
    if candidates.len() < slots {
        return Ok(json!({
            "success": false,
            "reason": "insufficient_candidates",
            "assignments": [],
            "shortfall": slots as i64 - candidates.len() as i64,
            "requiredCount": required,
            "staffedCount": staffed,
            "availableCount": candidates.len(),
        }));
    }

    let mut created: Vec<serde_json::Value> = Vec::with_capacity(slots);
    for (i, candidate) in candidates.iter().take(slots).enumerate() {
        let role = assign::role_for_slot(staffed as usize + i);
        let first = commit_assignment(
            conn,
            &session_id,
            &candidate.id,
            candidate.load_version,
            role,
        );
        match first {
            Ok(a) => created.push(a),
            Err(_) => match retry_commit(conn, &session_id, &candidate.id, role) {
                Ok(a) => created.push(a),
                Err(second) => {
                    // Abort the remaining writes; the caller retries with
                    // the unfilled remainder only.
                    return Err(HandlerErr {
                        code: second.code,
                        message: second.message,
                        details: Some(json!({
                            "supervisorId": candidate.id,
                            "assignedSoFar": created,
                        })),
                    });
                }
            },
        }
    }

    Ok(json!({
        "success": true,
        "assignments": created,
        "shortfall": 0,
        "requiredCount": required,
        "staffedCount": staffed + created.len() as i64,
    }))
}

fn resolve_required(conn: &Connection, session: &SessionInfo) -> Result<i64, HandlerErr> {
    assign::resolve_required_count(conn, session).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.message,
        details: None,
    })
}

fn suggestion_json(candidate: &Candidate, score: i64) -> serde_json::Value {
    json!({
        "supervisor": candidate,
        "score": score,
    })
}

fn suggest(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = load_session_or_not_found(conn, &session_id)?;
    let required = resolve_required(conn, &session)?;
    let cfg = assign::load_scheduling_config(conn);

    let mut candidates =
        assign::select_candidates(conn, &session.window).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.message,
            details: None,
        })?;
    let available_count = candidates.len();
    assign::rank_by_score(&mut candidates, &cfg.weights);

    // Offer alternates beyond the requirement so a reviewer can swap.
    let limit = (required * cfg.suggestion_multiplier) as usize;
    let suggestions: Vec<serde_json::Value> = candidates
        .iter()
        .take(limit)
        .map(|c| suggestion_json(c, assign::candidate_score(c, &cfg.weights)))
        .collect();

    Ok(json!({
        "suggestions": suggestions,
        "requiredCount": required,
        "availableCount": available_count,
    }))
}

fn check_availability(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let supervisor_id = get_required_str(params, "supervisorId")?;
    let starts_at = get_required_str(params, "startsAt")?;
    let ends_at = get_required_str(params, "endsAt")?;
    let window = assign::TimeWindow::parse(&starts_at, &ends_at).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.message,
        details: None,
    })?;
    let exists = conn
        .query_row(
            "SELECT 1 FROM supervisors WHERE id = ?",
            [&supervisor_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "supervisor not found".to_string(),
            details: None,
        });
    }
    let available = assign::is_supervisor_available(conn, &supervisor_id, &window);
    Ok(json!({ "available": available }))
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
        "scheduling.autoAssign" => Some(with_conn(state, req, auto_assign)),
        "scheduling.suggest" => Some(with_conn(state, req, suggest)),
        "scheduling.checkAvailability" => Some(with_conn(state, req, check_availability)),
        _ => None,
    }
}
