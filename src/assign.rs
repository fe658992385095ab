use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;

use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct AssignError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AssignError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Available,
    Unavailable,
    OnLeave,
}

impl SupervisorStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "unavailable" => Some(Self::Unavailable),
            "on_leave" => Some(Self::OnLeave),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::OnLeave => "on_leave",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Assigned,
    Confirmed,
    Declined,
    Replaced,
}

impl AssignmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assigned" => Some(Self::Assigned),
            "confirmed" => Some(Self::Confirmed),
            "declined" => Some(Self::Declined),
            "replaced" => Some(Self::Replaced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Assistant,
}

/// Slot-to-role table. Slots past the end of the table saturate to the
/// last role rather than growing the enum.
pub const ROLE_ORDER: [Role; 3] = [Role::Primary, Role::Secondary, Role::Assistant];

pub fn role_for_slot(slot: usize) -> Role {
    *ROLE_ORDER.get(slot).unwrap_or(&Role::Assistant)
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Assistant => "assistant",
        }
    }
}

/// Half-open interval: the start instant belongs to the window, the end
/// instant does not. Back-to-back sessions never conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn parse(starts_at: &str, ends_at: &str) -> Result<Self, AssignError> {
        let start = DateTime::parse_from_rfc3339(starts_at)
            .map_err(|_| AssignError::new("bad_params", "startsAt must be RFC 3339"))?
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339(ends_at)
            .map_err(|_| AssignError::new("bad_params", "endsAt must be RFC 3339"))?
            .with_timezone(&Utc);
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub exam_id: Option<String>,
    pub required_count: Option<i64>,
    pub window: TimeWindow,
}

pub fn load_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionInfo>, AssignError> {
    let row: Option<(Option<String>, String, String, Option<i64>)> = conn
        .query_row(
            "SELECT exam_id, starts_at, ends_at, required_count
             FROM exam_sessions
             WHERE id = ?",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| AssignError::new("db_query_failed", e.to_string()))?;
    let Some((exam_id, starts_at, ends_at, required_count)) = row else {
        return Ok(None);
    };
    let window = TimeWindow::parse(&starts_at, &ends_at)?;
    Ok(Some(SessionInfo {
        exam_id,
        required_count,
        window,
    }))
}

/// Session override wins, then the parent exam's default, then 1.
pub fn resolve_required_count(
    conn: &Connection,
    session: &SessionInfo,
) -> Result<i64, AssignError> {
    if let Some(n) = session.required_count {
        if n >= 1 {
            return Ok(n);
        }
    }
    if let Some(exam_id) = session.exam_id.as_deref() {
        let per_session: Option<Option<i64>> = conn
            .query_row(
                "SELECT supervisors_per_session FROM exams WHERE id = ?",
                [exam_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| AssignError::new("db_query_failed", e.to_string()))?;
        if let Some(Some(n)) = per_session {
            if n >= 1 {
                return Ok(n);
            }
        }
    }
    Ok(1)
}

/// True only when no committed assignment of this supervisor overlaps the
/// window. Lookup failures and unparsable stored windows count as busy, so
/// uncertain data can never produce a double booking.
pub fn is_supervisor_available(
    conn: &Connection,
    supervisor_id: &str,
    window: &TimeWindow,
) -> bool {
    let mut stmt = match conn.prepare(
        "SELECT es.starts_at, es.ends_at
         FROM session_assignments sa
         JOIN exam_sessions es ON es.id = sa.session_id
         WHERE sa.supervisor_id = ? AND sa.status IN ('assigned', 'confirmed')",
    ) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let rows = stmt
        .query_map([supervisor_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(_) => return false,
    };
    for (starts_at, ends_at) in rows {
        let Ok(existing) = TimeWindow::parse(&starts_at, &ends_at) else {
            return false;
        };
        if window.overlaps(&existing) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub department: Option<String>,
    pub current_load: i64,
    pub max_load: i64,
    #[serde(skip_serializing)]
    pub load_version: i64,
    pub preferred_window_count: i64,
}

/// Filter-then-rank: hard constraints first (status, capacity, no window
/// conflict), then the soft ordering. The list is never truncated here so
/// the same ranking serves both assignment and suggestions.
pub fn select_candidates(
    conn: &Connection,
    window: &TimeWindow,
) -> Result<Vec<Candidate>, AssignError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.display_name, s.email, s.department,
                    s.current_load, s.max_load, s.load_version,
                    (SELECT COUNT(*) FROM supervisor_windows w
                     WHERE w.supervisor_id = s.id AND w.is_preferred = 1)
             FROM supervisors s
             WHERE s.status = 'available' AND s.current_load < s.max_load",
        )
        .map_err(|e| AssignError::new("db_query_failed", e.to_string()))?;
    let roster: Vec<Candidate> = stmt
        .query_map([], |r| {
            Ok(Candidate {
                id: r.get(0)?,
                display_name: r.get(1)?,
                email: r.get(2)?,
                department: r.get(3)?,
                current_load: r.get(4)?,
                max_load: r.get(5)?,
                load_version: r.get(6)?,
                preferred_window_count: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| AssignError::new("db_query_failed", e.to_string()))?;

    let mut candidates: Vec<Candidate> = roster
        .into_iter()
        .filter(|c| is_supervisor_available(conn, &c.id, window))
        .collect();
    rank_candidates(&mut candidates);
    Ok(candidates)
}

/// Least-loaded first; preference breaks ties; name keeps the order
/// deterministic.
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.current_load
            .cmp(&b.current_load)
            .then_with(|| b.preferred_window_count.cmp(&a.preferred_window_count))
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWeights {
    pub base: i64,
    pub load_penalty: i64,
    pub preferred_bonus: i64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            base: 100,
            load_penalty: 5,
            preferred_bonus: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulingConfig {
    pub weights: ScoreWeights,
    pub suggestion_multiplier: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            suggestion_multiplier: 2,
        }
    }
}

/// Best-effort read of the tunable weights; malformed or missing settings
/// fall back to the defaults.
pub fn load_scheduling_config(conn: &Connection) -> SchedulingConfig {
    let mut cfg = SchedulingConfig::default();
    let Ok(Some(saved)) = db::settings_get_json(conn, "setup.scheduling") else {
        return cfg;
    };
    if let Some(n) = saved.get("scoreBase").and_then(|v| v.as_i64()) {
        cfg.weights.base = n;
    }
    if let Some(n) = saved.get("loadPenalty").and_then(|v| v.as_i64()) {
        cfg.weights.load_penalty = n;
    }
    if let Some(n) = saved.get("preferredBonus").and_then(|v| v.as_i64()) {
        cfg.weights.preferred_bonus = n;
    }
    if let Some(n) = saved.get("suggestionMultiplier").and_then(|v| v.as_i64()) {
        if n >= 1 {
            cfg.suggestion_multiplier = n;
        }
    }
    cfg
}

pub fn candidate_score(candidate: &Candidate, weights: &ScoreWeights) -> i64 {
    let load_part = (weights.base - candidate.current_load * weights.load_penalty).max(0);
    load_part + candidate.preferred_window_count * weights.preferred_bonus
}

/// Score-descending order for suggestion lists.
pub fn rank_by_score(candidates: &mut [Candidate], weights: &ScoreWeights) {
    candidates.sort_by(|a, b| {
        let sa = candidate_score(a, weights);
        let sb = candidate_score(b, weights);
        match sb.cmp(&sa) {
            Ordering::Equal => a.display_name.cmp(&b.display_name),
            other => other,
        }
    });
}
