use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("proctor.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS supervisors(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            department TEXT,
            status TEXT NOT NULL DEFAULT 'available',
            current_load INTEGER NOT NULL DEFAULT 0,
            max_load INTEGER NOT NULL DEFAULT 6,
            load_version INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    // Existing workspaces may predate load versioning. Add and leave at 0.
    ensure_supervisors_load_version(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_supervisors_status ON supervisors(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS supervisor_windows(
            id TEXT PRIMARY KEY,
            supervisor_id TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            start_minute INTEGER NOT NULL,
            end_minute INTEGER NOT NULL,
            is_preferred INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(supervisor_id) REFERENCES supervisors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_supervisor_windows_supervisor
         ON supervisor_windows(supervisor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            supervisors_per_session INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_sessions(
            id TEXT PRIMARY KEY,
            exam_id TEXT,
            title TEXT NOT NULL,
            room TEXT,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            required_count INTEGER,
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;
    ensure_sessions_room(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_sessions_exam ON exam_sessions(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_sessions_starts ON exam_sessions(starts_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_assignments(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            supervisor_id TEXT NOT NULL,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            confirmed_at TEXT,
            FOREIGN KEY(session_id) REFERENCES exam_sessions(id),
            FOREIGN KEY(supervisor_id) REFERENCES supervisors(id),
            UNIQUE(session_id, supervisor_id)
        )",
        [],
    )?;
    ensure_assignments_confirmed_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_assignments_session
         ON session_assignments(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_assignments_supervisor
         ON session_assignments(supervisor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_assignments_supervisor_status
         ON session_assignments(supervisor_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Migrate older workspaces to the expanded assignment-status semantics:
    // - "active" => "assigned"
    // - "cancelled" => "declined"
    migrate_assignment_statuses(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, &raw),
    )?;
    Ok(())
}

fn ensure_supervisors_load_version(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "supervisors", "load_version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE supervisors ADD COLUMN load_version INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_sessions_room(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exam_sessions", "room")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exam_sessions ADD COLUMN room TEXT", [])?;
    Ok(())
}

fn ensure_assignments_confirmed_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "session_assignments", "confirmed_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE session_assignments ADD COLUMN confirmed_at TEXT",
        [],
    )?;
    Ok(())
}

fn migrate_assignment_statuses(conn: &Connection) -> anyhow::Result<()> {
    // v0 -> v1 status vocabulary. Older DBs used:
    // - status="active" for a committed assignment
    // - status="cancelled" for a declined one
    conn.execute(
        "UPDATE session_assignments SET status = 'assigned' WHERE status = 'active'",
        [],
    )?;
    conn.execute(
        "UPDATE session_assignments SET status = 'declined' WHERE status = 'cancelled'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
