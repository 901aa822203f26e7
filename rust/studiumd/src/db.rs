use crate::accounts::Role;
use crate::timetable::{
    ClassroomSchedule, Day, DaySchedule, ScheduleError, SessionEntry, TimeOfDay,
};
use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "studium.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            phone TEXT,
            age INTEGER,
            gender TEXT,
            role TEXT NOT NULL,
            classroom_id TEXT,
            assigned_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    ensure_users_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_classroom ON users(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classroom_schedule(
            classroom_id TEXT NOT NULL,
            day TEXT NOT NULL,
            start_minute INTEGER NOT NULL,
            end_minute INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(classroom_id, day),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetables_classroom ON timetables(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_sessions(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            subject TEXT NOT NULL,
            day TEXT NOT NULL,
            start_minute INTEGER NOT NULL,
            end_minute INTEGER NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            UNIQUE(timetable_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_sessions_timetable ON timetable_sessions(timetable_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before users could be edited lack updated_at.
fn ensure_users_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("corrupt setting {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn day_col(raw: &str) -> anyhow::Result<Day> {
    raw.parse::<Day>().map_err(|e| anyhow!("stored {}", e))
}

fn minute_col(raw: i64) -> anyhow::Result<TimeOfDay> {
    u16::try_from(raw)
        .ok()
        .and_then(TimeOfDay::from_minutes)
        .ok_or_else(|| anyhow!("stored minute-of-day out of range: {}", raw))
}

pub fn classroom_exists(conn: &Connection, classroom_id: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classrooms WHERE id = ?",
            [classroom_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// The teacher currently attached to a classroom. `None` when the classroom is missing.
pub fn classroom_teacher(
    conn: &Connection,
    classroom_id: &str,
) -> anyhow::Result<Option<Option<String>>> {
    Ok(conn
        .query_row(
            "SELECT teacher_id FROM classrooms WHERE id = ?",
            [classroom_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Classroom a teacher is attached to, from either side of the link.
pub fn teacher_assignment(conn: &Connection, user_id: &str) -> anyhow::Result<Option<String>> {
    let taught: Option<String> = conn
        .query_row(
            "SELECT id FROM classrooms WHERE teacher_id = ? LIMIT 1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    if taught.is_some() {
        return Ok(taught);
    }
    let assigned: Option<Option<String>> = conn
        .query_row(
            "SELECT classroom_id FROM users WHERE id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(assigned.flatten())
}

/// Makes `classrooms.teacher_id` agree with a user's role and classroom.
/// A teacher keeps (or takes, if free) the classroom they belong to and
/// is detached from every other one.
pub fn sync_teacher_link(
    conn: &Connection,
    user_id: &str,
    role: Role,
    classroom_id: Option<&str>,
) -> anyhow::Result<()> {
    let keep = if role == Role::Teacher { classroom_id } else { None };
    conn.execute(
        "UPDATE classrooms SET teacher_id = NULL WHERE teacher_id = ?1 AND id IS NOT ?2",
        (user_id, keep),
    )?;
    if let Some(cid) = keep {
        conn.execute(
            "UPDATE classrooms SET teacher_id = ?1 WHERE id = ?2 AND teacher_id IS NULL",
            (user_id, cid),
        )?;
    }
    Ok(())
}

/// Loads the weekly windows of a classroom, `None` if the classroom does not exist.
pub fn load_classroom_schedule(
    conn: &Connection,
    classroom_id: &str,
) -> anyhow::Result<Option<ClassroomSchedule>> {
    if !classroom_exists(conn, classroom_id)? {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT day, start_minute, end_minute
         FROM classroom_schedule
         WHERE classroom_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([classroom_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut windows = Vec::with_capacity(rows.len());
    for (day, start, end) in rows {
        windows.push(DaySchedule {
            day: day_col(&day)?,
            start_time: minute_col(start)?,
            end_time: minute_col(end)?,
        });
    }
    let schedule = ClassroomSchedule::new(windows)
        .map_err(|e: ScheduleError| anyhow!("stored classroom schedule is invalid: {}", e))?;
    Ok(Some(schedule))
}

pub fn insert_classroom_schedule(
    conn: &Connection,
    classroom_id: &str,
    schedule: &ClassroomSchedule,
) -> anyhow::Result<()> {
    for (i, w) in schedule.windows().iter().enumerate() {
        conn.execute(
            "INSERT INTO classroom_schedule(classroom_id, day, start_minute, end_minute, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            (
                classroom_id,
                w.day.as_str(),
                w.start_time.minutes(),
                w.end_time.minutes(),
                i as i64,
            ),
        )?;
    }
    Ok(())
}

pub fn load_timetable_sessions(
    conn: &Connection,
    timetable_id: &str,
) -> anyhow::Result<Vec<SessionEntry>> {
    let mut stmt = conn.prepare(
        "SELECT subject, day, start_minute, end_minute
         FROM timetable_sessions
         WHERE timetable_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([timetable_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(subject, day, start, end)| -> anyhow::Result<SessionEntry> {
            Ok(SessionEntry {
                subject,
                day: day_col(&day)?,
                start_time: minute_col(start)?,
                end_time: minute_col(end)?,
            })
        })
        .collect()
}

/// Replaces every session of a timetable. Callers own the transaction.
pub fn replace_timetable_sessions(
    conn: &Connection,
    timetable_id: &str,
    sessions: &[SessionEntry],
) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM timetable_sessions WHERE timetable_id = ?",
        [timetable_id],
    )?;
    for (i, s) in sessions.iter().enumerate() {
        conn.execute(
            "INSERT INTO timetable_sessions(id, timetable_id, sort_order, subject, day, start_minute, end_minute)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                timetable_id,
                i as i64,
                &s.subject,
                s.day.as_str(),
                s.start_time.minutes(),
                s.end_time.minutes(),
            ),
        )?;
    }
    Ok(())
}
