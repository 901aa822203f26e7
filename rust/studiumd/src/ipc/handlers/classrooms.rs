use crate::accounts::Role;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_string_array, required_str};
use crate::ipc::types::{AppState, Request};
use crate::timetable::{ClassroomSchedule, DaySchedule, ScheduleError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

fn user_summary(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<JsonValue>> {
    conn.query_row(
        "SELECT id, name, email, role FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
            }))
        },
    )
    .optional()
}

fn user_role(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()
}

fn classroom_json(conn: &Connection, classroom_id: &str) -> anyhow::Result<Option<JsonValue>> {
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT name, teacher_id, created_at FROM classrooms WHERE id = ?",
            [classroom_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((name, teacher_id, created_at)) = row else {
        return Ok(None);
    };

    let schedule = db::load_classroom_schedule(conn, classroom_id)?.unwrap_or_default();
    let teacher = match teacher_id.as_deref() {
        Some(tid) => user_summary(conn, tid)?,
        None => None,
    };

    let mut stmt = conn.prepare(
        "SELECT id, name, email
         FROM users
         WHERE classroom_id = ? AND role = ?
         ORDER BY name, email",
    )?;
    let students = stmt
        .query_map((classroom_id, Role::Student.as_str()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(json!({
        "id": classroom_id,
        "name": name,
        "schedule": schedule.windows(),
        "teacherId": teacher_id,
        "teacher": teacher,
        "studentCount": students.len(),
        "students": students,
        "createdAt": created_at,
    })))
}

fn handle_classrooms_list(state: &mut AppState, req: &Request) -> JsonValue {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classrooms": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id FROM classrooms ORDER BY name, created_at") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let ids = match ids {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut classrooms = Vec::with_capacity(ids.len());
    for id in ids {
        match classroom_json(conn, &id) {
            Ok(Some(c)) => classrooms.push(c),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "classrooms": classrooms }))
}

fn handle_classrooms_get(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match classroom_json(conn, &classroom_id) {
        Ok(Some(c)) => ok(&req.id, json!({ "classroom": c })),
        Ok(None) => err(&req.id, "not_found", "Classroom not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Parses a `[{ day, startTime, endTime }]` array into a checked schedule.
pub(crate) fn parse_classroom_schedule(
    req: &Request,
    raw: Option<&JsonValue>,
) -> Result<ClassroomSchedule, JsonValue> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Err(err(&req.id, "bad_params", "missing schedule", None));
    };
    let windows: Vec<DaySchedule> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return Err(err(
                &req.id,
                "bad_params",
                format!("schedule is malformed: {}", e),
                None,
            ))
        }
    };
    ClassroomSchedule::new(windows).map_err(|e| {
        let reason = match e {
            ScheduleError::InvalidWindow { .. } => "invalid_window",
            ScheduleError::DuplicateDay { .. } => "duplicate_day",
        };
        err(
            &req.id,
            "bad_params",
            e.to_string(),
            Some(json!({ "reason": reason })),
        )
    })
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let schedule = match parse_classroom_schedule(req, req.params.get("schedule")) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if schedule.windows().is_empty() {
        return err(
            &req.id,
            "bad_params",
            "schedule must contain at least one day",
            None,
        );
    }
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match parse_string_array(req.params.get("studentIds")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentIds {}", m), None),
    };

    match user_role(conn, &teacher_id) {
        Ok(Some(role)) if role == Role::Teacher.as_str() => {}
        Ok(_) => return err(&req.id, "not_found", "Teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // Only free teachers can take a new classroom.
    match db::teacher_assignment(conn, &teacher_id) {
        Ok(None) => {}
        Ok(Some(existing)) => {
            return err(
                &req.id,
                "conflict",
                "Teacher is already assigned to a classroom.",
                Some(json!({ "teacherId": teacher_id, "classroomId": existing })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    for sid in &student_ids {
        match user_role(conn, sid) {
            Ok(Some(role)) if role == Role::Student.as_str() => {}
            Ok(_) => {
                return err(
                    &req.id,
                    "not_found",
                    "Student not found",
                    Some(json!({ "studentId": sid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let classroom_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "INSERT INTO classrooms(id, name, teacher_id, created_at) VALUES(?, ?, ?, ?)",
        (&classroom_id, &name, &teacher_id, db::now_ts()),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classrooms" })),
        );
    }
    if let Err(e) = db::insert_classroom_schedule(&tx, &classroom_id, &schedule) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classroom_schedule" })),
        );
    }

    let now = db::now_ts();
    for uid in std::iter::once(&teacher_id).chain(student_ids.iter()) {
        if let Err(e) = tx.execute(
            "UPDATE users SET classroom_id = ?, updated_at = ? WHERE id = ?",
            (&classroom_id, &now, uid),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(
        classroom_id = %classroom_id,
        days = schedule.windows().len(),
        students = student_ids.len(),
        "classroom created"
    );

    match classroom_json(conn, &classroom_id) {
        Ok(Some(c)) => ok(
            &req.id,
            json!({ "classroomId": classroom_id, "classroom": c }),
        ),
        Ok(None) => err(&req.id, "not_found", "Classroom not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<JsonValue> {
    match req.method.as_str() {
        "classrooms.list" => Some(handle_classrooms_list(state, req)),
        "classrooms.get" => Some(handle_classrooms_get(state, req)),
        "classrooms.create" => Some(handle_classrooms_create(state, req)),
        _ => None,
    }
}
