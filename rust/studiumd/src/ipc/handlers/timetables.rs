use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::classrooms::parse_classroom_schedule;
use crate::ipc::handlers::setup::{load_timetables_setup, TimetablesSetup};
use crate::ipc::helpers::{db_conn, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use crate::timetable::{self, ClassroomSchedule, SessionEntry, ValidationError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

fn timetable_json(conn: &Connection, timetable_id: &str) -> anyhow::Result<Option<JsonValue>> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT classroom_id, created_at, updated_at FROM timetables WHERE id = ?",
            [timetable_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((classroom_id, created_at, updated_at)) = row else {
        return Ok(None);
    };
    let sessions = db::load_timetable_sessions(conn, timetable_id)?;
    Ok(Some(json!({
        "id": timetable_id,
        "classroomId": classroom_id,
        "schedule": sessions,
        "createdAt": created_at,
        "updatedAt": updated_at,
    })))
}

/// Parses the candidate `schedule` array. Shape problems are parameter errors,
/// not validation verdicts.
fn parse_candidate(
    req: &Request,
    setup: &TimetablesSetup,
) -> Result<Vec<SessionEntry>, JsonValue> {
    let Some(raw) = req.params.get("schedule").filter(|v| !v.is_null()) else {
        return Err(err(&req.id, "bad_params", "missing schedule", None));
    };
    if !raw.is_array() {
        return Err(err(&req.id, "bad_params", "schedule must be an array", None));
    }
    let mut entries: Vec<SessionEntry> = serde_json::from_value(raw.clone()).map_err(|e| {
        err(
            &req.id,
            "bad_params",
            format!("schedule is malformed: {}", e),
            None,
        )
    })?;

    if entries.len() > setup.max_sessions {
        return Err(err(
            &req.id,
            "bad_params",
            format!("schedule has more than {} sessions", setup.max_sessions),
            Some(json!({ "maxSessions": setup.max_sessions, "received": entries.len() })),
        ));
    }
    for (index, e) in entries.iter_mut().enumerate() {
        e.subject = e.subject.trim().to_string();
        if e.subject.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                format!("subject is required for session {}", index + 1),
                Some(json!({ "index": index })),
            ));
        }
    }
    Ok(entries)
}

fn load_schedule_or_404(
    conn: &Connection,
    req: &Request,
    classroom_id: &str,
) -> Result<ClassroomSchedule, JsonValue> {
    match db::load_classroom_schedule(conn, classroom_id) {
        Ok(Some(s)) => Ok(s),
        Ok(None) => Err(err(&req.id, "not_found", "Classroom not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn rejection(req: &Request, e: &ValidationError) -> JsonValue {
    tracing::warn!(reason = e.code(), message = %e, "timetable rejected");
    err(&req.id, "validation_failed", e.to_string(), Some(e.details()))
}

fn handle_timetables_list(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::classroom_exists(conn, &classroom_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Classroom not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT id FROM timetables WHERE classroom_id = ? ORDER BY created_at, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ids = match stmt
        .query_map([&classroom_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut timetables = Vec::with_capacity(ids.len());
    for id in ids {
        match timetable_json(conn, &id) {
            Ok(Some(t)) => timetables.push(t),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "timetables": timetables }))
}

/// Dry run for the form layer. Accepts either a stored classroom or an
/// inline `classroomSchedule`, so an unsaved classroom can be checked too.
fn handle_timetables_validate(state: &mut AppState, req: &Request) -> JsonValue {
    let classroom_id = match parse_opt_string(req.params.get("classroomId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("classroomId {}", m), None),
    };

    let setup = match state.db.as_ref() {
        Some(conn) => match load_timetables_setup(conn) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        None => TimetablesSetup::default(),
    };

    let classroom = match classroom_id {
        Some(cid) => {
            let conn = match db_conn(state, req) {
                Ok(c) => c,
                Err(e) => return e,
            };
            match load_schedule_or_404(conn, req, &cid) {
                Ok(s) => s,
                Err(e) => return e,
            }
        }
        None => match parse_classroom_schedule(req, req.params.get("classroomSchedule")) {
            Ok(s) => s,
            Err(e) => return e,
        },
    };
    let candidate = match parse_candidate(req, &setup) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match timetable::validate(&classroom, &candidate) {
        Ok(()) => ok(&req.id, json!({ "valid": true })),
        Err(e) => ok(
            &req.id,
            json!({
                "valid": false,
                "error": {
                    "code": e.code(),
                    "message": e.to_string(),
                    "details": e.details(),
                }
            }),
        ),
    }
}

fn handle_timetables_create(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom = match load_schedule_or_404(conn, req, &classroom_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let setup = match load_timetables_setup(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let candidate = match parse_candidate(req, &setup) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = timetable::validate(&classroom, &candidate) {
        return rejection(req, &e);
    }

    let timetable_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO timetables(id, classroom_id, created_at) VALUES(?, ?, ?)",
        (&timetable_id, &classroom_id, db::now_ts()),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "timetables" })),
        );
    }
    if let Err(e) = db::replace_timetable_sessions(&tx, &timetable_id, &candidate) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_sessions" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(
        timetable_id = %timetable_id,
        classroom_id = %classroom_id,
        sessions = candidate.len(),
        "timetable created"
    );

    match timetable_json(conn, &timetable_id) {
        Ok(Some(t)) => ok(
            &req.id,
            json!({ "timetableId": timetable_id, "timetable": t }),
        ),
        Ok(None) => err(&req.id, "not_found", "Timetable not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_timetables_update(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let timetable_id = match required_str(req, "timetableId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current_classroom: Option<String> = match conn
        .query_row(
            "SELECT classroom_id FROM timetables WHERE id = ?",
            [&timetable_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current_classroom) = current_classroom else {
        return err(&req.id, "not_found", "Timetable not found", None);
    };
    // A timetable may be moved to another classroom; it is then checked against that one.
    let classroom_id = match parse_opt_string(req.params.get("classroomId")) {
        Ok(v) => v.unwrap_or(current_classroom),
        Err(m) => return err(&req.id, "bad_params", format!("classroomId {}", m), None),
    };
    let classroom = match load_schedule_or_404(conn, req, &classroom_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let setup = match load_timetables_setup(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let candidate = match parse_candidate(req, &setup) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = timetable::validate(&classroom, &candidate) {
        return rejection(req, &e);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE timetables SET classroom_id = ?, updated_at = ? WHERE id = ?",
        (&classroom_id, db::now_ts(), &timetable_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "timetables" })),
        );
    }
    if let Err(e) = db::replace_timetable_sessions(&tx, &timetable_id, &candidate) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_sessions" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(
        timetable_id = %timetable_id,
        sessions = candidate.len(),
        "timetable updated"
    );

    match timetable_json(conn, &timetable_id) {
        Ok(Some(t)) => ok(&req.id, json!({ "timetable": t })),
        Ok(None) => err(&req.id, "not_found", "Timetable not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_timetables_delete(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let timetable_id = match required_str(req, "timetableId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM timetables WHERE id = ?", [&timetable_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "Timetable not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM timetable_sessions WHERE timetable_id = ?",
        [&timetable_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_sessions" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM timetables WHERE id = ?", [&timetable_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "timetables" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(timetable_id = %timetable_id, "timetable deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<JsonValue> {
    match req.method.as_str() {
        "timetables.list" => Some(handle_timetables_list(state, req)),
        "timetables.validate" => Some(handle_timetables_validate(state, req)),
        "timetables.create" => Some(handle_timetables_create(state, req)),
        "timetables.update" => Some(handle_timetables_update(state, req)),
        "timetables.delete" => Some(handle_timetables_delete(state, req)),
        _ => None,
    }
}
