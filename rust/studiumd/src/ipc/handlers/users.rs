use crate::accounts::{hash_password, looks_like_email, Role};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_accounts_setup;
use crate::ipc::helpers::{db_conn, parse_bool, parse_opt_i64, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

const USER_SELECT: &str = "SELECT
       u.id,
       u.name,
       u.email,
       u.phone,
       u.age,
       u.gender,
       u.role,
       u.classroom_id,
       c.name,
       u.assigned_by,
       u.created_at,
       u.updated_at
     FROM users u
     LEFT JOIN classrooms c ON c.id = u.classroom_id";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<JsonValue> {
    let classroom_id: Option<String> = row.get(7)?;
    let classroom_name: Option<String> = row.get(8)?;
    let classroom = match (&classroom_id, classroom_name) {
        (Some(id), Some(name)) => json!({ "id": id, "name": name }),
        _ => JsonValue::Null,
    };
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "email": row.get::<_, String>(2)?,
        "phone": row.get::<_, Option<String>>(3)?,
        "age": row.get::<_, Option<i64>>(4)?,
        "gender": row.get::<_, Option<String>>(5)?,
        "role": row.get::<_, String>(6)?,
        "classroomId": classroom_id,
        "classroom": classroom,
        "assignedBy": row.get::<_, Option<String>>(9)?,
        "createdAt": row.get::<_, String>(10)?,
        "updatedAt": row.get::<_, Option<String>>(11)?,
    }))
}

fn load_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<JsonValue>> {
    conn.query_row(
        &format!("{} WHERE u.id = ?", USER_SELECT),
        [user_id],
        user_from_row,
    )
    .optional()
}

fn email_taken(conn: &Connection, email: &str, except_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE lower(email) = lower(?)",
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match (found, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn check_age(age: Option<i64>) -> Result<Option<i64>, &'static str> {
    match age {
        Some(a) if !(0..=150).contains(&a) => Err("age must be in 0..=150"),
        other => Ok(other),
    }
}

/// A teacher may only join a classroom that has no other teacher.
fn check_teacher_slot(
    conn: &Connection,
    req: &Request,
    user_id: Option<&str>,
    role: Role,
    classroom_id: Option<&str>,
) -> Result<(), JsonValue> {
    let (Role::Teacher, Some(cid)) = (role, classroom_id) else {
        return Ok(());
    };
    match db::classroom_teacher(conn, cid) {
        Ok(Some(Some(current))) if Some(current.as_str()) != user_id => Err(err(
            &req.id,
            "conflict",
            "Classroom already has a teacher.",
            Some(json!({ "classroomId": cid, "teacherId": current })),
        )),
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(err(&req.id, "not_found", "Classroom not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> JsonValue {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();

    match parse_opt_string(req.params.get("role")) {
        Ok(Some(raw)) => {
            let Some(role) = Role::parse(&raw) else {
                return err(&req.id, "bad_params", "Invalid role specified.", None);
            };
            clauses.push("u.role = ?");
            bind.push(Value::Text(role.as_str().to_string()));
        }
        Ok(None) => {}
        Err(m) => return err(&req.id, "bad_params", format!("role {}", m), None),
    }
    match parse_opt_string(req.params.get("classroomId")) {
        Ok(Some(cid)) => {
            clauses.push("u.classroom_id = ?");
            bind.push(Value::Text(cid));
        }
        Ok(None) => {}
        Err(m) => return err(&req.id, "bad_params", format!("classroomId {}", m), None),
    }
    match parse_bool(req.params.get("unassigned"), false) {
        Ok(true) => clauses.push("u.classroom_id IS NULL"),
        Ok(false) => {}
        Err(m) => return err(&req.id, "bad_params", format!("unassigned {}", m), None),
    }

    let mut sql = USER_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY u.name, u.email");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind), user_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let field = |k: &str| {
        req.params
            .get(k)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let (Some(name), Some(email), Some(role_raw)) = (field("name"), field("email"), field("role"))
    else {
        return err(
            &req.id,
            "bad_params",
            "Name, email, password, and role are required.",
            None,
        );
    };
    // Passwords are taken verbatim; surrounding whitespace is significant.
    let Some(password) = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return err(
            &req.id,
            "bad_params",
            "Name, email, password, and role are required.",
            None,
        );
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(&req.id, "bad_params", "Invalid role specified.", None);
    };
    if !looks_like_email(&email) {
        return err(&req.id, "bad_params", "email is not a valid address", None);
    }

    let accounts = match load_accounts_setup(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if password.chars().count() < accounts.min_password_length {
        return err(
            &req.id,
            "bad_params",
            format!(
                "password must be at least {} characters",
                accounts.min_password_length
            ),
            None,
        );
    }

    let phone = match parse_opt_string(req.params.get("phone")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("phone {}", m), None),
    };
    let gender = match parse_opt_string(req.params.get("gender")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("gender {}", m), None),
    };
    let age = match parse_opt_i64(req.params.get("age")).and_then(check_age) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("age: {}", m), None),
    };
    let classroom_id = match parse_opt_string(req.params.get("classroomId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("classroomId {}", m), None),
    };
    let assigned_by = match parse_opt_string(req.params.get("assignedBy")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("assignedBy {}", m), None),
    };

    match email_taken(conn, &email, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "User with this email already exists.",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(cid) = classroom_id.as_deref() {
        match db::classroom_exists(conn, cid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "Classroom not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Err(e) = check_teacher_slot(conn, req, None, role, classroom_id.as_deref()) {
        return e;
    }
    let password_hash = match hash_password(password) {
        Ok(h) => h,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                format!("could not hash password: {}", e),
                Some(json!({ "table": "users" })),
            )
        }
    };

    let user_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO users(id, name, email, password_hash, phone, age, gender, role, classroom_id, assigned_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            &password_hash,
            &phone,
            age,
            &gender,
            role.as_str(),
            &classroom_id,
            &assigned_by,
            db::now_ts(),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    if let Err(e) = db::sync_teacher_link(&tx, &user_id, role, classroom_id.as_deref()) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classrooms" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(user_id = %user_id, role = role.as_str(), "user created");

    match load_user(conn, &user_id) {
        Ok(Some(user)) => ok(&req.id, json!({ "userId": user_id, "user": user })),
        Ok(None) => err(&req.id, "not_found", "User not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT role, classroom_id FROM users WHERE id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((current_role, current_classroom)) = current else {
        return err(&req.id, "not_found", "User not found", None);
    };
    let Some(current_role) = Role::parse(&current_role) else {
        return err(
            &req.id,
            "db_query_failed",
            format!("stored role is invalid: {}", current_role),
            None,
        );
    };
    let mut next_role: Option<Role> = None;
    let mut next_classroom: Option<Option<String>> = None;

    let mut sets: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    let opt_text = |v: Option<String>| v.map(Value::Text).unwrap_or(Value::Null);

    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "name must not be empty", None);
                };
                sets.push("name = ?");
                bind.push(Value::Text(name.to_string()));
            }
            "email" => {
                let Some(email) = v.as_str().map(str::trim).filter(|s| looks_like_email(s)) else {
                    return err(&req.id, "bad_params", "email is not a valid address", None);
                };
                match email_taken(conn, email, Some(&user_id)) {
                    Ok(true) => {
                        return err(
                            &req.id,
                            "conflict",
                            "User with this email already exists.",
                            None,
                        )
                    }
                    Ok(false) => {}
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
                sets.push("email = ?");
                bind.push(Value::Text(email.to_string()));
            }
            "phone" | "gender" => match parse_opt_string(Some(v)) {
                Ok(s) => {
                    sets.push(if k == "phone" { "phone = ?" } else { "gender = ?" });
                    bind.push(opt_text(s));
                }
                Err(m) => return err(&req.id, "bad_params", format!("{} {}", k, m), None),
            },
            "age" => match parse_opt_i64(Some(v)).and_then(check_age) {
                Ok(a) => {
                    sets.push("age = ?");
                    bind.push(a.map(Value::Integer).unwrap_or(Value::Null));
                }
                Err(m) => return err(&req.id, "bad_params", format!("age: {}", m), None),
            },
            "role" => {
                let Some(role) = v.as_str().and_then(Role::parse) else {
                    return err(&req.id, "bad_params", "Invalid role specified.", None);
                };
                sets.push("role = ?");
                bind.push(Value::Text(role.as_str().to_string()));
                next_role = Some(role);
            }
            "classroomId" => {
                let cid = match parse_opt_string(Some(v)) {
                    Ok(c) => c,
                    Err(m) => {
                        return err(&req.id, "bad_params", format!("classroomId {}", m), None)
                    }
                };
                if let Some(c) = cid.as_deref() {
                    match db::classroom_exists(conn, c) {
                        Ok(true) => {}
                        Ok(false) => {
                            return err(&req.id, "not_found", "Classroom not found", None)
                        }
                        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                    }
                }
                sets.push("classroom_id = ?");
                bind.push(opt_text(cid.clone()));
                next_classroom = Some(cid);
            }
            "password" => {
                let Some(pw) = v.as_str().filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "password must not be empty", None);
                };
                let min = match load_accounts_setup(conn) {
                    Ok(a) => a.min_password_length,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
                if pw.chars().count() < min {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("password must be at least {} characters", min),
                        None,
                    );
                }
                let hashed = match hash_password(pw) {
                    Ok(h) => h,
                    Err(e) => {
                        return err(
                            &req.id,
                            "db_update_failed",
                            format!("could not hash password: {}", e),
                            Some(json!({ "table": "users" })),
                        )
                    }
                };
                sets.push("password_hash = ?");
                bind.push(Value::Text(hashed));
            }
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown user field: {}", k),
                    None,
                )
            }
        }
    }

    let link_changed = next_role.is_some() || next_classroom.is_some();
    let final_role = next_role.unwrap_or(current_role);
    let final_classroom = next_classroom.unwrap_or(current_classroom);
    if link_changed {
        if let Err(e) =
            check_teacher_slot(conn, req, Some(&user_id), final_role, final_classroom.as_deref())
        {
            return e;
        }
    }

    if !sets.is_empty() {
        sets.push("updated_at = ?");
        bind.push(Value::Text(db::now_ts()));
        bind.push(Value::Text(user_id.clone()));
        let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        if let Err(e) = tx.execute(&sql, params_from_iter(bind)) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            );
        }
        if link_changed {
            if let Err(e) =
                db::sync_teacher_link(&tx, &user_id, final_role, final_classroom.as_deref())
            {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "classrooms" })),
                );
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_commit_failed", e.to_string(), None);
        }
        tracing::info!(user_id = %user_id, fields = patch.len(), "user updated");
    }

    match load_user(conn, &user_id) {
        Ok(Some(user)) => ok(&req.id, json!({ "user": user })),
        Ok(None) => err(&req.id, "not_found", "User not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> JsonValue {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match load_user(conn, &user_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "User not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "UPDATE classrooms SET teacher_id = NULL WHERE teacher_id = ?",
        [&user_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classrooms" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(user_id = %user_id, "user deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<JsonValue> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
