use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 6;

#[derive(Clone, Copy)]
enum SetupSection {
    Timetables,
    Accounts,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "timetables" => Some(Self::Timetables),
            "accounts" => Some(Self::Accounts),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Timetables => "setup.timetables",
            Self::Accounts => "setup.accounts",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Timetables => json!({
            "maxSessions": DEFAULT_MAX_SESSIONS
        }),
        SetupSection::Accounts => json!({
            "minPasswordLength": DEFAULT_MIN_PASSWORD_LENGTH
        }),
    }
}

#[derive(Clone, Debug)]
pub struct TimetablesSetup {
    pub max_sessions: usize,
}

impl Default for TimetablesSetup {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AccountsSetup {
    pub min_password_length: usize,
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Timetables => match k.as_str() {
                "maxSessions" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 500)?));
                }
                _ => return Err(format!("unknown timetables field: {}", k)),
            },
            SetupSection::Accounts => match k.as_str() {
                "minPasswordLength" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 128)?));
                }
                _ => return Err(format!("unknown accounts field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(section = section.key(), error = %e, "ignoring saved setting");
                }
            }
        }
    }
    Ok(current)
}

fn section_usize(value: &Value, key: &str, fallback: usize) -> usize {
    value
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(fallback)
}

pub fn load_timetables_setup(conn: &Connection) -> anyhow::Result<TimetablesSetup> {
    let v = load_section(conn, SetupSection::Timetables)?;
    Ok(TimetablesSetup {
        max_sessions: section_usize(&v, "maxSessions", DEFAULT_MAX_SESSIONS),
    })
}

pub fn load_accounts_setup(conn: &Connection) -> anyhow::Result<AccountsSetup> {
    let v = load_section(conn, SetupSection::Accounts)?;
    Ok(AccountsSetup {
        min_password_length: section_usize(&v, "minPasswordLength", DEFAULT_MIN_PASSWORD_LENGTH),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let timetables = match load_section(conn, SetupSection::Timetables) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let accounts = match load_section(conn, SetupSection::Accounts) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "timetables": timetables,
            "accounts": accounts
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
