use std::path::PathBuf;

const WORKSPACE_VAR: &str = "STUDIUMD_WORKSPACE";
const LOG_VAR: &str = "STUDIUMD_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

/// Process-level settings. Everything per-school lives in the workspace `settings` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            workspace: non_empty(WORKSPACE_VAR).map(PathBuf::from),
            log_filter: non_empty(LOG_VAR)
                .or_else(|| non_empty("RUST_LOG"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}
