mod accounts;
mod config;
mod db;
mod ipc;
mod timetable;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn main() {
    let config = config::Config::from_env();

    // stdout carries the IPC channel; logs go to stderr.
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "studiumd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = config.workspace.clone() {
        if let Err(e) = state.select_workspace(path) {
            tracing::error!(error = %e, "could not open workspace from environment");
        }
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut stdout = io::stdout();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match input.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        }

        let resp = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match serde_json::from_str::<ipc::Request>(line) {
                Ok(req) => ipc::handle_request(&mut state, req),
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable request line");
                    ipc::bad_json(e.to_string())
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "request line is not utf-8");
                ipc::bad_json(format!("request is not valid UTF-8: {}", e))
            }
        };

        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::debug!("stdin closed, exiting");
}
