mod aggregate;
mod buckets;
mod db;
mod error;
mod evaluate;
mod ipc;
mod logging;
mod model;
mod selection;
mod settings;
mod standing;
mod store;

use std::io::{self, BufRead, Write};

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("selectiond: logging disabled: {e}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "selectiond started");

    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; answer anyway so the caller isn't left waiting.
                tracing::warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, exiting");
}
