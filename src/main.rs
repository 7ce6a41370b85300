mod backup;
mod clock;
mod db;
mod gpa;
mod grade_source;
mod ipc;
mod notify;
mod reconcile;
mod reminders;

use std::io::{self, BufRead, Write};

/// Newline-delimited JSON over stdin/stdout. The portal front end owns the
/// process and serializes requests, so there is one request in flight at a
/// time.
fn main() {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // No request id to echo back.
                serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
