use crate::clock::{fmt_ts, parse_ts, Clock, SystemClock};
use crate::grade_source::ItemKind;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const QUIZ_ATTEMPT_STATUSES: [&str; 2] = ["in_progress", "completed"];

fn handle_items_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let kind = match req.params.get("kind").and_then(|v| v.as_str()) {
        Some(v) => match ItemKind::parse(v) {
            Some(k) => k,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "kind must be one of: assignment, quiz",
                    Some(json!({ "kind": v })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing kind", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(v) if v >= 0.0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "maxScore must be >= 0",
                Some(json!({ "maxScore": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing maxScore", None),
    };
    let due_at = match req.params.get("dueAt").and_then(|v| v.as_str()) {
        Some(v) => match parse_ts(v) {
            Ok(dt) => fmt_ts(dt),
            Err(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "dueAt must be an RFC3339 timestamp",
                    Some(json!({ "dueAt": v })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing dueAt", None),
    };
    let published = req
        .params
        .get("published")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let class_exists: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional();
    match class_exists {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "class not found",
                Some(json!({ "classId": class_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO gradable_items(id, class_id, kind, title, max_score, due_at, published)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &item_id,
            &class_id,
            kind.as_str(),
            &title,
            max_score,
            &due_at,
            published as i64,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "itemId": item_id }))
}

fn handle_items_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let published = match req.params.get("published").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing published", None),
    };

    match conn.execute(
        "UPDATE gradable_items SET published = ? WHERE id = ?",
        (published as i64, &item_id),
    ) {
        Ok(0) => err(
            &req.id,
            "not_found",
            "item not found",
            Some(json!({ "itemId": item_id })),
        ),
        Ok(_) => ok(&req.id, json!({ "published": published })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

/// Records the external submission fact for an assignment. Upserts on the
/// (item, student) unique pair so re-grading replaces the earlier fact.
fn handle_submissions_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let earned_score = req.params.get("earnedScore").and_then(|v| v.as_f64());
    if let Some(v) = earned_score {
        if v < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "negative scores are not allowed",
                Some(json!({ "earnedScore": v })),
            );
        }
    }
    let graded = req
        .params
        .get("graded")
        .and_then(|v| v.as_bool())
        .unwrap_or(earned_score.is_some());
    let submitted_at = match req.params.get("submittedAt").and_then(|v| v.as_str()) {
        Some(v) => match parse_ts(v) {
            Ok(dt) => fmt_ts(dt),
            Err(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "submittedAt must be an RFC3339 timestamp",
                    Some(json!({ "submittedAt": v })),
                )
            }
        },
        None => fmt_ts(SystemClock.now()),
    };

    let kind = match item_kind(conn, &item_id) {
        Ok(Some(k)) => k,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "item not found",
                Some(json!({ "itemId": item_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if kind != ItemKind::Assignment {
        return err(
            &req.id,
            "bad_params",
            "submissions.record applies to assignments; use quizzes.recordAttempt",
            Some(json!({ "itemId": item_id })),
        );
    }

    let submission_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO submissions(id, item_id, student_id, submitted_at, earned_score, graded)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(item_id, student_id) DO UPDATE SET
           submitted_at = excluded.submitted_at,
           earned_score = excluded.earned_score,
           graded = excluded.graded",
        (
            &submission_id,
            &item_id,
            &student_id,
            &submitted_at,
            earned_score,
            graded as i64,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({}))
}

fn handle_quizzes_record_attempt(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) if QUIZ_ATTEMPT_STATUSES.contains(&v) => v.to_string(),
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: in_progress, completed",
                Some(json!({ "status": other })),
            )
        }
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    let earned_score = req.params.get("earnedScore").and_then(|v| v.as_f64());
    if let Some(v) = earned_score {
        if v < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "negative scores are not allowed",
                Some(json!({ "earnedScore": v })),
            );
        }
    }

    let kind = match item_kind(conn, &item_id) {
        Ok(Some(k)) => k,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "item not found",
                Some(json!({ "itemId": item_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e, None),
    };
    if kind != ItemKind::Quiz {
        return err(
            &req.id,
            "bad_params",
            "quizzes.recordAttempt applies to quizzes; use submissions.record",
            Some(json!({ "itemId": item_id })),
        );
    }

    let now = fmt_ts(SystemClock.now());
    let finished_at = if status == "completed" {
        Some(now.clone())
    } else {
        None
    };
    let attempt_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO quiz_attempts(id, item_id, student_id, status, earned_score, started_at, finished_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &attempt_id,
            &item_id,
            &student_id,
            &status,
            earned_score,
            &now,
            &finished_at,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "attemptId": attempt_id }))
}

fn item_kind(
    conn: &rusqlite::Connection,
    item_id: &str,
) -> Result<Option<ItemKind>, String> {
    conn.query_row(
        "SELECT kind FROM gradable_items WHERE id = ?",
        [item_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map(|kind| kind.and_then(|k| ItemKind::parse(&k)))
    .map_err(|e| e.to_string())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "items.create" => Some(handle_items_create(state, req)),
        "items.publish" => Some(handle_items_publish(state, req)),
        "submissions.record" => Some(handle_submissions_record(state, req)),
        "quizzes.recordAttempt" => Some(handle_quizzes_record_attempt(state, req)),
        _ => None,
    }
}
