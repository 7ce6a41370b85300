use crate::clock::{fmt_ts, Clock, SystemClock};
use crate::grade_source;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const ENROLLMENT_STATUSES: [&str; 3] = ["active", "completed", "withdrawn"];

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let code = req
        .params
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, code) VALUES(?, ?, ?)",
        (&class_id, &name, &code),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, email, active) VALUES(?, ?, ?, ?, 1)",
        (&student_id, &last_name, &first_name, &email),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_enrollments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) if ENROLLMENT_STATUSES.contains(&v) => v.to_string(),
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: active, completed, withdrawn",
                Some(json!({ "status": other })),
            )
        }
        None => "active".to_string(),
    };

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
    let student_exists: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional();
    match student_exists {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "studentId": student_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let enrolled_at = fmt_ts(SystemClock.now());
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(class_id, student_id, status, enrolled_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, student_id) DO UPDATE SET status = excluded.status",
        (&class_id, &student_id, &status, &enrolled_at),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "status": status }))
}

/// Active enrollments only, matching what the reminder path sees.
fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match grade_source::active_enrollments(conn, class_id.as_deref()) {
        Ok(enrollments) => {
            let rows: Vec<serde_json::Value> = enrollments
                .iter()
                .map(|e| {
                    json!({
                        "classId": e.class_id,
                        "studentId": e.student_id,
                        "status": e.status,
                    })
                })
                .collect();
            ok(&req.id, json!({ "enrollments": rows }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "enrollments.set" => Some(handle_enrollments_set(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
