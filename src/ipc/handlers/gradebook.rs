use crate::clock::{Clock, SystemClock};
use crate::gpa::{self, CalcError};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile;
use chrono::Duration;
use serde_json::json;

fn calc_err(id: &str, e: CalcError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}

fn handle_gpa_compute_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    match gpa::compute_class_gpa(conn, &student_id, &class_id) {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_gpa_compute_cumulative(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    match gpa::compute_cumulative_gpa(conn, &student_id) {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => calc_err(&req.id, e),
    }
}

/// Admin- or scheduler-triggered reconciliation. Returns the aggregate
/// summary; per-pair failures are listed, never raised.
fn handle_gradebook_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let clock = SystemClock;
    let deadline = req
        .params
        .get("deadlineMs")
        .and_then(|v| v.as_i64())
        .map(|ms| clock.now() + Duration::milliseconds(ms));

    match reconcile::reconcile(conn, class_id.as_deref(), &clock, deadline) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, "reconcile_failed", e.to_string(), None),
    }
}

/// Read surface for display layers: the persisted gradebook, no
/// recomputation.
fn handle_gradebook_records(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let sql = "SELECT g.student_id, g.item_id, i.title, g.score, g.max_score,
                      g.percentage, g.letter_grade, g.created_at
               FROM grade_records g
               JOIN gradable_items i ON i.id = g.item_id
               WHERE i.class_id = ?1
                 AND (?2 IS NULL OR g.student_id = ?2)
               ORDER BY g.student_id, i.due_at, g.item_id";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&class_id, &student_id), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "itemId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "score": r.get::<_, f64>(3)?,
                "maxScore": r.get::<_, f64>(4)?,
                "percentage": r.get::<_, f64>(5)?,
                "letterGrade": r.get::<_, String>(6)?,
                "createdAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(records) => ok(&req.id, json!({ "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gpa.computeClass" => Some(handle_gpa_compute_class(state, req)),
        "gpa.computeCumulative" => Some(handle_gpa_compute_cumulative(state, req)),
        "gradebook.reconcile" => Some(handle_gradebook_reconcile(state, req)),
        "gradebook.records" => Some(handle_gradebook_records(state, req)),
        _ => None,
    }
}
