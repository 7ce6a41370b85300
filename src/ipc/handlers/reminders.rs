use crate::clock::{parse_ts, Clock, SystemClock};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::OutboxNotifier;
use crate::reminders;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

fn parse_now(req: &Request) -> Result<DateTime<Utc>, serde_json::Value> {
    match req.params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => parse_ts(raw).map_err(|_| {
            err(
                &req.id,
                "bad_params",
                "now must be an RFC3339 timestamp",
                Some(json!({ "now": raw })),
            )
        }),
        None => Ok(SystemClock.now()),
    }
}

fn parse_horizon(req: &Request) -> Result<Duration, serde_json::Value> {
    match req.params.get("horizonHours").and_then(|v| v.as_i64()) {
        Some(h) if h > 0 => Ok(Duration::hours(h)),
        Some(h) => Err(err(
            &req.id,
            "bad_params",
            "horizonHours must be > 0",
            Some(json!({ "horizonHours": h })),
        )),
        None => Ok(Duration::hours(reminders::DEFAULT_HORIZON_HOURS)),
    }
}

fn handle_reminders_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let horizon = match parse_horizon(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match reminders::select_due_soon(conn, now, horizon) {
        Ok(candidates) => match serde_json::to_value(&candidates) {
            Ok(v) => ok(&req.id, json!({ "candidates": v })),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reminders_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let horizon = match parse_horizon(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let clock = SystemClock;
    // The batch deadline is wall-clock; `now` may be pinned by the caller
    // for window math without shortening the run.
    let deadline = req
        .params
        .get("deadlineMs")
        .and_then(|v| v.as_i64())
        .map(|ms| clock.now() + Duration::milliseconds(ms));
    let notifier = OutboxNotifier::new(conn, now);
    match reminders::run_reminders(conn, &notifier, &clock, now, horizon, deadline) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, "dispatch_failed", e.to_string(), None),
    }
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, message, type, related_id, created_at, read
         FROM notifications WHERE user_id = ? ORDER BY created_at DESC, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "type": r.get::<_, String>(3)?,
                "relatedId": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "read": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(notifications) => ok(&req.id, json!({ "notifications": notifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_outbox_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = req
        .params
        .get("userId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut stmt = match conn.prepare(
        "SELECT id, user_id, subject, body, queued_at, delivery_state
         FROM email_outbox
         WHERE (?1 IS NULL OR user_id = ?1)
         ORDER BY queued_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "queuedAt": r.get::<_, String>(4)?,
                "deliveryState": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(emails) => ok(&req.id, json!({ "emails": emails })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reminders.preview" => Some(handle_reminders_preview(state, req)),
        "reminders.run" => Some(handle_reminders_run(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        "outbox.list" => Some(handle_outbox_list(state, req)),
        _ => None,
    }
}
