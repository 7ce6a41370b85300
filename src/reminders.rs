use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{fmt_ts, Clock};
use crate::grade_source::ItemKind;
use crate::notify::Notifier;

pub const DEFAULT_HORIZON_HOURS: i64 = 48;
pub const DEDUP_WINDOW_HOURS: i64 = 24;

pub const ASSIGNMENT_REMINDER: &str = "assignment_reminder";
pub const QUIZ_REMINDER: &str = "quiz_reminder";

pub fn notification_type_for(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Assignment => ASSIGNMENT_REMINDER,
        ItemKind::Quiz => QUIZ_REMINDER,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderCandidate {
    pub user_id: String,
    pub item_id: String,
    pub item_kind: ItemKind,
    pub title: String,
    pub due_at: String,
    pub already_reminded: bool,
}

/// Published items closing within `[now, now + horizon]` that an actively
/// enrolled student has not completed. The not-completed predicate is
/// kind-specific: assignments look for any submission row, quizzes for an
/// attempt with status `completed`. `already_reminded` is advisory only;
/// `try_reserve` stays the authoritative gate at send time.
pub fn select_due_soon(
    conn: &Connection,
    now: DateTime<Utc>,
    horizon: Duration,
) -> anyhow::Result<Vec<ReminderCandidate>> {
    let window_start = fmt_ts(now);
    let window_end = fmt_ts(now + horizon);
    let dedup_cutoff = fmt_ts(now - Duration::hours(DEDUP_WINDOW_HOURS));

    let mut stmt = conn.prepare(
        "SELECT e.student_id, i.id, i.kind, i.title, i.due_at,
                EXISTS(
                    SELECT 1 FROM reminder_log rl
                    WHERE rl.user_id = e.student_id
                      AND rl.item_id = i.id
                      AND rl.notification_type =
                          CASE i.kind WHEN 'quiz' THEN 'quiz_reminder'
                                      ELSE 'assignment_reminder' END
                      AND rl.sent_at > ?3) AS already_reminded
         FROM gradable_items i
         JOIN enrollments e
           ON e.class_id = i.class_id AND e.status = 'active'
         WHERE i.published = 1
           AND i.due_at >= ?1 AND i.due_at <= ?2
           AND (
                (i.kind = 'assignment' AND NOT EXISTS(
                    SELECT 1 FROM submissions s
                    WHERE s.item_id = i.id AND s.student_id = e.student_id))
             OR (i.kind = 'quiz' AND NOT EXISTS(
                    SELECT 1 FROM quiz_attempts qa
                    WHERE qa.item_id = i.id
                      AND qa.student_id = e.student_id
                      AND qa.status = 'completed'))
           )
         ORDER BY i.due_at, i.id, e.student_id",
    )?;

    let candidates = stmt
        .query_map((&window_start, &window_end, &dedup_cutoff), |r| {
            let kind_raw: String = r.get(2)?;
            Ok(ReminderCandidate {
                user_id: r.get(0)?,
                item_id: r.get(1)?,
                item_kind: ItemKind::parse(&kind_raw).unwrap_or(ItemKind::Assignment),
                title: r.get(3)?,
                due_at: r.get(4)?,
                already_reminded: r.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(candidates)
}

/// Rate-limiting primitive: at most one reminder per (user, item, type)
/// within the rolling 24h window. The existence check and the insert are a
/// single statement, so concurrent dispatchers (including other processes)
/// cannot both be granted the same key. Knows nothing about why a reminder
/// fires; any future notification kind can reuse it.
pub fn try_reserve(
    conn: &Connection,
    user_id: &str,
    item_id: &str,
    notification_type: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let id = Uuid::new_v4().to_string();
    let cutoff = fmt_ts(now - Duration::hours(DEDUP_WINDOW_HOURS));
    let n = conn.execute(
        "INSERT INTO reminder_log(id, user_id, item_id, notification_type, sent_at)
         SELECT ?1, ?2, ?3, ?4, ?5
         WHERE NOT EXISTS(
             SELECT 1 FROM reminder_log
             WHERE user_id = ?2 AND item_id = ?3
               AND notification_type = ?4 AND sent_at > ?6)",
        (
            &id,
            user_id,
            item_id,
            notification_type,
            fmt_ts(now),
            &cutoff,
        ),
    )?;
    Ok(n == 1)
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub sent: i64,
    pub skipped: i64,
    pub send_failures: i64,
    pub aborted: bool,
}

fn render_reminder(candidate: &ReminderCandidate) -> (String, String) {
    match candidate.item_kind {
        ItemKind::Assignment => (
            format!("Assignment due soon: {}", candidate.title),
            format!(
                "Your assignment \"{}\" is due {}. Submit it before the deadline to receive credit.",
                candidate.title, candidate.due_at
            ),
        ),
        ItemKind::Quiz => (
            format!("Quiz closing soon: {}", candidate.title),
            format!(
                "The quiz \"{}\" closes {}. Complete an attempt before it closes to receive credit.",
                candidate.title, candidate.due_at
            ),
        ),
    }
}

/// Selector -> gate -> notifier. A candidate whose advisory flag is set is
/// skipped without touching the gate; everything else must win the gate
/// before any send. A failed send keeps its reservation: the dedup window
/// is consumed, so the recipient gets no duplicate when the batch re-runs
/// (no-duplicate beats guaranteed-delivery-within-window). Send failures
/// are counted per recipient and never abort the batch.
pub fn run_reminders(
    conn: &Connection,
    notifier: &dyn Notifier,
    clock: &dyn Clock,
    now: DateTime<Utc>,
    horizon: Duration,
    deadline: Option<DateTime<Utc>>,
) -> anyhow::Result<DispatchSummary> {
    let candidates = select_due_soon(conn, now, horizon)?;

    let mut summary = DispatchSummary::default();
    for candidate in &candidates {
        if let Some(deadline) = deadline {
            if clock.now() >= deadline {
                summary.aborted = true;
                break;
            }
        }
        if candidate.already_reminded {
            summary.skipped += 1;
            continue;
        }

        let notification_type = notification_type_for(candidate.item_kind);
        let granted = try_reserve(
            conn,
            &candidate.user_id,
            &candidate.item_id,
            notification_type,
            now,
        )?;
        if !granted {
            summary.skipped += 1;
            continue;
        }

        let (subject, body) = render_reminder(candidate);
        let email = notifier.send(&candidate.user_id, &subject, &body);
        let in_app = notifier.create_in_app(
            &candidate.user_id,
            &subject,
            &body,
            notification_type,
            &candidate.item_id,
        );
        if email.is_err() || in_app.is_err() {
            summary.send_failures += 1;
        } else {
            summary.sent += 1;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db;
    use crate::notify::OutboxNotifier;
    use chrono::TimeZone;
    use std::cell::RefCell;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap()
    }

    fn seed_roster(conn: &Connection) {
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', 'Algebra')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO students(id, last_name, first_name) VALUES('s1', 'Lee', 'Avery')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO enrollments(class_id, student_id, status) VALUES('c1', 's1', 'active')",
            [],
        )
        .unwrap();
    }

    fn seed_item(conn: &Connection, id: &str, kind: &str, due_at: &str) {
        conn.execute(
            "INSERT INTO gradable_items(id, class_id, kind, title, max_score, due_at, published)
             VALUES(?, 'c1', ?, ?, 10.0, ?, 1)",
            (id, kind, id, due_at),
        )
        .unwrap();
    }

    #[test]
    fn reserve_grants_once_per_rolling_window() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-10T17:00:00Z");

        assert!(try_reserve(&conn, "s1", "hw", ASSIGNMENT_REMINDER, t0()).unwrap());
        assert!(!try_reserve(&conn, "s1", "hw", ASSIGNMENT_REMINDER, t0() + Duration::hours(1)).unwrap());
        assert!(try_reserve(&conn, "s1", "hw", ASSIGNMENT_REMINDER, t0() + Duration::hours(25)).unwrap());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM reminder_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn reserve_keys_are_independent() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-10T17:00:00Z");
        seed_item(&conn, "qz", "quiz", "2026-03-10T17:00:00Z");

        assert!(try_reserve(&conn, "s1", "hw", ASSIGNMENT_REMINDER, t0()).unwrap());
        // Different item and different type are separate keys.
        assert!(try_reserve(&conn, "s1", "qz", QUIZ_REMINDER, t0()).unwrap());
        assert!(try_reserve(&conn, "s1", "hw", "grade_posted", t0()).unwrap());
    }

    #[test]
    fn selector_honors_horizon_bounds() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "due-10h", "assignment", "2026-03-09T18:00:00Z");
        seed_item(&conn, "due-72h", "assignment", "2026-03-12T08:00:00Z");
        seed_item(&conn, "past-due", "assignment", "2026-03-09T07:00:00Z");

        let out = select_due_soon(&conn, t0(), Duration::hours(48)).unwrap();
        let ids: Vec<&str> = out.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["due-10h"]);
    }

    #[test]
    fn selector_excludes_completed_work_asymmetrically() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");
        seed_item(&conn, "qz", "quiz", "2026-03-09T18:00:00Z");
        // Any submission row silences an assignment reminder, graded or not.
        conn.execute(
            "INSERT INTO submissions(id, item_id, student_id, submitted_at, graded)
             VALUES('sub1', 'hw', 's1', '2026-03-09T07:30:00Z', 0)",
            [],
        )
        .unwrap();
        // An in-progress attempt does NOT silence a quiz reminder.
        conn.execute(
            "INSERT INTO quiz_attempts(id, item_id, student_id, status)
             VALUES('at1', 'qz', 's1', 'in_progress')",
            [],
        )
        .unwrap();

        let out = select_due_soon(&conn, t0(), Duration::hours(48)).unwrap();
        let ids: Vec<&str> = out.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["qz"]);

        conn.execute(
            "INSERT INTO quiz_attempts(id, item_id, student_id, status, earned_score)
             VALUES('at2', 'qz', 's1', 'completed', 7.0)",
            [],
        )
        .unwrap();
        let out = select_due_soon(&conn, t0(), Duration::hours(48)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn selector_skips_inactive_enrollments_and_unpublished_items() {
        let conn = test_conn();
        seed_roster(&conn);
        conn.execute(
            "INSERT INTO students(id, last_name, first_name) VALUES('s2', 'Moreno', 'Jules')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO enrollments(class_id, student_id, status) VALUES('c1', 's2', 'completed')",
            [],
        )
        .unwrap();
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");
        conn.execute(
            "INSERT INTO gradable_items(id, class_id, kind, title, max_score, due_at, published)
             VALUES('draft', 'c1', 'assignment', 'draft', 10.0, '2026-03-09T18:00:00Z', 0)",
            [],
        )
        .unwrap();

        let out = select_due_soon(&conn, t0(), Duration::hours(48)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].user_id, "s1");
        assert_eq!(out[0].item_id, "hw");
    }

    #[test]
    fn selector_flags_already_reminded() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");

        assert!(try_reserve(&conn, "s1", "hw", ASSIGNMENT_REMINDER, t0()).unwrap());
        let out = select_due_soon(&conn, t0() + Duration::hours(1), Duration::hours(48)).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].already_reminded);
    }

    #[test]
    fn dispatch_sends_email_and_in_app_once() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");
        seed_item(&conn, "qz", "quiz", "2026-03-10T18:00:00Z");

        let clock = FixedClock(t0());
        let notifier = OutboxNotifier::new(&conn, t0());
        let summary = run_reminders(
            &conn,
            &notifier,
            &clock,
            t0(),
            Duration::hours(DEFAULT_HORIZON_HOURS),
            None,
        )
        .unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.send_failures, 0);

        let emails: i64 = conn
            .query_row("SELECT COUNT(*) FROM email_outbox WHERE user_id = 's1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let in_app: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications WHERE user_id = 's1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(emails, 2);
        assert_eq!(in_app, 2);

        // Second run within the window: the advisory flag short-circuits,
        // nothing new is sent or queued.
        let rerun = run_reminders(
            &conn,
            &notifier,
            &clock,
            t0() + Duration::hours(1),
            Duration::hours(DEFAULT_HORIZON_HOURS),
            None,
        )
        .unwrap();
        assert_eq!(rerun.sent, 0);
        assert_eq!(rerun.skipped, 2);
        let emails_after: i64 = conn
            .query_row("SELECT COUNT(*) FROM email_outbox", [], |r| r.get(0))
            .unwrap();
        assert_eq!(emails_after, 2);
    }

    struct FailingNotifier {
        attempts: RefCell<usize>,
    }

    impl Notifier for FailingNotifier {
        fn send(&self, _user_id: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
            *self.attempts.borrow_mut() += 1;
            Err(anyhow::anyhow!("smtp relay unreachable"))
        }

        fn create_in_app(
            &self,
            _user_id: &str,
            _title: &str,
            _message: &str,
            _kind: &str,
            _related_id: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn send_failure_keeps_reservation() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");

        let clock = FixedClock(t0());
        let failing = FailingNotifier {
            attempts: RefCell::new(0),
        };
        let summary = run_reminders(
            &conn,
            &failing,
            &clock,
            t0(),
            Duration::hours(48),
            None,
        )
        .unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.send_failures, 1);
        assert_eq!(*failing.attempts.borrow(), 1);

        // The window is consumed: a retry inside 24h does not attempt the
        // send again.
        let retry = run_reminders(
            &conn,
            &failing,
            &clock,
            t0() + Duration::hours(2),
            Duration::hours(48),
            None,
        )
        .unwrap();
        assert_eq!(retry.sent, 0);
        assert_eq!(retry.send_failures, 0);
        assert_eq!(retry.skipped, 1);
        assert_eq!(*failing.attempts.borrow(), 1);
    }

    #[test]
    fn expired_deadline_aborts_dispatch() {
        let conn = test_conn();
        seed_roster(&conn);
        seed_item(&conn, "hw", "assignment", "2026-03-09T18:00:00Z");

        let clock = FixedClock(t0());
        let notifier = OutboxNotifier::new(&conn, t0());
        let summary = run_reminders(
            &conn,
            &notifier,
            &clock,
            t0(),
            Duration::hours(48),
            Some(t0() - Duration::minutes(1)),
        )
        .unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.sent, 0);
        let logged: i64 = conn
            .query_row("SELECT COUNT(*) FROM reminder_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 0);
    }
}
