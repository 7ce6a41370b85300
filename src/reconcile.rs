//! Gradebook reconciliation: every (active/completed enrollment, published
//! item) pair gets exactly one grade_records row, with missing ones
//! backfilled as zero scores. grade_records is written by this module only.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{fmt_ts, Clock};
use crate::grade_source;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairError {
    pub student_id: String,
    pub item_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub reconciled: i64,
    pub failed: i64,
    pub aborted: bool,
    pub errors: Vec<PairError>,
}

/// Runs over one class if given, else every class with active/completed
/// enrollments. Re-entrant: the existence check and the insert are one
/// `INSERT OR IGNORE` against the unique (student_id, item_id) index, so
/// overlapping scheduled runs cannot double-insert and each missing pair is
/// counted by exactly one of them. Existing rows, including earlier zero
/// backfills, are never modified.
///
/// A per-pair insert failure is recorded and the batch continues; only the
/// up-front enumeration queries fail the whole invocation. When `deadline`
/// passes, the batch stops between pairs and reports `aborted`.
pub fn reconcile(
    conn: &Connection,
    class_id: Option<&str>,
    clock: &dyn Clock,
    deadline: Option<DateTime<Utc>>,
) -> anyhow::Result<ReconcileSummary> {
    let enrollments = grade_source::enrollments_for_reconciliation(conn, class_id)?;

    // Enrollments arrive ordered by class; fold them into per-class student
    // lists so items are listed once per class.
    let mut by_class: Vec<(String, Vec<String>)> = Vec::new();
    for e in &enrollments {
        match by_class.last_mut() {
            Some((cid, students)) if *cid == e.class_id => {
                students.push(e.student_id.clone());
            }
            _ => by_class.push((e.class_id.clone(), vec![e.student_id.clone()])),
        }
    }

    let mut summary = ReconcileSummary::default();
    'outer: for (class_id, students) in &by_class {
        let items = grade_source::list_published_items(conn, class_id)?;
        for student_id in students {
            for item in &items {
                if let Some(deadline) = deadline {
                    if clock.now() >= deadline {
                        summary.aborted = true;
                        break 'outer;
                    }
                }
                match insert_zero_if_missing(conn, student_id, item, clock.now()) {
                    Ok(true) => summary.reconciled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        summary.failed += 1;
                        summary.errors.push(PairError {
                            student_id: student_id.clone(),
                            item_id: item.id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    Ok(summary)
}

/// One statement carries both the existence check and the insert. Returns
/// whether a row was actually created.
fn insert_zero_if_missing(
    conn: &Connection,
    student_id: &str,
    item: &grade_source::GradableItem,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let record_id = Uuid::new_v4().to_string();
    let n = conn.execute(
        "INSERT OR IGNORE INTO grade_records(
            id, student_id, item_id, score, max_score, percentage,
            letter_grade, published, created_at)
         VALUES(?, ?, ?, 0, ?, 0, 'F', 1, ?)",
        (
            &record_id,
            student_id,
            &item.id,
            item.max_score,
            fmt_ts(now),
        ),
    )?;
    Ok(n == 1)
}
