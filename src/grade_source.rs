//! Normalized read layer over the external grading facts. Submission and
//! quiz-attempt tables are the source of truth for completion; everything
//! downstream (GPA, reconciliation, reminders) goes through these views and
//! never reads those tables directly.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Assignment,
    Quiz,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Assignment => "assignment",
            ItemKind::Quiz => "quiz",
        }
    }

    pub fn parse(s: &str) -> Option<ItemKind> {
        match s {
            "assignment" => Some(ItemKind::Assignment),
            "quiz" => Some(ItemKind::Quiz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradableItem {
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub max_score: f64,
    pub due_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub completed: bool,
    pub earned_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub student_id: String,
    pub class_id: String,
    pub status: String,
}

pub fn list_published_items(
    conn: &Connection,
    class_id: &str,
) -> rusqlite::Result<Vec<GradableItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, title, max_score, due_at
         FROM gradable_items
         WHERE class_id = ? AND published = 1
         ORDER BY due_at, id",
    )?;
    let items = stmt
        .query_map([class_id], |r| {
            let kind_raw: String = r.get(1)?;
            Ok(GradableItem {
                id: r.get(0)?,
                kind: ItemKind::parse(&kind_raw).unwrap_or(ItemKind::Assignment),
                title: r.get(2)?,
                max_score: r.get(3)?,
                due_at: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// The completion predicate is deliberately asymmetric between kinds:
/// an assignment counts as completed once any submission row exists, while
/// a quiz needs an attempt with status `completed`. Earned credit is only
/// reported for graded submissions / completed attempts; everything else is
/// zero-credit at the GPA layer.
pub fn completion_for(
    conn: &Connection,
    item: &GradableItem,
    student_id: &str,
) -> rusqlite::Result<Completion> {
    match item.kind {
        ItemKind::Assignment => {
            let row: Option<(Option<f64>, i64)> = conn
                .query_row(
                    "SELECT earned_score, graded FROM submissions
                     WHERE item_id = ? AND student_id = ?",
                    (&item.id, student_id),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                None => Completion {
                    completed: false,
                    earned_score: None,
                },
                Some((earned, graded)) => Completion {
                    completed: true,
                    earned_score: if graded != 0 { earned } else { None },
                },
            })
        }
        ItemKind::Quiz => {
            // Best completed attempt wins; retakeable quizzes keep the
            // highest score.
            let row: Option<Option<f64>> = conn
                .query_row(
                    "SELECT MAX(earned_score) FROM quiz_attempts
                     WHERE item_id = ? AND student_id = ? AND status = 'completed'",
                    (&item.id, student_id),
                    |r| r.get(0),
                )
                .optional()?;
            let completed: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM quiz_attempts
                    WHERE item_id = ? AND student_id = ? AND status = 'completed')",
                (&item.id, student_id),
                |r| r.get::<_, i64>(0).map(|v| v != 0),
            )?;
            Ok(Completion {
                completed,
                earned_score: row.flatten(),
            })
        }
    }
}

fn enrollments_with_statuses(
    conn: &Connection,
    class_id: Option<&str>,
    statuses: &str,
) -> rusqlite::Result<Vec<Enrollment>> {
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(Enrollment {
            student_id: r.get(0)?,
            class_id: r.get(1)?,
            status: r.get(2)?,
        })
    };
    match class_id {
        Some(cid) => {
            let sql = format!(
                "SELECT student_id, class_id, status FROM enrollments
                 WHERE class_id = ? AND status IN ({statuses})
                 ORDER BY class_id, student_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([cid], map_row)?;
            rows.collect()
        }
        None => {
            let sql = format!(
                "SELECT student_id, class_id, status FROM enrollments
                 WHERE status IN ({statuses})
                 ORDER BY class_id, student_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], map_row)?;
            rows.collect()
        }
    }
}

/// Active and completed enrollments participate in GPA and reconciliation;
/// withdrawn ones never do.
pub fn enrollments_for_reconciliation(
    conn: &Connection,
    class_id: Option<&str>,
) -> rusqlite::Result<Vec<Enrollment>> {
    enrollments_with_statuses(conn, class_id, "'active','completed'")
}

/// Only active enrollments receive reminders.
pub fn active_enrollments(
    conn: &Connection,
    class_id: Option<&str>,
) -> rusqlite::Result<Vec<Enrollment>> {
    enrollments_with_statuses(conn, class_id, "'active'")
}
