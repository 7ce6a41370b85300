use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::grade_source::{self, ItemKind};

/// House 1-decimal rounding: `floor(10*x + 0.5) / 10`. Reported
/// percentages use this, and both grade mappings are applied to the
/// rounded value so a displayed percentage never disagrees with its
/// displayed letter or GPA at a bucket edge.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Coarse report-card letter. Kept separate from `grade_points` below; the
/// two scales have different granularities on purpose.
pub fn letter_grade(percentage: f64) -> &'static str {
    if percentage >= 90.0 {
        "A"
    } else if percentage >= 80.0 {
        "B"
    } else if percentage >= 70.0 {
        "C"
    } else if percentage >= 60.0 {
        "D"
    } else {
        "F"
    }
}

/// Fine-grained 4.0-scale step table used for transcript GPA. Do not fold
/// into `letter_grade`.
pub fn grade_points(percentage: f64) -> f64 {
    if percentage >= 93.0 {
        4.0
    } else if percentage >= 90.0 {
        3.7
    } else if percentage >= 87.0 {
        3.3
    } else if percentage >= 83.0 {
        3.0
    } else if percentage >= 80.0 {
        2.7
    } else if percentage >= 77.0 {
        2.3
    } else if percentage >= 73.0 {
        2.0
    } else if percentage >= 70.0 {
        1.7
    } else if percentage >= 67.0 {
        1.3
    } else if percentage >= 63.0 {
        1.0
    } else if percentage >= 60.0 {
        0.7
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCredit {
    pub item_id: String,
    pub title: String,
    pub kind: ItemKind,
    pub earned: f64,
    pub max_score: f64,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGpa {
    pub class_id: String,
    pub percentage: f64,
    pub letter_grade: String,
    pub gpa: f64,
    pub items: Vec<ItemCredit>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeGpa {
    pub cumulative_gpa: f64,
    pub classes_taken: usize,
    pub per_class: Vec<ClassGpa>,
}

/// Live read path for dashboards. Pure: no writes, safe to call repeatedly
/// and concurrently with reconciliation. Unsubmitted or ungraded work
/// counts as zero credit against the full published max.
pub fn compute_class_gpa(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
) -> Result<ClassGpa, CalcError> {
    let class_exists: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if class_exists.is_none() {
        return Err(CalcError::new("not_found", "class not found"));
    }
    let student_exists: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if student_exists.is_none() {
        return Err(CalcError::new("not_found", "student not found"));
    }

    let items = grade_source::list_published_items(conn, class_id)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut sum_earned = 0.0_f64;
    let mut sum_max = 0.0_f64;
    let mut credits: Vec<ItemCredit> = Vec::with_capacity(items.len());
    for item in &items {
        let completion = grade_source::completion_for(conn, item, student_id)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let earned = completion.earned_score.unwrap_or(0.0);
        sum_earned += earned;
        sum_max += item.max_score;
        credits.push(ItemCredit {
            item_id: item.id.clone(),
            title: item.title.clone(),
            kind: item.kind,
            earned,
            max_score: item.max_score,
            completed: completion.completed,
        });
    }

    let percentage = if sum_max > 0.0 {
        round_off_1_decimal(100.0 * sum_earned / sum_max)
    } else {
        0.0
    };

    Ok(ClassGpa {
        class_id: class_id.to_string(),
        percentage,
        letter_grade: letter_grade(percentage).to_string(),
        gpa: grade_points(percentage),
        items: credits,
    })
}

/// Unweighted arithmetic mean of per-class GPA over every class with an
/// active or completed enrollment. Not weighted by item count or credit
/// hours.
pub fn compute_cumulative_gpa(
    conn: &Connection,
    student_id: &str,
) -> Result<CumulativeGpa, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT class_id FROM enrollments
             WHERE student_id = ? AND status IN ('active', 'completed')
             ORDER BY class_id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let class_ids: Vec<String> = stmt
        .query_map([student_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut per_class: Vec<ClassGpa> = Vec::with_capacity(class_ids.len());
    for class_id in &class_ids {
        per_class.push(compute_class_gpa(conn, student_id, class_id)?);
    }

    let cumulative_gpa = if per_class.is_empty() {
        0.0
    } else {
        per_class.iter().map(|c| c.gpa).sum::<f64>() / per_class.len() as f64
    };

    Ok(CumulativeGpa {
        cumulative_gpa,
        classes_taken: per_class.len(),
        per_class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_class(conn: &Connection, class_id: &str, student_id: &str, status: &str) {
        conn.execute(
            "INSERT INTO classes(id, name) VALUES(?, ?)",
            (class_id, "Algebra"),
        )
        .unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO students(id, last_name, first_name, active)
             VALUES(?, 'Lee', 'Avery', 1)",
            [student_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO enrollments(class_id, student_id, status) VALUES(?, ?, ?)",
            (class_id, student_id, status),
        )
        .unwrap();
    }

    fn seed_item(
        conn: &Connection,
        item_id: &str,
        class_id: &str,
        kind: &str,
        max_score: f64,
        published: bool,
    ) {
        conn.execute(
            "INSERT INTO gradable_items(id, class_id, kind, title, max_score, due_at, published)
             VALUES(?, ?, ?, ?, ?, '2026-03-10T17:00:00Z', ?)",
            (item_id, class_id, kind, item_id, max_score, published as i64),
        )
        .unwrap();
    }

    fn seed_graded_submission(
        conn: &Connection,
        item_id: &str,
        student_id: &str,
        earned: f64,
    ) {
        conn.execute(
            "INSERT INTO submissions(id, item_id, student_id, submitted_at, earned_score, graded)
             VALUES(?, ?, ?, '2026-03-09T12:00:00Z', ?, 1)",
            (format!("sub-{item_id}"), item_id, student_id, earned),
        )
        .unwrap();
    }

    #[test]
    fn round_off_rounds_half_up_at_one_decimal() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(59.96), 60.0);
    }

    #[test]
    fn letter_grade_buckets() {
        assert_eq!(letter_grade(100.0), "A");
        assert_eq!(letter_grade(90.0), "A");
        assert_eq!(letter_grade(89.9), "B");
        assert_eq!(letter_grade(80.0), "B");
        assert_eq!(letter_grade(70.0), "C");
        assert_eq!(letter_grade(60.0), "D");
        assert_eq!(letter_grade(59.9), "F");
    }

    #[test]
    fn grade_points_eleven_bucket_table() {
        let table = [
            (93.0, 4.0),
            (90.0, 3.7),
            (87.0, 3.3),
            (83.0, 3.0),
            (80.0, 2.7),
            (77.0, 2.3),
            (73.0, 2.0),
            (70.0, 1.7),
            (67.0, 1.3),
            (63.0, 1.0),
            (60.0, 0.7),
            (59.9, 0.0),
            (0.0, 0.0),
        ];
        for (pct, expected) in table {
            assert_eq!(grade_points(pct), expected, "pct {pct}");
        }
        // The two scales really are different granularities: 92 is an A but
        // not a 4.0.
        assert_eq!(letter_grade(92.0), "A");
        assert_eq!(grade_points(92.0), 3.7);
    }

    #[test]
    fn zero_fill_class_with_no_submissions_is_f() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        seed_item(&conn, "a", "c1", "assignment", 100.0, true);
        seed_item(&conn, "b", "c1", "quiz", 50.0, true);

        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.percentage, 0.0);
        assert_eq!(out.letter_grade, "F");
        assert_eq!(out.gpa, 0.0);
        assert_eq!(out.items.len(), 2);
        assert!(out.items.iter().all(|i| !i.completed && i.earned == 0.0));
    }

    #[test]
    fn partial_credit_counts_unattempted_max() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        seed_item(&conn, "a", "c1", "assignment", 100.0, true);
        seed_item(&conn, "b", "c1", "assignment", 50.0, true);
        seed_graded_submission(&conn, "a", "s1", 90.0);

        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.percentage, 60.0);
        assert_eq!(out.letter_grade, "D");
        assert_eq!(out.gpa, 0.7);
    }

    #[test]
    fn ungraded_submission_earns_zero_but_counts_completed() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        seed_item(&conn, "a", "c1", "assignment", 100.0, true);
        conn.execute(
            "INSERT INTO submissions(id, item_id, student_id, submitted_at, earned_score, graded)
             VALUES('sub-a', 'a', 's1', '2026-03-09T12:00:00Z', NULL, 0)",
            [],
        )
        .unwrap();

        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.percentage, 0.0);
        assert!(out.items[0].completed);
    }

    #[test]
    fn quiz_credit_uses_best_completed_attempt() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        seed_item(&conn, "q", "c1", "quiz", 20.0, true);
        for (id, status, score) in [
            ("at1", "completed", Some(12.0)),
            ("at2", "completed", Some(17.0)),
            ("at3", "in_progress", None::<f64>),
        ] {
            conn.execute(
                "INSERT INTO quiz_attempts(id, item_id, student_id, status, earned_score)
                 VALUES(?, 'q', 's1', ?, ?)",
                (id, status, score),
            )
            .unwrap();
        }

        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.items[0].earned, 17.0);
        assert_eq!(out.percentage, 85.0);
    }

    #[test]
    fn unpublished_items_are_invisible() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        seed_item(&conn, "a", "c1", "assignment", 100.0, true);
        seed_item(&conn, "draft", "c1", "assignment", 100.0, false);
        seed_graded_submission(&conn, "a", "s1", 80.0);

        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.percentage, 80.0);
    }

    #[test]
    fn empty_class_has_zero_percentage() {
        let conn = test_conn();
        seed_class(&conn, "c1", "s1", "active");
        let out = compute_class_gpa(&conn, "s1", "c1").expect("compute");
        assert_eq!(out.percentage, 0.0);
        assert_eq!(out.letter_grade, "F");
    }

    #[test]
    fn cumulative_is_unweighted_mean_of_class_gpas() {
        let conn = test_conn();
        seed_class(&conn, "x", "s1", "completed");
        seed_class(&conn, "y", "s1", "active");
        // Class x: one item, 95% => 4.0. Class y: three items, 73% => 2.0.
        seed_item(&conn, "x1", "x", "assignment", 100.0, true);
        seed_graded_submission(&conn, "x1", "s1", 95.0);
        for id in ["y1", "y2", "y3"] {
            seed_item(&conn, id, "y", "assignment", 100.0, true);
        }
        seed_graded_submission(&conn, "y1", "s1", 73.0);
        seed_graded_submission(&conn, "y2", "s1", 73.0);
        seed_graded_submission(&conn, "y3", "s1", 73.0);

        let out = compute_cumulative_gpa(&conn, "s1").expect("compute");
        assert_eq!(out.classes_taken, 2);
        assert!((out.cumulative_gpa - 3.0).abs() < 1e-9);
    }

    #[test]
    fn cumulative_skips_withdrawn_and_handles_no_classes() {
        let conn = test_conn();
        seed_class(&conn, "x", "s1", "withdrawn");
        let out = compute_cumulative_gpa(&conn, "s1").expect("compute");
        assert_eq!(out.classes_taken, 0);
        assert_eq!(out.cumulative_gpa, 0.0);
    }

    #[test]
    fn unknown_class_is_not_found() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO students(id, last_name, first_name) VALUES('s1', 'Lee', 'Avery')",
            [],
        )
        .unwrap();
        let err = compute_class_gpa(&conn, "s1", "missing").unwrap_err();
        assert_eq!(err.code, "not_found");
    }
}
