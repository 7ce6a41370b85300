use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("academy.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Overlapping scheduled runs queue on the store instead of surfacing
    // SQLITE_BUSY mid-batch.
    conn.busy_timeout(Duration::from_millis(5000))?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Schema creation is idempotent and split out so tests can build the same
/// schema on an in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            enrolled_at TEXT,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    // One table for both kinds; due_at is the assignment due timestamp or
    // the quiz close timestamp.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gradable_items(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            max_score REAL NOT NULL,
            due_at TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_gradable_items_class ON gradable_items(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_gradable_items_due ON gradable_items(published, due_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            earned_score REAL,
            graded INTEGER NOT NULL DEFAULT 0,
            UNIQUE(item_id, student_id),
            FOREIGN KEY(item_id) REFERENCES gradable_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_student ON submissions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_attempts(
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            earned_score REAL,
            started_at TEXT,
            finished_at TEXT,
            FOREIGN KEY(item_id) REFERENCES gradable_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_pair ON quiz_attempts(item_id, student_id)",
        [],
    )?;

    // The unique pair index is the reconciler's insert-if-absent anchor:
    // two overlapping runs racing on the same missing pair cannot both
    // insert.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            percentage REAL NOT NULL,
            letter_grade TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, item_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(item_id) REFERENCES gradable_items(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_item ON grade_records(item_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reminder_log(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            notification_type TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES students(id),
            FOREIGN KEY(item_id) REFERENCES gradable_items(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reminder_log_key
         ON reminder_log(user_id, item_id, notification_type, sent_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            type TEXT NOT NULL,
            related_id TEXT,
            created_at TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS email_outbox(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            queued_at TEXT NOT NULL,
            delivery_state TEXT NOT NULL DEFAULT 'queued',
            FOREIGN KEY(user_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_email_outbox_user ON email_outbox(user_id)",
        [],
    )?;

    Ok(())
}
