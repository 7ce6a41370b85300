use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::clock::fmt_ts;

/// Outbound notification seam. The dispatcher only sees this trait; the
/// production implementation queues rows for an external delivery agent,
/// and tests substitute recording or failing doubles.
pub trait Notifier {
    /// Queue an email to the user. An `Err` counts as a send failure for
    /// that recipient and never aborts the batch.
    fn send(&self, user_id: &str, subject: &str, body: &str) -> anyhow::Result<()>;

    /// Create an in-app notification row.
    fn create_in_app(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        kind: &str,
        related_id: &str,
    ) -> anyhow::Result<()>;
}

/// Writes email rows into `email_outbox` and in-app rows into
/// `notifications`. Actual SMTP delivery belongs to the agent draining the
/// outbox, not to this daemon.
pub struct OutboxNotifier<'a> {
    conn: &'a Connection,
    now: DateTime<Utc>,
}

impl<'a> OutboxNotifier<'a> {
    pub fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        Self { conn, now }
    }
}

impl Notifier for OutboxNotifier<'_> {
    fn send(&self, user_id: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO email_outbox(id, user_id, subject, body, queued_at, delivery_state)
             VALUES(?, ?, ?, ?, ?, 'queued')",
            (&id, user_id, subject, body, fmt_ts(self.now)),
        )?;
        Ok(())
    }

    fn create_in_app(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        kind: &str,
        related_id: &str,
    ) -> anyhow::Result<()> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO notifications(id, user_id, title, message, type, related_id, created_at, read)
             VALUES(?, ?, ?, ?, ?, ?, ?, 0)",
            (&id, user_id, title, message, kind, related_id, fmt_ts(self.now)),
        )?;
        Ok(())
    }
}
