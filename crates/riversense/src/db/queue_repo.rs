//! Queue repository: leased messages in the `queue` table.
//!
//! A message is visible when `visible_at <= now`. Claiming a message pushes
//! `visible_at` to the end of the lease and stamps a fresh `lease_token`;
//! only the holder of that token can delete (acknowledge) it.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A queue message as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    pub id: i64,
    pub job_id: i64,
    pub run: u32,
    pub attempt: u32,
    pub visible_at: i64,
    pub deliveries: u32,
    pub lease_token: Option<String>,
    pub enqueued_at: i64,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            run: row.get("run")?,
            attempt: row.get("attempt")?,
            visible_at: row.get("visible_at")?,
            deliveries: row.get("deliveries")?,
            lease_token: row.get("lease_token")?,
            enqueued_at: row.get("enqueued_at")?,
        })
    }
}

/// Appends a message that becomes visible at `visible_at`.
pub fn insert(
    db: &Database,
    job_id: i64,
    run: u32,
    attempt: u32,
    visible_at: i64,
    now: i64,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO queue (job_id, run, attempt, visible_at, deliveries, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![job_id, run, attempt, visible_at, now],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Leases the oldest visible message until `lease_until`, or returns `None`.
pub fn claim_next(
    db: &Database,
    now: i64,
    lease_until: i64,
    lease_token: &str,
) -> Result<Option<QueueRow>, DatabaseError> {
    db.with_tx(|tx| {
        let candidate = tx
            .query_row(
                "SELECT * FROM queue WHERE visible_at <= ?1 ORDER BY visible_at, id LIMIT 1",
                params![now],
                QueueRow::from_row,
            )
            .optional()?;

        let Some(mut row) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue SET visible_at = ?2, deliveries = deliveries + 1, lease_token = ?3
             WHERE id = ?1",
            params![row.id, lease_until, lease_token],
        )?;

        row.visible_at = lease_until;
        row.deliveries += 1;
        row.lease_token = Some(lease_token.to_string());
        Ok(Some(row))
    })
}

/// Deletes a message if it is still held under `lease_token`.
/// Returns false when the lease was lost (expired and re-claimed, or acked).
pub fn delete_leased(db: &Database, id: i64, lease_token: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM queue WHERE id = ?1 AND lease_token = ?2",
            params![id, lease_token],
        )?;
        Ok(changed == 1)
    })
}

/// Returns the message with the given id, if still queued.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<QueueRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM queue WHERE id = ?1", params![id], QueueRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Number of messages still in the queue (leased or not).
pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |r| r.get(0))?;
        Ok(count)
    })
}
