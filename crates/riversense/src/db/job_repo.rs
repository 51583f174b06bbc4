//! Job repository: row-level operations on the `jobs` table.
//!
//! Timestamps are stored as milliseconds since the Unix epoch.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub raw_payload: Vec<u8>,
    pub status: String,
    pub artifact_path: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub run: u32,
    pub owner: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            raw_payload: row.get("raw_payload")?,
            status: row.get("status")?,
            artifact_path: row.get("artifact_path")?,
            failure_reason: row.get("failure_reason")?,
            attempts: row.get("attempts")?,
            run: row.get("run")?,
            owner: row.get("owner")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A guarded status update. Applied only if the row is still in
/// `expected_status` and, when `held` is set, still matches it.
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub id: i64,
    pub expected_status: &'a str,
    pub held: Option<HeldRun<'a>>,
    pub status: &'a str,
    pub artifact_path: Option<&'a str>,
    pub failure_reason: Option<&'a str>,
    /// `None` keeps the stored counter.
    pub attempts: Option<u32>,
    pub owner: Option<&'a str>,
    /// Starts a new run of the job.
    pub bump_run: bool,
    pub updated_at: i64,
}

/// Run, retry counter and owner a caller read from the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldRun<'a> {
    pub run: u32,
    pub attempts: u32,
    pub owner: Option<&'a str>,
}

/// Result of a compare-and-set on a job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row exists but did not match the guard. `actual` is its status.
    Mismatch { actual: String },
    Missing,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new pending job and returns its id.
pub fn insert(db: &Database, raw_payload: &[u8], now: i64) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (raw_payload, status, attempts, created_at, updated_at)
             VALUES (?1, 'pending', 0, ?2, ?2)",
            params![raw_payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Finds a job by its id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Applies `update` if the row still matches its guard. The update and the
/// follow-up read that explains a miss run under the same connection lock.
pub fn compare_and_set(db: &Database, update: &StatusUpdate<'_>) -> Result<CasOutcome, DatabaseError> {
    db.with_conn(|conn| {
        let held = update.held.unwrap_or(HeldRun {
            run: 0,
            attempts: 0,
            owner: None,
        });
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, artifact_path = ?4, failure_reason = ?5,
             attempts = COALESCE(?6, attempts), owner = ?7, run = run + ?8, updated_at = ?9
             WHERE id = ?1 AND status = ?2
             AND (?10 = 0 OR (run = ?11 AND attempts = ?12 AND owner IS ?13))",
            params![
                update.id,
                update.expected_status,
                update.status,
                update.artifact_path,
                update.failure_reason,
                update.attempts,
                update.owner,
                update.bump_run as i64,
                update.updated_at,
                update.held.is_some() as i64,
                held.run,
                held.attempts,
                held.owner,
            ],
        )?;

        if changed == 1 {
            return Ok(CasOutcome::Applied);
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![update.id],
                |r| r.get(0),
            )
            .optional()?;

        Ok(match actual {
            Some(actual) => CasOutcome::Mismatch { actual },
            None => CasOutcome::Missing,
        })
    })
}

/// Queries jobs with filters, newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;

        let rows = match filter.status {
            Some(ref status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![status, limit, offset], JobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit, offset], JobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
