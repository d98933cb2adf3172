//! Embedded SQLite store: run records, the processed-comment ledger, and
//! cached executor session ids.
//!
//! The database is a cache and dedup ledger only — the tracker is the
//! source of truth. Losing it costs re-run efficiency, never correctness.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::ticket::IssueRef;

/// Terminal and in-flight states of a run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
    /// Executor exited 0 but the stage's required artifact never appeared
    /// (e.g. Research without a research region).
    Stalled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Stalled => "stalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "stalled" => Ok(Self::Stalled),
            _ => Err(format!("Invalid run outcome: {s}")),
        }
    }
}

/// One executor invocation under a workflow. Append-only; only the
/// terminal outcome fields are ever updated.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub issue: IssueRef,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub log_path: Option<String>,
    pub session_id: Option<String>,
}

pub struct KilnDb {
    conn: Connection,
}

impl KilnDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    host TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    workflow TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    outcome TEXT NOT NULL DEFAULT 'running',
                    log_path TEXT,
                    session_id TEXT
                );

                CREATE TABLE IF NOT EXISTS processed_comments (
                    host TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    comment_id TEXT NOT NULL,
                    processed_at TEXT NOT NULL,
                    PRIMARY KEY (host, owner, repo, issue_number, comment_id)
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    host TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    workflow TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (host, owner, repo, issue_number, workflow)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_issue
                    ON runs(host, owner, repo, issue_number);
                CREATE INDEX IF NOT EXISTS idx_runs_outcome ON runs(outcome);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn insert_run(
        &self,
        issue: &IssueRef,
        workflow: &str,
        log_path: Option<&str>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO runs (host, owner, repo, issue_number, workflow, started_at, outcome, log_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
                params![
                    issue.host,
                    issue.owner,
                    issue.repo,
                    issue.number,
                    workflow,
                    Utc::now().to_rfc3339(),
                    log_path,
                ],
            )
            .context("Failed to insert run record")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Terminal write for a run row. The row keeps its original
    /// `started_at` and `log_path`.
    pub fn finish_run(
        &self,
        run_id: i64,
        outcome: RunOutcome,
        session_id: Option<&str>,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET outcome = ?1, finished_at = ?2,
                        session_id = COALESCE(?3, session_id)
                 WHERE id = ?4",
                params![
                    outcome.as_str(),
                    Utc::now().to_rfc3339(),
                    session_id,
                    run_id
                ],
            )
            .context("Failed to update run record")?;
        anyhow::ensure!(updated == 1, "Run {run_id} not found");
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT id, host, owner, repo, issue_number, workflow, started_at,
                        finished_at, outcome, log_path, session_id
                 FROM runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()
            .context("Failed to fetch run record")
    }

    pub fn runs_for_issue(&self, issue: &IssueRef) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, host, owner, repo, issue_number, workflow, started_at,
                    finished_at, outcome, log_path, session_id
             FROM runs
             WHERE host = ?1 AND owner = ?2 AND repo = ?3 AND issue_number = ?4
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![issue.host, issue.owner, issue.repo, issue.number],
            row_to_run,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list runs")
    }

    /// Count of runs currently marked running. Crash recovery relies on
    /// these being re-driven from labels, not replayed from here.
    pub fn running_run_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE outcome = 'running'")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list running runs")
    }

    /// Mark any leftover 'running' rows as cancelled. Called on startup:
    /// a running row with no daemon alive is a crash artifact.
    pub fn cancel_orphaned_runs(&self) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET outcome = 'cancelled', finished_at = ?1
                 WHERE outcome = 'running'",
                params![Utc::now().to_rfc3339()],
            )
            .context("Failed to cancel orphaned runs")?;
        Ok(updated)
    }

    pub fn mark_comment_processed(&self, issue: &IssueRef, comment_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO processed_comments
                 (host, owner, repo, issue_number, comment_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    issue.host,
                    issue.owner,
                    issue.repo,
                    issue.number,
                    comment_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to record processed comment")?;
        Ok(())
    }

    pub fn is_comment_processed(&self, issue: &IssueRef, comment_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_comments
             WHERE host = ?1 AND owner = ?2 AND repo = ?3
               AND issue_number = ?4 AND comment_id = ?5",
            params![
                issue.host,
                issue.owner,
                issue.repo,
                issue.number,
                comment_id
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_session(&self, issue: &IssueRef, workflow: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT session_id FROM sessions
                 WHERE host = ?1 AND owner = ?2 AND repo = ?3
                   AND issue_number = ?4 AND workflow = ?5",
                params![issue.host, issue.owner, issue.repo, issue.number, workflow],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to fetch session id")
    }

    pub fn set_session(&self, issue: &IssueRef, workflow: &str, session_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions
                 (host, owner, repo, issue_number, workflow, session_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(host, owner, repo, issue_number, workflow)
                 DO UPDATE SET session_id = excluded.session_id,
                               updated_at = excluded.updated_at",
                params![
                    issue.host,
                    issue.owner,
                    issue.repo,
                    issue.number,
                    workflow,
                    session_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store session id")?;
        Ok(())
    }

    /// Forget cached sessions for an issue. Part of reset.
    pub fn clear_sessions(&self, issue: &IssueRef) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sessions
                 WHERE host = ?1 AND owner = ?2 AND repo = ?3 AND issue_number = ?4",
                params![issue.host, issue.owner, issue.repo, issue.number],
            )
            .context("Failed to clear sessions")?;
        Ok(())
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let started_at: String = row.get(6)?;
    let finished_at: Option<String> = row.get(7)?;
    let outcome: String = row.get(8)?;
    Ok(RunRecord {
        id: row.get(0)?,
        issue: IssueRef {
            host: row.get(1)?,
            owner: row.get(2)?,
            repo: row.get(3)?,
            number: row.get::<_, i64>(4)? as u64,
        },
        workflow: row.get(5)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        finished_at: finished_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        outcome: outcome.parse().unwrap_or(RunOutcome::Failure),
        log_path: row.get(9)?,
        session_id: row.get(10)?,
    })
}

/// Async-safe handle to the database.
///
/// Wraps `KilnDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads. This is also the
/// single-writer discipline: every write goes through this one handle.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<KilnDb>>,
}

impl DbHandle {
    pub fn new(db: KilnDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&KilnDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> IssueRef {
        IssueRef::new("github.com", "acme", "web", 42)
    }

    #[test]
    fn run_lifecycle_success() {
        let db = KilnDb::new_in_memory().unwrap();
        let id = db
            .insert_run(&issue(), "research", Some(".kiln/logs/x.log"))
            .unwrap();

        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Running);
        assert!(run.finished_at.is_none());

        db.finish_run(id, RunOutcome::Success, Some("sess-123"))
            .unwrap();
        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.session_id.as_deref(), Some("sess-123"));
        assert!(run.finished_at.is_some());
        assert_eq!(run.log_path.as_deref(), Some(".kiln/logs/x.log"));
    }

    #[test]
    fn finish_run_without_session_keeps_existing() {
        let db = KilnDb::new_in_memory().unwrap();
        let id = db.insert_run(&issue(), "plan", None).unwrap();
        db.finish_run(id, RunOutcome::Timeout, None).unwrap();
        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Timeout);
        assert!(run.session_id.is_none());
    }

    #[test]
    fn exactly_one_running_run_between_start_and_finish() {
        let db = KilnDb::new_in_memory().unwrap();
        let id = db.insert_run(&issue(), "research", None).unwrap();
        assert_eq!(db.running_run_ids().unwrap(), vec![id]);
        db.finish_run(id, RunOutcome::Success, None).unwrap();
        assert!(db.running_run_ids().unwrap().is_empty());

        let id2 = db.insert_run(&issue(), "plan", None).unwrap();
        assert_eq!(db.running_run_ids().unwrap(), vec![id2]);
    }

    #[test]
    fn orphaned_runs_are_cancelled_on_startup() {
        let db = KilnDb::new_in_memory().unwrap();
        let id = db.insert_run(&issue(), "implement", None).unwrap();
        assert_eq!(db.cancel_orphaned_runs().unwrap(), 1);
        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Cancelled);
    }

    #[test]
    fn comment_ledger_is_idempotent() {
        let db = KilnDb::new_in_memory().unwrap();
        assert!(!db.is_comment_processed(&issue(), "C1").unwrap());
        db.mark_comment_processed(&issue(), "C1").unwrap();
        db.mark_comment_processed(&issue(), "C1").unwrap();
        assert!(db.is_comment_processed(&issue(), "C1").unwrap());
        assert!(!db.is_comment_processed(&issue(), "C2").unwrap());
    }

    #[test]
    fn sessions_upsert_and_clear() {
        let db = KilnDb::new_in_memory().unwrap();
        assert!(db.get_session(&issue(), "research").unwrap().is_none());
        db.set_session(&issue(), "research", "a").unwrap();
        db.set_session(&issue(), "research", "b").unwrap();
        assert_eq!(db.get_session(&issue(), "research").unwrap().as_deref(), Some("b"));

        db.clear_sessions(&issue()).unwrap();
        assert!(db.get_session(&issue(), "research").unwrap().is_none());
    }

    #[tokio::test]
    async fn db_handle_runs_on_blocking_pool() {
        let handle = DbHandle::new(KilnDb::new_in_memory().unwrap());
        let key = issue();
        let id = handle
            .call(move |db| db.insert_run(&key, "research", None))
            .await
            .unwrap();
        let run = handle.call(move |db| db.get_run(id)).await.unwrap().unwrap();
        assert_eq!(run.workflow, "research");
    }
}
