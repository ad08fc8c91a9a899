#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use cleanup_governor_audit_core::AuditSink;
use cleanup_governor_domain::{now_utc, Domain, RunId, RunRecord};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use ulid::Ulid;

const AUDIT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_records (
  run_id TEXT PRIMARY KEY,
  domain TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN (
    'completed','rejected_by_validator','execution_partial_failure','aborted_by_error'
  )),
  config_hash TEXT NOT NULL,
  constraint_fingerprint TEXT NOT NULL,
  triggered_by TEXT NOT NULL,
  engine_version TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_records_domain_started
  ON run_records(domain, started_at);

CREATE TRIGGER IF NOT EXISTS trg_run_records_no_update
BEFORE UPDATE ON run_records
BEGIN
  SELECT RAISE(FAIL, 'run_records is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_records_no_delete
BEFORE DELETE ON run_records
BEGIN
  SELECT RAISE(FAIL, 'run_records is append-only');
END;
";

/// Append-only `SQLite` audit log.
///
/// The connection is behind a mutex so one sink can be shared across
/// scheduler workers.
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    /// Open or create a `SQLite` audit database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditSink for SqliteAuditSink {
    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply audit schema")?;

        let now = rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![AUDIT_SCHEMA_VERSION, now],
        )
        .context("failed to record audit migration")?;

        Ok(())
    }

    fn append(&self, record: &RunRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO run_records(
                    run_id, domain, outcome, config_hash, constraint_fingerprint,
                    triggered_by, engine_version, started_at, ended_at, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.run_id.to_string(),
                    record.domain.as_str(),
                    record.outcome.as_str(),
                    record.config_hash,
                    record.constraint_fingerprint,
                    record.triggered_by,
                    record.engine_version,
                    rfc3339(record.started_at)?,
                    rfc3339(record.ended_at)?,
                    serde_json::to_string(record)?,
                ],
            )
            .context("failed to append run record")?;
        Ok(())
    }

    fn list_runs(&self, domain: Option<&Domain>) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let mut out = Vec::new();

        match domain {
            Some(domain) => {
                let mut stmt = conn.prepare(
                    "SELECT record_json FROM run_records
                     WHERE domain = ?1
                     ORDER BY started_at DESC, run_id ASC",
                )?;
                let mut rows = stmt.query(params![domain.as_str()])?;
                while let Some(row) = rows.next()? {
                    out.push(decode_record(&row.get::<_, String>(0)?)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT record_json FROM run_records
                     ORDER BY started_at DESC, run_id ASC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(decode_record(&row.get::<_, String>(0)?)?);
                }
            }
        }

        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        self.lock()
            .prepare("SELECT record_json FROM run_records WHERE run_id = ?1")?
            .query_row(params![run_id.to_string()], |row| row.get::<_, String>(0))
            .optional()?
            .map(|raw| decode_record(&raw))
            .transpose()
    }
}

// record_json is canonical; the indexed columns only mirror it.
fn decode_record(raw: &str) -> Result<RunRecord> {
    serde_json::from_str(raw).context("invalid record_json")
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse a run id from its canonical ULID string form.
///
/// # Errors
/// Returns an error when the value is not a valid ULID.
pub fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}
