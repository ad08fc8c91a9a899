#![forbid(unsafe_code)]

use anyhow::Result;
use cleanup_governor_domain::{Domain, RunId, RunRecord};

/// Append-only destination for run records.
///
/// One record per run, appended after execution results are known. A sink
/// must reject mutation of previously appended records; history is the
/// safety artifact and is never rewritten.
#[allow(clippy::missing_errors_doc)]
pub trait AuditSink: Sync {
    fn migrate(&self) -> Result<()>;

    fn append(&self, record: &RunRecord) -> Result<()>;

    /// List records, newest first, optionally filtered to one domain.
    fn list_runs(&self, domain: Option<&Domain>) -> Result<Vec<RunRecord>>;

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;
}
