use std::fs;
use std::path::PathBuf;
use std::process::Command;

use cleanup_governor_audit_core::AuditSink;
use cleanup_governor_audit_sqlite::SqliteAuditSink;
use cleanup_governor_domain::{Domain, RunId, RunOutcome};
use serde_json::json;
use ulid::Ulid;

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "cleanup-governor-cli-test-{}-{}.{}",
        name,
        Ulid::new(),
        ext
    ))
}

fn governor_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cleanup-governor"))
}

fn write_plan(name: &str, actions: &serde_json::Value) -> PathBuf {
    let path = temp_path(name, "json");
    fs::write(&path, actions.to_string())
        .unwrap_or_else(|err| panic!("failed to write plan file: {err}"));
    path
}

fn write_config(name: &str, yaml: &str) -> PathBuf {
    let path = temp_path(name, "yaml");
    fs::write(&path, yaml).unwrap_or_else(|err| panic!("failed to write config file: {err}"));
    path
}

fn extract_run_id(stdout: &str) -> Option<RunId> {
    for token in stdout.split_whitespace() {
        if let Some(raw) = token.strip_prefix("run_id=") {
            let parsed = Ulid::from_string(raw).ok()?;
            return Some(RunId(parsed));
        }
    }
    None
}

#[test]
fn run_persists_a_completed_record() {
    let plan = write_plan(
        "lma-plan",
        &json!([
            {"kind": "archive_branch", "target": "repo-a#stale/exp-1"},
            {"kind": "close_pr", "target": "repo-a#42", "parameters": {"comment": "stale"}},
        ]),
    );
    let config = write_config(
        "single-domain",
        &format!(
            r#"
domains:
  - domain: lma
    summary: "lma weekly cleanup"
    constraints:
      - name: no_default_branch_deletes
    params:
      planner:
        plan_file: "{}"
"#,
            plan.display()
        ),
    );
    let audit_db = temp_path("run-db", "sqlite");

    let output = governor_bin()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--domain", "lma", "--audit-db"])
        .arg(&audit_db)
        .args(["--triggered-by", "cli-test"])
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(output.status.success(), "stdout={stdout}");
    assert!(stdout.contains("outcome=completed"), "stdout={stdout}");
    assert!(stdout.contains("approved=2"), "stdout={stdout}");

    let run_id = extract_run_id(&stdout);
    assert!(run_id.is_some());
    let run_id = run_id.unwrap_or_else(|| unreachable!());

    let sink = SqliteAuditSink::open(&audit_db)
        .unwrap_or_else(|err| panic!("failed to open audit db: {err}"));
    let record = sink
        .get_run(run_id)
        .unwrap_or_else(|err| panic!("failed to read record: {err}"));
    assert!(record.is_some());
    let record = record.unwrap_or_else(|| unreachable!());
    assert_eq!(record.outcome, RunOutcome::Completed);
    assert_eq!(record.domain, Domain("lma".to_string()));
    assert_eq!(record.triggered_by, "cli-test");
    assert_eq!(record.candidates.len(), 2);
    assert_eq!(record.approved.len(), 2);
    assert_eq!(record.constraints.names(), vec!["no_default_branch_deletes"]);
    assert!(!record.constraint_fingerprint.is_empty());
    assert_eq!(record.summary, "lma weekly cleanup");
}

#[test]
fn run_all_keeps_domains_isolated() {
    let lma_plan = write_plan(
        "all-lma-plan",
        &json!([{"kind": "archive_branch", "target": "repo-a#stale/exp-1"}]),
    );
    let ops_plan = write_plan(
        "all-ops-plan",
        &json!([{"kind": "close_pr", "target": "repo-b#7"}]),
    );
    let config = write_config(
        "two-domains",
        &format!(
            r#"
domains:
  - domain: lma
    params:
      planner:
        plan_file: "{}"
  - domain: ops
    params:
      planner:
        plan_file: "{}"
"#,
            lma_plan.display(),
            ops_plan.display()
        ),
    );
    let audit_db = temp_path("run-all-db", "sqlite");

    let output = governor_bin()
        .args(["run-all", "--config"])
        .arg(&config)
        .arg("--audit-db")
        .arg(&audit_db)
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(output.status.success(), "stdout={stdout}");
    assert!(stdout.contains("domain=lma"), "stdout={stdout}");
    assert!(stdout.contains("domain=ops"), "stdout={stdout}");

    let sink = SqliteAuditSink::open(&audit_db)
        .unwrap_or_else(|err| panic!("failed to open audit db: {err}"));
    let records = sink
        .list_runs(None)
        .unwrap_or_else(|err| panic!("failed to list records: {err}"));
    assert_eq!(records.len(), 2);
    assert_ne!(records[0].run_id, records[1].run_id);
    assert_ne!(records[0].domain, records[1].domain);
    for record in &records {
        assert_eq!(record.outcome, RunOutcome::Completed);
        assert_eq!(record.candidates.len(), 1);
    }
}

#[test]
fn unknown_domain_fails() {
    let config = write_config(
        "known-domains",
        r"
domains:
  - domain: lma
",
    );
    let audit_db = temp_path("unknown-domain-db", "sqlite");

    let output = governor_bin()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--domain", "nope", "--audit-db"])
        .arg(&audit_db)
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));

    assert!(!output.status.success());
}

#[test]
fn empty_plan_still_produces_an_audit_record() {
    let config = write_config(
        "empty-plan",
        r"
domains:
  - domain: lma
",
    );
    let audit_db = temp_path("empty-plan-db", "sqlite");

    let output = governor_bin()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--domain", "lma", "--audit-db"])
        .arg(&audit_db)
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(output.status.success(), "stdout={stdout}");
    assert!(stdout.contains("outcome=completed"), "stdout={stdout}");
    assert!(stdout.contains("candidates=0"), "stdout={stdout}");

    let sink = SqliteAuditSink::open(&audit_db)
        .unwrap_or_else(|err| panic!("failed to open audit db: {err}"));
    let records = sink
        .list_runs(Some(&Domain("lma".to_string())))
        .unwrap_or_else(|err| panic!("failed to list records: {err}"));
    assert_eq!(records.len(), 1);
    assert!(records[0].execution_results.is_empty());
}

#[test]
fn export_writes_records_as_json_lines() {
    let plan = write_plan(
        "export-plan",
        &json!([{"kind": "close_pr", "target": "repo-a#42"}]),
    );
    let config = write_config(
        "export-domain",
        &format!(
            r#"
domains:
  - domain: lma
    params:
      planner:
        plan_file: "{}"
"#,
            plan.display()
        ),
    );
    let audit_db = temp_path("export-db", "sqlite");
    let out = temp_path("export-out", "jsonl");

    let run = governor_bin()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--domain", "lma", "--audit-db"])
        .arg(&audit_db)
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));
    assert!(run.status.success());

    let export = governor_bin()
        .args(["export", "--audit-db"])
        .arg(&audit_db)
        .arg("--out")
        .arg(&out)
        .output()
        .unwrap_or_else(|err| panic!("failed to run binary: {err}"));
    assert!(export.status.success());

    let body =
        fs::read_to_string(&out).unwrap_or_else(|err| panic!("failed to read export: {err}"));
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0])
        .unwrap_or_else(|err| panic!("export line is not JSON: {err}"));
    assert_eq!(record["domain"], json!("lma"));
    assert_eq!(record["outcome"], json!("completed"));
}
