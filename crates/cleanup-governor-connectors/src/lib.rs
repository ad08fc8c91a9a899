#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use cleanup_governor_config::HttpServiceConfig;
use cleanup_governor_domain::{
    now_utc, ActionCandidate, ActionId, ApprovedAction, BatchRejection, ConstraintSet,
    DeclinedCandidate, Domain, DomainConfig, EnvironmentState, ExecutionFailure, FailureKind,
    GateVerdict, PlannedAction, Stage, StageFailure,
};
use cleanup_governor_pipeline::{ExecutionAck, Executor, Planner, StateProbe, ValidationGate};
use serde_json::{json, Value};

/// Validation gate backed by an HTTP review service.
///
/// The gate receives the full candidate batch and the domain's constraints
/// verbatim; it answers with approved ids, declined ids, or a whole-batch
/// rejection.
pub struct HttpValidationGate {
    config: HttpServiceConfig,
}

impl HttpValidationGate {
    #[must_use]
    pub fn new(config: HttpServiceConfig) -> Self {
        Self { config }
    }
}

impl ValidationGate for HttpValidationGate {
    fn review(
        &self,
        domain: &Domain,
        candidates: &[ActionCandidate],
        constraints: &ConstraintSet,
    ) -> Result<GateVerdict, StageFailure> {
        let body = json!({
            "domain": domain,
            "candidates": candidates,
            "constraints": constraints,
        });
        tracing::debug!(
            url = %self.config.url,
            candidates = candidates.len(),
            "submitting candidate batch for review"
        );
        let response = post_json(&self.config, &body, Stage::Validate)?;
        parse_verdict(&response, candidates)
            .map_err(|err| StageFailure::permanent(Stage::Validate, err.to_string()))
    }
}

/// Executor backed by an HTTP relay service, one call per approved action.
pub struct HttpRelayExecutor {
    config: HttpServiceConfig,
}

impl HttpRelayExecutor {
    #[must_use]
    pub fn new(config: HttpServiceConfig) -> Self {
        Self { config }
    }
}

impl Executor for HttpRelayExecutor {
    fn execute(
        &self,
        domain: &Domain,
        action: &ApprovedAction,
    ) -> Result<ExecutionAck, ExecutionFailure> {
        let body = json!({
            "domain": domain,
            "action_id": action.action_id(),
            "kind": action.kind(),
            "target": action.target(),
            "parameters": action.parameters(),
            "approved_by": action.approved_by,
        });
        let response = post_json(&self.config, &body, Stage::Execute)
            .map_err(|failure| ExecutionFailure::new(failure.message))?;
        parse_ack(&response)
            .map_err(|err| ExecutionFailure::new(err.to_string()).with_detail(response))
    }
}

fn post_json(config: &HttpServiceConfig, body: &Value, stage: Stage) -> Result<Value, StageFailure> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build();

    let mut request = agent
        .request("POST", &config.url)
        .set("content-type", "application/json");
    for (header, value) in &config.headers {
        request = request.set(header, value);
    }
    if let Some(env_name) = &config.auth_bearer_env {
        let token = std::env::var(env_name).map_err(|_| {
            StageFailure::permanent(
                stage,
                format!("missing env var '{env_name}' required for bearer auth"),
            )
        })?;
        request = request.set("authorization", &format!("Bearer {token}"));
    }

    match request.send_json(body) {
        Ok(response) => response
            .into_json()
            .map_err(|err| StageFailure::permanent(stage, format!("invalid JSON response: {err}"))),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_json::<Value>().unwrap_or(Value::Null);
            Err(StageFailure {
                stage,
                kind: classify_status(code),
                message: format!("http status {code}: {body}"),
            })
        }
        // Timeouts surface as transport errors.
        Err(ureq::Error::Transport(err)) => Err(StageFailure::transient(
            stage,
            format!("http transport failure: {err}"),
        )),
    }
}

fn classify_status(code: u16) -> FailureKind {
    if code >= 500 {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

fn parse_verdict(body: &Value, candidates: &[ActionCandidate]) -> Result<GateVerdict> {
    let decision = body
        .get("decision")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("gate response missing 'decision'"))?;

    match decision {
        "rejected" => Ok(GateVerdict::RejectedBatch(BatchRejection {
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("batch rejected by validation gate")
                .to_string(),
            constraint_name: body
                .get("constraint")
                .and_then(Value::as_str)
                .map(str::to_string),
        })),
        "cleared" => {
            let decided_by = body
                .get("decided_by")
                .and_then(Value::as_str)
                .unwrap_or("validation_gate");
            let by_id: BTreeMap<&str, &ActionCandidate> = candidates
                .iter()
                .map(|candidate| (candidate.action_id.as_str(), candidate))
                .collect();

            let mut approved = Vec::new();
            if let Some(ids) = body.get("approved") {
                let ids = ids
                    .as_array()
                    .ok_or_else(|| anyhow!("'approved' must be an array"))?;
                for id in ids {
                    let id = id
                        .as_str()
                        .ok_or_else(|| anyhow!("'approved' entries must be action id strings"))?;
                    let candidate = by_id
                        .get(id)
                        .ok_or_else(|| anyhow!("gate approved unknown action id {id}"))?;
                    approved.push(ApprovedAction::clear((*candidate).clone(), decided_by));
                }
            }

            let mut declined = Vec::new();
            if let Some(entries) = body.get("declined") {
                let entries = entries
                    .as_array()
                    .ok_or_else(|| anyhow!("'declined' must be an array"))?;
                for entry in entries {
                    let action_id = entry
                        .get("action_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| anyhow!("'declined' entries require 'action_id'"))?;
                    declined.push(DeclinedCandidate {
                        action_id: ActionId(action_id.to_string()),
                        constraint_name: entry
                            .get("constraint")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        reason: entry
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or("declined by validation gate")
                            .to_string(),
                    });
                }
            }

            Ok(GateVerdict::Cleared { approved, declined })
        }
        other => Err(anyhow!("unknown gate decision '{other}'")),
    }
}

fn parse_ack(body: &Value) -> Result<ExecutionAck> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("relay response missing 'status'"))?;
    let detail = body.get("detail").cloned().unwrap_or(Value::Null);
    match status {
        "applied" => Ok(ExecutionAck::applied().with_detail(detail)),
        "already_applied" => Ok(ExecutionAck::already_applied().with_detail(detail)),
        other => Err(anyhow!("relay reported status '{other}'")),
    }
}

/// Probe that reads the environment snapshot from a JSON file named by
/// `params.probe.state_file`. A missing key or file means an empty
/// environment, not a failure.
pub struct FileStateProbe;

impl StateProbe for FileStateProbe {
    fn discover(&self, config: &DomainConfig) -> Result<EnvironmentState, StageFailure> {
        let Some(path) = config
            .params
            .get("probe")
            .and_then(|probe| probe.get("state_file"))
            .and_then(Value::as_str)
        else {
            return Ok(EnvironmentState::empty());
        };

        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let snapshot: Value = serde_json::from_str(&raw).map_err(|err| {
                    StageFailure::permanent(
                        Stage::Discover,
                        format!("invalid state file {path}: {err}"),
                    )
                })?;
                Ok(EnvironmentState {
                    observed_at: now_utc(),
                    snapshot,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(EnvironmentState::empty())
            }
            Err(err) => Err(StageFailure::permanent(
                Stage::Discover,
                format!("failed to read state file {path}: {err}"),
            )),
        }
    }
}

/// Planner that reads proposed actions from a JSON file named by
/// `params.planner.plan_file`. A missing key or file means an empty plan.
pub struct FilePlanner;

impl Planner for FilePlanner {
    fn plan(
        &self,
        config: &DomainConfig,
        _state: &EnvironmentState,
    ) -> Result<Vec<PlannedAction>, StageFailure> {
        let Some(path) = config
            .params
            .get("planner")
            .and_then(|planner| planner.get("plan_file"))
            .and_then(Value::as_str)
        else {
            return Ok(Vec::new());
        };

        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                StageFailure::permanent(Stage::Plan, format!("invalid plan file {path}: {err}"))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StageFailure::permanent(
                Stage::Plan,
                format!("failed to read plan file {path}: {err}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_status, parse_ack, parse_verdict, FilePlanner, FileStateProbe};
    use cleanup_governor_domain::{
        ActionCandidate, ConstraintSet, Domain, DomainConfig, EnvironmentState, FailureKind,
        GateVerdict, RunLimits, Stage,
    };
    use cleanup_governor_pipeline::{Planner, StateProbe};
    use serde_json::{json, Value};
    use ulid::Ulid;

    fn fixture_candidates() -> Vec<ActionCandidate> {
        let domain = Domain("lma".to_string());
        vec![
            ActionCandidate::new(&domain, "archive_branch", "repo-a#stale/exp-1", Value::Null)
                .unwrap_or_else(|_| unreachable!()),
            ActionCandidate::new(&domain, "close_pr", "repo-a#42", Value::Null)
                .unwrap_or_else(|_| unreachable!()),
        ]
    }

    fn fixture_config(params: Value) -> DomainConfig {
        DomainConfig {
            domain: Domain("lma".to_string()),
            summary: None,
            scope: Value::Null,
            constraints: ConstraintSet::default(),
            limits: RunLimits::default(),
            params,
        }
    }

    fn temp_json_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "cleanup-governor-connectors-test-{}-{}.json",
            name,
            Ulid::new()
        ))
    }

    #[test]
    fn cleared_verdict_maps_ids_back_to_candidates() {
        let candidates = fixture_candidates();
        let body = json!({
            "decision": "cleared",
            "decided_by": "review-service",
            "approved": [candidates[0].action_id.as_str()],
            "declined": [{
                "action_id": candidates[1].action_id.as_str(),
                "constraint": "no_default_branch_deletes",
                "reason": "target is protected"
            }],
        });

        let verdict = parse_verdict(&body, &candidates);
        assert!(verdict.is_ok());
        match verdict {
            Ok(GateVerdict::Cleared { approved, declined }) => {
                assert_eq!(approved.len(), 1);
                assert_eq!(approved[0].action_id(), &candidates[0].action_id);
                assert_eq!(approved[0].approved_by, "review-service");
                assert_eq!(declined.len(), 1);
                assert_eq!(declined[0].action_id, candidates[1].action_id);
                assert_eq!(
                    declined[0].constraint_name.as_deref(),
                    Some("no_default_branch_deletes")
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn rejected_verdict_carries_reason_and_constraint() {
        let body = json!({
            "decision": "rejected",
            "reason": "batch exceeds the configured limit",
            "constraint": "max_batch_size",
        });

        let verdict = parse_verdict(&body, &fixture_candidates());
        assert!(verdict.is_ok());
        match verdict {
            Ok(GateVerdict::RejectedBatch(rejection)) => {
                assert_eq!(rejection.reason, "batch exceeds the configured limit");
                assert_eq!(rejection.constraint_name.as_deref(), Some("max_batch_size"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_approved_id_is_an_error() {
        let body = json!({
            "decision": "cleared",
            "approved": ["not-a-real-action-id"],
        });
        assert!(parse_verdict(&body, &fixture_candidates()).is_err());
    }

    #[test]
    fn unknown_decision_is_an_error() {
        let body = json!({"decision": "maybe"});
        assert!(parse_verdict(&body, &fixture_candidates()).is_err());
        assert!(parse_verdict(&json!({}), &fixture_candidates()).is_err());
    }

    #[test]
    fn ack_statuses_parse() {
        let applied = parse_ack(&json!({"status": "applied", "detail": {"pr": 42}}));
        assert!(applied.is_ok());
        match applied {
            Ok(ack) => {
                assert!(!ack.already_applied);
                assert_eq!(ack.detail, json!({"pr": 42}));
            }
            Err(_) => unreachable!(),
        }

        let duplicate = parse_ack(&json!({"status": "already_applied"}));
        assert!(duplicate.is_ok());
        match duplicate {
            Ok(ack) => assert!(ack.already_applied),
            Err(_) => unreachable!(),
        }

        assert!(parse_ack(&json!({"status": "exploded"})).is_err());
        assert!(parse_ack(&json!({})).is_err());
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert_eq!(classify_status(500), FailureKind::Transient);
        assert_eq!(classify_status(503), FailureKind::Transient);
        assert_eq!(classify_status(400), FailureKind::Permanent);
        assert_eq!(classify_status(422), FailureKind::Permanent);
    }

    #[test]
    fn file_probe_reads_snapshot() {
        let path = temp_json_path("state");
        assert!(std::fs::write(&path, r#"{"repos": ["repo-a"]}"#).is_ok());

        let config = fixture_config(json!({"probe": {"state_file": path}}));
        let state = FileStateProbe.discover(&config);
        assert!(state.is_ok());
        match state {
            Ok(state) => assert_eq!(state.snapshot, json!({"repos": ["repo-a"]})),
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn file_probe_treats_missing_file_as_empty() {
        let config = fixture_config(json!({"probe": {"state_file": temp_json_path("absent")}}));
        let state = FileStateProbe.discover(&config);
        assert!(state.is_ok());
        match state {
            Ok(state) => assert_eq!(state.snapshot, Value::Null),
            Err(_) => unreachable!(),
        }

        let unconfigured = FileStateProbe.discover(&fixture_config(Value::Null));
        assert!(unconfigured.is_ok());
    }

    #[test]
    fn file_probe_rejects_malformed_snapshot() {
        let path = temp_json_path("broken-state");
        assert!(std::fs::write(&path, "not json").is_ok());

        let config = fixture_config(json!({"probe": {"state_file": path}}));
        let state = FileStateProbe.discover(&config);
        assert!(state.is_err());
        match state {
            Err(failure) => {
                assert_eq!(failure.stage, Stage::Discover);
                assert!(!failure.is_transient());
            }
            Ok(_) => unreachable!(),
        }
    }

    #[test]
    fn file_planner_reads_actions() {
        let path = temp_json_path("plan");
        let plan = json!([
            {"kind": "archive_branch", "target": "repo-a#stale/exp-1"},
            {"kind": "close_pr", "target": "repo-a#42", "parameters": {"comment": "stale"}},
        ]);
        assert!(std::fs::write(&path, plan.to_string()).is_ok());

        let config = fixture_config(json!({"planner": {"plan_file": path}}));
        let planned = FilePlanner.plan(&config, &EnvironmentState::empty());
        assert!(planned.is_ok());
        let planned = planned.unwrap_or_else(|_| unreachable!());
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].kind, "archive_branch");
        assert_eq!(planned[1].parameters, json!({"comment": "stale"}));
    }

    #[test]
    fn file_planner_treats_missing_file_as_empty_plan() {
        let config = fixture_config(json!({"planner": {"plan_file": temp_json_path("absent")}}));
        let planned = FilePlanner.plan(&config, &EnvironmentState::empty());
        assert!(planned.is_ok());
        assert!(planned.unwrap_or_else(|_| unreachable!()).is_empty());
    }

    #[test]
    fn file_planner_rejects_malformed_plan() {
        let path = temp_json_path("broken-plan");
        assert!(std::fs::write(&path, r#"[{"kind": "x"}]"#).is_ok());

        let config = fixture_config(json!({"planner": {"plan_file": path}}));
        let planned = FilePlanner.plan(&config, &EnvironmentState::empty());
        assert!(planned.is_err());
        match planned {
            Err(failure) => assert_eq!(failure.stage, Stage::Plan),
            Ok(_) => unreachable!(),
        }
    }
}
