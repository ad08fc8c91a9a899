#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named scope of infrastructure governed by one governor.
///
/// The domain is the partition key for scheduling concurrency, action
/// identity, and audit correlation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Domain(pub String);

impl Domain {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic action identity derived from (domain, kind, target, parameters).
///
/// Identity survives validation unchanged: a gate may drop candidates but a
/// surviving action keeps the identity the planner proposed it under, so a
/// re-run after a transient failure re-proposes the same identities.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActionId(pub String);

impl ActionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Constraint {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// Ordered set of named safety rules for one domain.
///
/// The set is immutable for the duration of a run and is handed to the
/// validation gate unmodified and in full; the core never strips,
/// reorders, or reinterprets a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ConstraintSet(pub Vec<Constraint>);

impl ConstraintSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.0.iter()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|rule| rule.name.as_str()).collect()
    }

    /// Stable hash of the full, ordered rule set.
    ///
    /// # Errors
    /// Returns an error if the set cannot be serialized.
    pub fn fingerprint(&self) -> Result<String> {
        hash_json(&serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Stage {
    Discover,
    Plan,
    Validate,
    Execute,
    Audit,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Plan => "plan",
            Self::Validate => "validate",
            Self::Execute => "execute",
            Self::Audit => "audit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discover" => Some(Self::Discover),
            "plan" => Some(Self::Plan),
            "validate" => Some(Self::Validate),
            "execute" => Some(Self::Execute),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one pipeline stage's external call.
///
/// Rejection by the validation gate is not a failure; it is a policy
/// decision modeled as [`GateVerdict::RejectedBatch`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{stage} stage failed ({kind}): {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Timeouts are classified as transient failures of the stage they hit.
    #[must_use]
    pub fn timeout(stage: Stage, timeout_ms: u64) -> Self {
        Self::transient(stage, format!("call timed out after {timeout_ms}ms"))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("action execution failed: {message}")]
pub struct ExecutionFailure {
    pub message: String,
    pub detail: Value,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A remediation proposed by a planner. Carries no authority to execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCandidate {
    pub action_id: ActionId,
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ActionCandidate {
    /// Build a candidate with its deterministic identity.
    ///
    /// # Errors
    /// Returns an error if the identity material cannot be serialized.
    pub fn new(domain: &Domain, kind: &str, target: &str, parameters: Value) -> Result<Self> {
        let material = json!({
            "domain": domain,
            "kind": kind,
            "target": target,
            "parameters": parameters,
        });
        let action_id = ActionId(hash_json(&material)?);
        Ok(Self {
            action_id,
            kind: kind.to_string(),
            target: target.to_string(),
            parameters,
        })
    }
}

/// Raw planner output before identity derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlannedAction {
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Value,
}

impl PlannedAction {
    /// Derive the candidate (and its identity) for a domain.
    ///
    /// # Errors
    /// Returns an error if the identity material cannot be serialized.
    pub fn into_candidate(self, domain: &Domain) -> Result<ActionCandidate> {
        ActionCandidate::new(domain, &self.kind, &self.target, self.parameters)
    }
}

/// A candidate cleared by the validation gate.
///
/// The executor interface only accepts this type; the type boundary is the
/// enforcement mechanism for "nothing executes without validation". The
/// wrapped candidate is deliberately private so approvals are only minted
/// through [`ApprovedAction::clear`] on the validation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovedAction {
    candidate: ActionCandidate,
    pub approved_by: String,
    pub approved_at: DateTimeUtc,
}

impl ApprovedAction {
    #[must_use]
    pub fn clear(candidate: ActionCandidate, approved_by: impl Into<String>) -> Self {
        Self {
            candidate,
            approved_by: approved_by.into(),
            approved_at: now_utc(),
        }
    }

    #[must_use]
    pub fn action_id(&self) -> &ActionId {
        &self.candidate.action_id
    }

    #[must_use]
    pub fn candidate(&self) -> &ActionCandidate {
        &self.candidate
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.candidate.kind
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.candidate.target
    }

    #[must_use]
    pub fn parameters(&self) -> &Value {
        &self.candidate.parameters
    }
}

/// A candidate the gate dropped, with the violated constraint named.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeclinedCandidate {
    pub action_id: ActionId,
    pub constraint_name: Option<String>,
    pub reason: String,
}

/// Whole-batch rejection by the gate. A policy decision, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRejection {
    pub reason: String,
    pub constraint_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Cleared {
        approved: Vec<ApprovedAction>,
        declined: Vec<DeclinedCandidate>,
    },
    RejectedBatch(BatchRejection),
}

/// Snapshot of external environment state. Opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentState {
    pub observed_at: DateTimeUtc,
    #[serde(default)]
    pub snapshot: Value,
}

impl EnvironmentState {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            observed_at: now_utc(),
            snapshot: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Applied,
    AlreadyApplied,
    Failed,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already_applied",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "applied" => Some(Self::Applied),
            "already_applied" => Some(Self::AlreadyApplied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyApplied)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

/// Per-action execution outcome, collected never escalated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub action_id: ActionId,
    pub kind: String,
    pub target: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub detail: Value,
    pub error: Option<ErrorEnvelope>,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    RejectedByValidator,
    ExecutionPartialFailure,
    AbortedByError,
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::RejectedByValidator => "rejected_by_validator",
            Self::ExecutionPartialFailure => "execution_partial_failure",
            Self::AbortedByError => "aborted_by_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "rejected_by_validator" => Some(Self::RejectedByValidator),
            "execution_partial_failure" => Some(Self::ExecutionPartialFailure),
            "aborted_by_error" => Some(Self::AbortedByError),
            _ => None,
        }
    }
}

/// The immutable audit entry for one full pipeline cycle of one domain.
///
/// Exactly one record is appended per run, after execution results are
/// known; it is never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub domain: Domain,
    pub config_hash: String,
    pub constraints: ConstraintSet,
    pub constraint_fingerprint: String,
    pub triggered_by: String,
    pub engine_version: String,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
    pub candidates: Vec<ActionCandidate>,
    pub approved: Vec<ApprovedAction>,
    pub declined: Vec<DeclinedCandidate>,
    pub batch_rejection: Option<BatchRejection>,
    pub execution_results: Vec<ExecutionResult>,
    pub outcome: RunOutcome,
    pub failure: Option<ErrorEnvelope>,
    pub summary: String,
}

/// Per-run limits and retry policy. Defaults match the shipped policy:
/// three validation attempts, two audit attempts, 250ms doubling backoff,
/// execution fan-out of four.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunLimits {
    #[serde(default = "default_validate_attempts")]
    pub validate_attempts: u32,
    #[serde(default = "default_audit_attempts")]
    pub audit_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_execute_fan_out")]
    pub execute_fan_out: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            validate_attempts: default_validate_attempts(),
            audit_attempts: default_audit_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            execute_fan_out: default_execute_fan_out(),
        }
    }
}

fn default_validate_attempts() -> u32 {
    3
}

fn default_audit_attempts() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_execute_fan_out() -> usize {
    4
}

/// One domain's configuration as the pipeline consumes it.
///
/// `scope` and `params` are opaque to the core; collaborators read what
/// they need out of them (probe state files, planner inputs, credentials
/// indirection). Constraints are the one part the core handles itself,
/// and only to pass them through whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub domain: Domain,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub scope: Value,
    #[serde(default)]
    pub constraints: ConstraintSet,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainConfigEnvelope {
    pub config_hash: String,
    pub config: DomainConfig,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}
