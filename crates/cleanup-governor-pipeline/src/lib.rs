#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cleanup_governor_audit_core::AuditSink;
use cleanup_governor_domain::{
    now_utc, ActionCandidate, ApprovedAction, BatchRejection, ConstraintSet, DeclinedCandidate,
    Domain, DomainConfig, DomainConfigEnvelope, EnvironmentState, ErrorEnvelope, ExecutionFailure,
    ExecutionResult, ExecutionStatus, GateVerdict, PlannedAction, RunId, RunLimits, RunOutcome,
    RunRecord, Stage, StageFailure,
};
use serde_json::Value;

pub const ENGINE_VERSION: &str = "cleanup-governor.v0";

/// Observes the current state of a domain's environment.
#[allow(clippy::missing_errors_doc)]
pub trait StateProbe: Sync {
    fn discover(&self, config: &DomainConfig) -> Result<EnvironmentState, StageFailure>;
}

/// Proposes remediations from an observed state. Planner output carries no
/// identity; the pipeline derives it so identity rules hold for every
/// planner implementation.
#[allow(clippy::missing_errors_doc)]
pub trait Planner: Sync {
    fn plan(
        &self,
        config: &DomainConfig,
        state: &EnvironmentState,
    ) -> Result<Vec<PlannedAction>, StageFailure>;
}

/// Reviews a candidate batch against the domain's constraints.
///
/// A gate decides; it does not fail a run. Unreachable or broken gates are
/// stage failures, rejection is a [`GateVerdict`].
#[allow(clippy::missing_errors_doc)]
pub trait ValidationGate: Sync {
    fn review(
        &self,
        domain: &Domain,
        candidates: &[ActionCandidate],
        constraints: &ConstraintSet,
    ) -> Result<GateVerdict, StageFailure>;
}

/// Applies one approved action.
///
/// The signature is the execution safety boundary: there is no way to hand
/// an unapproved candidate to an executor.
#[allow(clippy::missing_errors_doc)]
pub trait Executor: Sync {
    fn execute(
        &self,
        domain: &Domain,
        action: &ApprovedAction,
    ) -> Result<ExecutionAck, ExecutionFailure>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionAck {
    pub already_applied: bool,
    pub detail: Value,
}

impl ExecutionAck {
    #[must_use]
    pub fn applied() -> Self {
        Self {
            already_applied: false,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn already_applied() -> Self {
        Self {
            already_applied: true,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Explicit run id for replay/correlation; a fresh id is minted when absent.
    pub run_id: Option<RunId>,
    pub triggered_by: String,
    pub engine_version: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            triggered_by: "manual".to_string(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: RunRecord,
    /// False when the audit sink stayed unreachable through its retry
    /// budget; the run outcome itself is unaffected.
    pub audit_recorded: bool,
}

/// One full governance cycle: discover, plan, validate, execute, audit.
pub struct GovernancePipeline<'a> {
    probe: &'a dyn StateProbe,
    planner: &'a dyn Planner,
    gate: &'a dyn ValidationGate,
    executor: &'a dyn Executor,
    sink: &'a dyn AuditSink,
}

impl<'a> GovernancePipeline<'a> {
    #[must_use]
    pub fn new(
        probe: &'a dyn StateProbe,
        planner: &'a dyn Planner,
        gate: &'a dyn ValidationGate,
        executor: &'a dyn Executor,
        sink: &'a dyn AuditSink,
    ) -> Self {
        Self {
            probe,
            planner,
            gate,
            executor,
            sink,
        }
    }

    /// Run one cycle for one domain. Infallible by construction: every
    /// stage failure folds into the audited outcome instead of escaping.
    pub fn run_once(&self, envelope: &DomainConfigEnvelope, options: &RunOptions) -> RunReport {
        let config = &envelope.config;
        let run_id = options.run_id.unwrap_or_else(RunId::new);
        let span =
            tracing::info_span!("governance_run", domain = %config.domain, run_id = %run_id);
        let _guard = span.enter();
        tracing::info!(
            triggered_by = %options.triggered_by,
            config_hash = %envelope.config_hash,
            "governance run started"
        );

        let draft = RunDraft::start(envelope, options, run_id);
        let record = self.drive(config, draft);
        let audit_recorded = self.append_with_retry(&record, &config.limits);

        tracing::info!(
            outcome = record.outcome.as_str(),
            candidates = record.candidates.len(),
            approved = record.approved.len(),
            declined = record.declined.len(),
            audit_recorded,
            "governance run finished"
        );

        RunReport {
            record,
            audit_recorded,
        }
    }

    fn drive(&self, config: &DomainConfig, mut draft: RunDraft) -> RunRecord {
        let state = match self.probe.discover(config) {
            Ok(state) => state,
            Err(failure) => return draft.into_aborted(failure),
        };

        let planned = match self.planner.plan(config, &state) {
            Ok(planned) => planned,
            Err(failure) => return draft.into_aborted(failure),
        };
        for action in planned {
            match action.into_candidate(&config.domain) {
                Ok(candidate) => draft.candidates.push(candidate),
                Err(err) => {
                    return draft.into_aborted(StageFailure::permanent(
                        Stage::Plan,
                        format!("failed to derive action identity: {err}"),
                    ));
                }
            }
        }

        if draft.candidates.is_empty() {
            tracing::info!("no candidates proposed; nothing to validate");
            return draft.into_record(RunOutcome::Completed, None);
        }

        let verdict = match self.review_with_retry(
            &config.domain,
            &draft.candidates,
            &config.constraints,
            &config.limits,
        ) {
            Ok(verdict) => verdict,
            Err(failure) => return draft.into_aborted(failure),
        };

        match verdict {
            GateVerdict::RejectedBatch(rejection) => {
                tracing::info!(reason = %rejection.reason, "validation gate rejected the batch");
                draft.batch_rejection = Some(rejection);
                draft.into_record(RunOutcome::RejectedByValidator, None)
            }
            GateVerdict::Cleared { approved, declined } => {
                if let Err(failure) =
                    check_identity_preserved(&draft.candidates, &approved, &declined)
                {
                    return draft.into_aborted(failure);
                }

                draft.execution_results =
                    self.execute_all(&config.domain, &approved, config.limits.execute_fan_out);
                draft.approved = approved;
                draft.declined = declined;

                let outcome = if draft
                    .execution_results
                    .iter()
                    .all(|result| result.status.is_success())
                {
                    RunOutcome::Completed
                } else {
                    RunOutcome::ExecutionPartialFailure
                };
                draft.into_record(outcome, None)
            }
        }
    }

    fn review_with_retry(
        &self,
        domain: &Domain,
        candidates: &[ActionCandidate],
        constraints: &ConstraintSet,
        limits: &RunLimits,
    ) -> Result<GateVerdict, StageFailure> {
        let mut attempt = 1;
        loop {
            match self.gate.review(domain, candidates, constraints) {
                Ok(verdict) => return Ok(verdict),
                Err(failure) => {
                    if failure.is_transient() && attempt < limits.validate_attempts {
                        tracing::warn!(
                            attempt,
                            error = %failure,
                            "validation gate call failed; retrying"
                        );
                        std::thread::sleep(backoff_delay(limits.backoff_base_ms, attempt));
                        attempt += 1;
                    } else {
                        return Err(failure);
                    }
                }
            }
        }
    }

    fn execute_all(
        &self,
        domain: &Domain,
        approved: &[ApprovedAction],
        fan_out: usize,
    ) -> Vec<ExecutionResult> {
        if approved.is_empty() {
            return Vec::new();
        }

        let queue: Mutex<VecDeque<(usize, &ApprovedAction)>> =
            Mutex::new(approved.iter().enumerate().collect());
        let collected: Mutex<Vec<(usize, ExecutionResult)>> =
            Mutex::new(Vec::with_capacity(approved.len()));
        let workers = fan_out.clamp(1, approved.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = lock(&queue).pop_front();
                    let Some((index, action)) = next else {
                        break;
                    };
                    let result = self.execute_one(domain, action);
                    lock(&collected).push((index, result));
                });
            }
        });

        let mut results = collected
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn execute_one(&self, domain: &Domain, action: &ApprovedAction) -> ExecutionResult {
        let started_at = now_utc();
        match self.executor.execute(domain, action) {
            Ok(ack) => ExecutionResult {
                action_id: action.action_id().clone(),
                kind: action.kind().to_string(),
                target: action.target().to_string(),
                status: if ack.already_applied {
                    ExecutionStatus::AlreadyApplied
                } else {
                    ExecutionStatus::Applied
                },
                detail: ack.detail,
                error: None,
                started_at,
                ended_at: now_utc(),
            },
            Err(failure) => {
                tracing::warn!(
                    action_id = %action.action_id(),
                    error = %failure,
                    "action execution failed"
                );
                ExecutionResult {
                    action_id: action.action_id().clone(),
                    kind: action.kind().to_string(),
                    target: action.target().to_string(),
                    status: ExecutionStatus::Failed,
                    detail: failure.detail,
                    error: Some(ErrorEnvelope {
                        code: "execution_failure".to_string(),
                        message: failure.message,
                    }),
                    started_at,
                    ended_at: now_utc(),
                }
            }
        }
    }

    fn append_with_retry(&self, record: &RunRecord, limits: &RunLimits) -> bool {
        let mut attempt = 1;
        loop {
            match self.sink.append(record) {
                Ok(()) => return true,
                Err(err) => {
                    if attempt < limits.audit_attempts {
                        tracing::warn!(attempt, error = %err, "audit append failed; retrying");
                        std::thread::sleep(backoff_delay(limits.backoff_base_ms, attempt));
                        attempt += 1;
                    } else {
                        tracing::error!(
                            error = %err,
                            "audit append failed; run record not persisted"
                        );
                        return false;
                    }
                }
            }
        }
    }
}

struct RunDraft {
    run_id: RunId,
    domain: Domain,
    config_hash: String,
    constraints: ConstraintSet,
    constraint_fingerprint: String,
    triggered_by: String,
    engine_version: String,
    started_at: cleanup_governor_domain::DateTimeUtc,
    summary: String,
    candidates: Vec<ActionCandidate>,
    approved: Vec<ApprovedAction>,
    declined: Vec<DeclinedCandidate>,
    batch_rejection: Option<BatchRejection>,
    execution_results: Vec<ExecutionResult>,
}

impl RunDraft {
    fn start(envelope: &DomainConfigEnvelope, options: &RunOptions, run_id: RunId) -> Self {
        let config = &envelope.config;
        // Serializing the rule set cannot fail for JSON-safe values.
        let constraint_fingerprint = config.constraints.fingerprint().unwrap_or_default();
        let summary = config
            .summary
            .clone()
            .unwrap_or_else(|| format!("{} cleanup", config.domain));
        Self {
            run_id,
            domain: config.domain.clone(),
            config_hash: envelope.config_hash.clone(),
            constraints: config.constraints.clone(),
            constraint_fingerprint,
            triggered_by: options.triggered_by.clone(),
            engine_version: options.engine_version.clone(),
            started_at: now_utc(),
            summary,
            candidates: Vec::new(),
            approved: Vec::new(),
            declined: Vec::new(),
            batch_rejection: None,
            execution_results: Vec::new(),
        }
    }

    fn into_aborted(self, failure: StageFailure) -> RunRecord {
        tracing::error!(
            stage = failure.stage.as_str(),
            kind = failure.kind.as_str(),
            error = %failure,
            "governance run aborted"
        );
        self.into_record(RunOutcome::AbortedByError, Some(failure))
    }

    fn into_record(self, outcome: RunOutcome, failure: Option<StageFailure>) -> RunRecord {
        let failure = failure.map(|failure| ErrorEnvelope {
            code: format!("{}_failure", failure.stage.as_str()),
            message: failure.to_string(),
        });
        RunRecord {
            run_id: self.run_id,
            domain: self.domain,
            config_hash: self.config_hash,
            constraints: self.constraints,
            constraint_fingerprint: self.constraint_fingerprint,
            triggered_by: self.triggered_by,
            engine_version: self.engine_version,
            started_at: self.started_at,
            ended_at: now_utc(),
            candidates: self.candidates,
            approved: self.approved,
            declined: self.declined,
            batch_rejection: self.batch_rejection,
            execution_results: self.execution_results,
            outcome,
            failure,
            summary: self.summary,
        }
    }
}

/// A surviving decision must reference a proposed candidate, exactly once.
/// Gates drop candidates; they never rename, merge, or invent them.
fn check_identity_preserved(
    candidates: &[ActionCandidate],
    approved: &[ApprovedAction],
    declined: &[DeclinedCandidate],
) -> Result<(), StageFailure> {
    let known: BTreeSet<_> = candidates
        .iter()
        .map(|candidate| &candidate.action_id)
        .collect();
    let mut seen = BTreeSet::new();

    let decided = approved
        .iter()
        .map(ApprovedAction::action_id)
        .chain(declined.iter().map(|declined| &declined.action_id));
    for action_id in decided {
        if !known.contains(action_id) {
            return Err(StageFailure::permanent(
                Stage::Validate,
                format!("gate returned unknown action id {action_id}"),
            ));
        }
        if !seen.insert(action_id) {
            return Err(StageFailure::permanent(
                Stage::Validate,
                format!("gate returned duplicate decision for action id {action_id}"),
            ));
        }
    }
    Ok(())
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(1_u64 << shift))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum ScheduledOutcome {
    Ran(RunReport),
    /// A run for the domain was still active; this cycle was dropped, not
    /// queued.
    OverlapSkipped,
}

impl ScheduledOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Ran(report) => Some(report),
            Self::OverlapSkipped => None,
        }
    }
}

/// Runs domains concurrently with per-domain mutual exclusion.
pub struct GovernorScheduler<'a> {
    pipeline: &'a GovernancePipeline<'a>,
    max_concurrency: usize,
    active: Mutex<BTreeSet<Domain>>,
}

impl<'a> GovernorScheduler<'a> {
    #[must_use]
    pub fn new(pipeline: &'a GovernancePipeline<'a>, max_concurrency: usize) -> Self {
        Self {
            pipeline,
            max_concurrency: max_concurrency.max(1),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Run one domain now, unless a run for it is already active.
    pub fn run_domain(
        &self,
        envelope: &DomainConfigEnvelope,
        options: &RunOptions,
    ) -> ScheduledOutcome {
        let domain = &envelope.config.domain;
        match self.acquire(domain) {
            Some(_lease) => ScheduledOutcome::Ran(self.pipeline.run_once(envelope, options)),
            None => {
                tracing::warn!(domain = %domain, "previous run still active; skipping cycle");
                ScheduledOutcome::OverlapSkipped
            }
        }
    }

    /// Run every registered domain once across a bounded worker pool.
    /// Each run gets a fresh run id regardless of `options.run_id`.
    pub fn run_all(
        &self,
        envelopes: &[DomainConfigEnvelope],
        options: &RunOptions,
    ) -> BTreeMap<Domain, ScheduledOutcome> {
        let per_run = RunOptions {
            run_id: None,
            ..options.clone()
        };
        let queue: Mutex<VecDeque<&DomainConfigEnvelope>> = Mutex::new(envelopes.iter().collect());
        let results: Mutex<BTreeMap<Domain, ScheduledOutcome>> = Mutex::new(BTreeMap::new());
        let workers = self.max_concurrency.clamp(1, envelopes.len().max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = lock(&queue).pop_front();
                    let Some(envelope) = next else {
                        break;
                    };
                    let outcome = self.run_domain(envelope, &per_run);
                    lock(&results).insert(envelope.config.domain.clone(), outcome);
                });
            }
        });

        results.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, domain: &Domain) -> Option<DomainLease<'_>> {
        let mut active = lock(&self.active);
        if active.insert(domain.clone()) {
            Some(DomainLease {
                active: &self.active,
                domain: domain.clone(),
            })
        } else {
            None
        }
    }
}

struct DomainLease<'a> {
    active: &'a Mutex<BTreeSet<Domain>>,
    domain: Domain,
}

impl Drop for DomainLease<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.domain);
    }
}

/// Probe that reports a fixed snapshot. Useful for drills and tests.
pub struct StaticStateProbe {
    pub snapshot: Value,
}

impl StateProbe for StaticStateProbe {
    fn discover(&self, _config: &DomainConfig) -> Result<EnvironmentState, StageFailure> {
        Ok(EnvironmentState {
            observed_at: now_utc(),
            snapshot: self.snapshot.clone(),
        })
    }
}

/// Planner that proposes a fixed action list.
pub struct StaticPlanner {
    pub actions: Vec<PlannedAction>,
}

impl Planner for StaticPlanner {
    fn plan(
        &self,
        _config: &DomainConfig,
        _state: &EnvironmentState,
    ) -> Result<Vec<PlannedAction>, StageFailure> {
        Ok(self.actions.clone())
    }
}

/// Gate that clears every candidate. Only suitable when no external gate is
/// configured and the operator accepts unreviewed execution.
pub struct AllowAllValidationGate {
    pub decided_by: String,
}

impl Default for AllowAllValidationGate {
    fn default() -> Self {
        Self {
            decided_by: "allow_all".to_string(),
        }
    }
}

impl ValidationGate for AllowAllValidationGate {
    fn review(
        &self,
        _domain: &Domain,
        candidates: &[ActionCandidate],
        _constraints: &ConstraintSet,
    ) -> Result<GateVerdict, StageFailure> {
        Ok(GateVerdict::Cleared {
            approved: candidates
                .iter()
                .cloned()
                .map(|candidate| ApprovedAction::clear(candidate, self.decided_by.clone()))
                .collect(),
            declined: Vec::new(),
        })
    }
}

/// Executor that acknowledges without side effects. Dry-run mode.
pub struct NoopExecutor;

impl Executor for NoopExecutor {
    fn execute(
        &self,
        _domain: &Domain,
        _action: &ApprovedAction,
    ) -> Result<ExecutionAck, ExecutionFailure> {
        Ok(ExecutionAck::applied().with_detail(serde_json::json!({"noop": true})))
    }
}
