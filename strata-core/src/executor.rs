//! Executor - Apply a Plan against providers
//!
//! Every effect whose prerequisites are done becomes eligible at once and
//! runs concurrently with the others, up to `parallelism` in flight. A failed
//! effect marks all of its transitive dependents Skipped. Each result is
//! written to the state store as soon as it arrives, from this single
//! coordinating task, so a partial run leaves state matching what was
//! actually realized.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{Id, JoinSet};

use crate::config::Settings;
use crate::effect::{Action, Effect};
use crate::plan::Plan;
use crate::provider::{BoxFuture, Provider, ProviderError, ProviderRegistry, ProviderResult};
use crate::resource::{AttributeRef, Resource, ResourceId, State};
use crate::snapshot::{StateRecord, StateSnapshot, StateWriter};

/// Backoff for retryable provider errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of effects in flight
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Settings> for ExecutorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            parallelism: settings.parallelism,
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: Duration::from_millis(settings.retry_base_delay_ms),
                max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            },
        }
    }
}

/// Status of one node over a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Planned,
    InProgress,
    Done,
    Failed,
    /// A dependency failed; never attempted
    Skipped,
    /// Never started because the run was cancelled or aborted
    Cancelled,
}

/// Status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No apply has started yet
    Idle,
    Running,
    Completed,
    CompletedWithErrors,
    Aborted,
}

/// Result of one effect
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub id: ResourceId,
    pub action: Action,
    pub status: NodeStatus,
    /// Provider calls made, including retries
    pub attempts: u32,
    pub error: Option<String>,
}

/// Result of executing the entire Plan
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// One outcome per effect, in plan order
    pub outcomes: Vec<OperationOutcome>,
    /// Why the run stopped early (state write failure)
    pub abort_reason: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&OperationOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }

    pub fn done(&self) -> Vec<&OperationOutcome> {
        self.with_status(NodeStatus::Done)
    }

    pub fn failed(&self) -> Vec<&OperationOutcome> {
        self.with_status(NodeStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<&OperationOutcome> {
        self.with_status(NodeStatus::Skipped)
    }

    pub fn cancelled(&self) -> Vec<&OperationOutcome> {
        self.with_status(NodeStatus::Cancelled)
    }
}

/// Receiving side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Raising side of a cancellation signal
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

pub fn cancellation() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, CancelSignal { rx })
}

/// Callback invoked whenever an effect reaches a final status
pub type Observer = Arc<dyn Fn(&Effect, &OperationOutcome) + Send + Sync>;

/// Executes Plans using the providers of a registry
pub struct Executor {
    registry: ProviderRegistry,
    config: ExecutorConfig,
    observer: Option<Observer>,
    run_state: watch::Sender<RunState>,
}

/// Provider call prepared with fully resolved attributes
enum Job {
    Create(Resource),
    Update {
        identifier: String,
        from: State,
        to: Resource,
    },
    Replace {
        old_identifier: String,
        to: Resource,
    },
    Delete {
        id: ResourceId,
        identifier: String,
    },
}

struct JobResult {
    attempts: u32,
    /// The existing instance was deleted (replace), even if the create then failed
    removed_old: bool,
    /// New state for create/update/replace, None for delete
    outcome: ProviderResult<Option<State>>,
}

impl Executor {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            observer: None,
            run_state: watch::channel(RunState::Idle).0,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current run state: Idle, Running, or the outcome of the last apply
    pub fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    /// Follow run state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    /// Execute a Plan, causing side effects and recording each result in `state`
    ///
    /// `snapshot` is the state the plan was computed from; it supplies values
    /// for references to resources the plan does not touch.
    pub async fn apply<W>(
        &self,
        plan: &Plan,
        snapshot: &StateSnapshot,
        state: &mut W,
        cancel: &CancelSignal,
    ) -> RunReport
    where
        W: StateWriter + ?Sized,
    {
        let effects = plan.effects();
        let prerequisites = plan.prerequisites();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); effects.len()];
        for (i, waits) in prerequisites.iter().enumerate() {
            for &j in waits {
                dependents[j].push(i);
            }
        }

        let mut pending: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
        let mut outcomes: Vec<OperationOutcome> = effects
            .iter()
            .map(|e| OperationOutcome {
                id: e.id().clone(),
                action: e.action(),
                status: NodeStatus::Planned,
                attempts: 0,
                error: None,
            })
            .collect();
        let mut ready: BTreeSet<usize> = (0..effects.len()).filter(|&i| pending[i] == 0).collect();
        let mut realized: HashMap<ResourceId, StateRecord> = snapshot
            .records()
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();

        let mut running: JoinSet<JobResult> = JoinSet::new();
        let mut tasks: HashMap<Id, (usize, Option<Resource>)> = HashMap::new();
        let mut abort_reason: Option<String> = None;
        let parallelism = self.config.parallelism.max(1);

        self.run_state.send_replace(RunState::Running);
        log::info!(
            "applying {} effects (parallelism {})",
            effects.len(),
            parallelism
        );

        loop {
            if abort_reason.is_none() && !cancel.is_cancelled() {
                while running.len() < parallelism {
                    let Some(i) = ready.pop_first() else {
                        break;
                    };
                    match self.prepare(&effects[i], &realized) {
                        Ok((provider, job)) => {
                            let resolved = match &job {
                                Job::Create(r) | Job::Replace { to: r, .. } | Job::Update { to: r, .. } => {
                                    Some(r.clone())
                                }
                                Job::Delete { .. } => None,
                            };
                            log::debug!("starting {}", effects[i]);
                            outcomes[i].status = NodeStatus::InProgress;
                            let handle = running.spawn(run_job(provider, job, self.config.retry.clone()));
                            tasks.insert(handle.id(), (i, resolved));
                        }
                        Err(message) => {
                            self.fail(i, message, 0, effects, &dependents, &mut outcomes);
                        }
                    }
                }
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => (
                    e.id(),
                    JobResult {
                        attempts: 1,
                        removed_old: false,
                        outcome: Err(ProviderError::new(format!("provider task failed: {}", e))),
                    },
                ),
            };
            let Some((i, resolved)) = tasks.remove(&task_id) else {
                continue;
            };
            let effect = &effects[i];
            let id = effect.id();

            if result.removed_old {
                realized.remove(id);
                if let Err(e) = state.record_removal(id).await {
                    log::error!("{}: {}", id, e);
                    abort_reason.get_or_insert_with(|| e.to_string());
                }
            }

            match result.outcome {
                Ok(new_state) => {
                    let write = match new_state {
                        Some(new_state) => {
                            let record = build_record(effect, resolved, new_state);
                            realized.insert(id.clone(), record.clone());
                            state.record_success(record).await
                        }
                        None => {
                            realized.remove(id);
                            state.record_removal(id).await
                        }
                    };
                    if let Err(e) = write {
                        log::error!("{}: {}", id, e);
                        abort_reason.get_or_insert_with(|| e.to_string());
                        self.fail(i, e.to_string(), result.attempts, effects, &dependents, &mut outcomes);
                        continue;
                    }

                    log::info!("{} complete", effect);
                    outcomes[i].status = NodeStatus::Done;
                    outcomes[i].attempts = result.attempts;
                    self.notify(effect, &outcomes[i]);
                    for &j in &dependents[i] {
                        pending[j] -= 1;
                        if pending[j] == 0 && outcomes[j].status == NodeStatus::Planned {
                            ready.insert(j);
                        }
                    }
                }
                Err(e) => {
                    log::error!("{} failed: {}", effect, e);
                    self.fail(i, e.to_string(), result.attempts, effects, &dependents, &mut outcomes);
                }
            }
        }

        let stopped = abort_reason.is_some() || cancel.is_cancelled();
        for (i, outcome) in outcomes.iter_mut().enumerate() {
            if outcome.status != NodeStatus::Planned {
                continue;
            }
            if stopped {
                outcome.status = NodeStatus::Cancelled;
            } else {
                // Only reachable when prerequisites form a cycle (corrupt state)
                outcome.status = NodeStatus::Skipped;
                outcome.error = Some("prerequisites never completed".to_string());
            }
            self.notify(&effects[i], outcome);
        }

        let run_state = if stopped && outcomes.iter().any(|o| o.status == NodeStatus::Cancelled)
            || abort_reason.is_some()
        {
            RunState::Aborted
        } else if outcomes.iter().all(|o| o.status == NodeStatus::Done) {
            RunState::Completed
        } else {
            RunState::CompletedWithErrors
        };
        log::info!("run finished: {:?}", run_state);
        self.run_state.send_replace(run_state);

        RunReport {
            state: run_state,
            outcomes,
            abort_reason,
        }
    }

    /// Resolve references and pick the provider for an effect
    fn prepare(
        &self,
        effect: &Effect,
        realized: &HashMap<ResourceId, StateRecord>,
    ) -> Result<(Arc<dyn Provider>, Job), String> {
        let kind = &effect.id().kind;
        let provider = self
            .registry
            .get(kind)
            .ok_or_else(|| format!("no provider registered for kind '{}'", kind))?;

        let job = match effect {
            Effect::Create(r) => Job::Create(resolve(r, realized)?),
            Effect::Update { from, to, .. } => Job::Update {
                identifier: from.identifier.clone(),
                from: record_to_state(from),
                to: resolve(to, realized)?,
            },
            Effect::Replace { from, to, .. } => Job::Replace {
                old_identifier: from.identifier.clone(),
                to: resolve(to, realized)?,
            },
            Effect::Delete(record) => Job::Delete {
                id: record.id.clone(),
                identifier: record.identifier.clone(),
            },
        };
        Ok((provider, job))
    }

    fn fail(
        &self,
        i: usize,
        message: String,
        attempts: u32,
        effects: &[Effect],
        dependents: &[Vec<usize>],
        outcomes: &mut [OperationOutcome],
    ) {
        outcomes[i].status = NodeStatus::Failed;
        outcomes[i].attempts = attempts;
        outcomes[i].error = Some(message);
        self.notify(&effects[i], &outcomes[i]);

        let mut stack = dependents[i].clone();
        while let Some(j) = stack.pop() {
            if outcomes[j].status != NodeStatus::Planned {
                continue;
            }
            log::warn!("skipping {}: {} failed", effects[j], effects[i].id());
            outcomes[j].status = NodeStatus::Skipped;
            outcomes[j].error = Some(format!("dependency {} failed", effects[i].id()));
            self.notify(&effects[j], &outcomes[j]);
            stack.extend(dependents[j].iter().copied());
        }
    }

    fn notify(&self, effect: &Effect, outcome: &OperationOutcome) {
        if let Some(observer) = &self.observer {
            observer(effect, outcome);
        }
    }
}

fn resolve(resource: &Resource, realized: &HashMap<ResourceId, StateRecord>) -> Result<Resource, String> {
    let lookup = |r: &AttributeRef| realized.get(&r.target).and_then(|rec| rec.attribute(&r.attribute));

    let mut attributes = HashMap::new();
    for (key, value) in &resource.attributes {
        let resolved = value.resolve_with(&lookup);
        if !resolved.is_known() {
            let mut refs = Vec::new();
            value.collect_refs(&mut refs);
            let names: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
            return Err(format!(
                "{}.{} references values that are not available: {}",
                resource.id,
                key,
                names.join(", ")
            ));
        }
        attributes.insert(key.clone(), resolved);
    }

    Ok(Resource {
        id: resource.id.clone(),
        attributes,
        dependencies: resource.dependencies.clone(),
    })
}

fn record_to_state(record: &StateRecord) -> State {
    State::existing(record.id.clone(), record.attributes.clone()).with_identifier(&record.identifier)
}

fn build_record(effect: &Effect, resolved: Option<Resource>, new_state: State) -> StateRecord {
    let identifier = new_state
        .identifier
        .or_else(|| effect.prior().map(|p| p.identifier.clone()))
        .unwrap_or_default();

    let (mut attributes, dependencies) = match resolved {
        Some(r) => (r.attributes, r.dependencies),
        None => (HashMap::new(), Vec::new()),
    };
    attributes.extend(new_state.attributes);

    StateRecord {
        id: effect.id().clone(),
        identifier,
        attributes,
        dependencies,
    }
}

async fn run_job(provider: Arc<dyn Provider>, job: Job, retry: RetryPolicy) -> JobResult {
    match job {
        Job::Create(resource) => {
            let (outcome, attempts) =
                with_retries(&retry, &resource.id, || provider.create(&resource)).await;
            JobResult {
                attempts,
                removed_old: false,
                outcome: outcome.and_then(require_identifier).map(Some),
            }
        }
        Job::Update {
            identifier,
            from,
            to,
        } => {
            let (outcome, attempts) = with_retries(&retry, &to.id, || {
                provider.update(&to.id, &identifier, &from, &to)
            })
            .await;
            JobResult {
                attempts,
                removed_old: false,
                outcome: outcome.map(Some),
            }
        }
        Job::Replace { old_identifier, to } => {
            let (deleted, mut attempts) =
                with_retries(&retry, &to.id, || provider.delete(&to.id, &old_identifier)).await;
            if let Err(e) = deleted {
                return JobResult {
                    attempts,
                    removed_old: false,
                    outcome: Err(e),
                };
            }
            let (created, more) = with_retries(&retry, &to.id, || provider.create(&to)).await;
            attempts += more;
            JobResult {
                attempts,
                removed_old: true,
                outcome: created.and_then(require_identifier).map(Some),
            }
        }
        Job::Delete { id, identifier } => {
            let (outcome, attempts) =
                with_retries(&retry, &id, || provider.delete(&id, &identifier)).await;
            JobResult {
                attempts,
                removed_old: false,
                outcome: outcome.map(|()| None),
            }
        }
    }
}

fn require_identifier(state: State) -> ProviderResult<State> {
    if state.identifier.is_some() {
        Ok(state)
    } else {
        Err(ProviderError::new("provider returned no identifier").for_resource(state.id))
    }
}

/// Call `operation` until it succeeds, fails fatally, or retries run out
async fn with_retries<'a, T, F>(
    policy: &RetryPolicy,
    id: &ResourceId,
    mut operation: F,
) -> (ProviderResult<T>, u32)
where
    F: FnMut() -> BoxFuture<'a, ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "{}: {} (attempt {}/{}), retrying in {:?}",
                    id,
                    e,
                    attempt,
                    policy.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            result => return (result, attempt),
        }
    }
}
