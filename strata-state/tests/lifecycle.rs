//! Plan/apply/destroy cycles against real backends under the state lock

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_core::config::{self, ResourceDefinition};
use strata_core::differ::{create_plan, plan_destroy};
use strata_core::executor::{CancelSignal, Executor, ExecutorConfig, NodeStatus, RetryPolicy, RunReport, RunState};
use strata_core::graph::GraphBuilder;
use strata_core::plan::Plan;
use strata_core::provider::{BoxFuture, Provider, ProviderError, ProviderRegistry, ProviderResult, ResourceType};
use strata_core::resource::{Resource, ResourceId, State, Value};
use strata_state::{BackendError, LocalBackend, LockOptions, MemoryBackend, StateBackend, StateStore, with_state_lock};

/// Pretend cloud: keeps created resources in memory, fails creates on demand
#[derive(Default)]
struct CloudSim {
    resources: Mutex<HashMap<String, HashMap<String, Value>>>,
    failing: Mutex<HashSet<String>>,
    counter: AtomicUsize,
    calls: AtomicUsize,
}

impl CloudSim {
    fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn live(&self) -> usize {
        self.resources.lock().unwrap().len()
    }
}

impl Provider for CloudSim {
    fn name(&self) -> &'static str {
        "cloudsim"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        vec![]
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            match self.resources.lock().unwrap().get(&identifier) {
                Some(attrs) => Ok(State::existing(id, attrs.clone()).with_identifier(identifier)),
                None => Ok(State::not_found(id)),
            }
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&resource.id.name) {
                return Err(ProviderError::new("quota exceeded").for_resource(resource.id));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let identifier = format!("{}-{:04}", resource.id.kind, n);
            self.resources
                .lock()
                .unwrap()
                .insert(identifier.clone(), resource.attributes.clone());
            Ok(State::existing(resource.id, resource.attributes).with_identifier(identifier))
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let attrs = to.attributes.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.resources
                .lock()
                .unwrap()
                .insert(identifier.clone(), attrs.clone());
            Ok(State::existing(id, attrs).with_identifier(identifier))
        })
    }

    fn delete(&self, _id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let identifier = identifier.to_string();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.resources.lock().unwrap().remove(&identifier);
            Ok(())
        })
    }
}

const NETWORK: &str = r#"{
  "resources": [
    { "kind": "vpc", "name": "v", "attributes": { "cidr_block": "10.0.0.0/16" } },
    { "kind": "subnet", "name": "s", "count": 2, "attributes": {
        "vpc_id": "${vpc.v.id}",
        "availability_zone": { "$select": ["us-east-1a", "us-east-1b"] },
        "name": "subnet-${count.index}" } },
    { "kind": "iam_role", "name": "cluster", "attributes": { "name": "eks-cluster" } }
  ]
}"#;

fn definitions() -> Vec<ResourceDefinition> {
    config::parse(NETWORK).unwrap().resources
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        parallelism: 4,
        retry: RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    }
}

async fn plan_only(defs: &[ResourceDefinition], backend: Arc<dyn StateBackend>, provider: Arc<CloudSim>) -> Plan {
    let registry = ProviderRegistry::new().with_fallback(provider);
    let graph = GraphBuilder::new(defs).with_registry(&registry).build().unwrap();
    let store = StateStore::load(backend).await.unwrap();
    create_plan(&graph, &store.snapshot().unwrap(), &registry).unwrap()
}

async fn apply(
    defs: &[ResourceDefinition],
    backend: Arc<dyn StateBackend>,
    provider: Arc<CloudSim>,
    destroy: bool,
) -> Result<RunReport, BackendError> {
    let registry = ProviderRegistry::new().with_fallback(provider);
    let graph = GraphBuilder::new(defs).with_registry(&registry).build().unwrap();
    let session_backend = backend.clone();

    with_state_lock(&*backend, "apply", &LockOptions::fail_fast(), move |_| async move {
        let mut store = StateStore::load(session_backend).await?;
        let snapshot = store.snapshot()?;
        let plan = if destroy {
            plan_destroy(&snapshot)
        } else {
            create_plan(&graph, &snapshot, &registry).unwrap()
        };
        let executor = Executor::new(registry).with_config(executor_config());
        Ok::<_, BackendError>(
            executor
                .apply(&plan, &snapshot, &mut store, &CancelSignal::never())
                .await,
        )
    })
    .await?
}

#[tokio::test]
async fn apply_twice_then_destroy_with_local_backend() {
    let dir = tempfile::tempdir().unwrap();
    let local = || -> Arc<dyn StateBackend> { Arc::new(LocalBackend::new(dir.path(), "prod/eks", "locks")) };
    let provider = Arc::new(CloudSim::default());
    let defs = definitions();

    let report = apply(&defs, local(), provider.clone(), false).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.done().len(), 4);
    assert_eq!(provider.live(), 4);

    // A fresh backend instance reads what the first run persisted
    let persisted = local().read_state().await.unwrap().unwrap();
    assert_eq!(persisted.serial, 4);
    let subnet = persisted
        .resources
        .iter()
        .find(|r| r.kind == "subnet" && r.index == Some(1))
        .unwrap();
    assert_eq!(subnet.attributes["availability_zone"], serde_json::json!("us-east-1b"));
    assert_eq!(subnet.attributes["name"], serde_json::json!("subnet-1"));
    assert_eq!(subnet.dependencies, vec!["vpc.v"]);

    let again = plan_only(&defs, local(), provider.clone()).await;
    assert!(again.is_empty(), "second plan not empty: {:?}", again.effects());

    let calls_before = provider.calls.load(Ordering::SeqCst);
    let report = apply(&defs, local(), provider.clone(), false).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);

    let report = apply(&defs, local(), provider.clone(), true).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(provider.live(), 0);
    assert!(local().read_state().await.unwrap().unwrap().resources.is_empty());
    assert!(!dir.path().join("locks/prod/eks.lock").exists());
}

#[tokio::test]
async fn partial_failure_is_recorded_and_converges_on_rerun() {
    let backend = MemoryBackend::new();
    let provider = Arc::new(CloudSim::default());
    provider.fail("v");
    let defs = definitions();

    let report = apply(&defs, Arc::new(backend.clone()), provider.clone(), false)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::CompletedWithErrors);
    assert_eq!(report.failed().len(), 1);
    assert_eq!(report.skipped().len(), 2);
    assert!(report.skipped().iter().all(|o| o.error.is_some()));

    // Only the independent role was realized and recorded
    let state = backend.read_state().await.unwrap().unwrap();
    assert_eq!(state.resources.len(), 1);
    assert_eq!(state.resources[0].kind, "iam_role");

    provider.heal();
    let plan = plan_only(&defs, Arc::new(backend.clone()), provider.clone()).await;
    assert_eq!(plan.summary().create, 3);

    let report = apply(&defs, Arc::new(backend.clone()), provider.clone(), false)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(
        plan_only(&defs, Arc::new(backend), provider)
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn held_lock_blocks_apply_before_any_provider_call() {
    let backend = MemoryBackend::new();
    let provider = Arc::new(CloudSim::default());
    let held = backend.acquire_lock("apply").await.unwrap();

    let err = apply(&definitions(), Arc::new(backend.clone()), provider.clone(), false)
        .await
        .unwrap_err();
    assert!(err.is_locked());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.current_lock(), Some(held));
}

#[tokio::test]
async fn state_write_failure_aborts_the_run() {
    let backend = MemoryBackend::new();
    backend.fail_writes_after(0);
    let provider = Arc::new(CloudSim::default());
    let defs = vec![
        ResourceDefinition::new("vpc", "v")
            .with_json_attribute("cidr_block", serde_json::json!("10.0.0.0/16"))
            .unwrap(),
        ResourceDefinition::new("subnet", "s")
            .with_json_attribute("vpc_id", serde_json::json!("${vpc.v.id}"))
            .unwrap(),
    ];

    let report = apply(&defs, Arc::new(backend.clone()), provider.clone(), false)
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Aborted);
    assert!(report.abort_reason.is_some());
    assert_eq!(report.outcomes[0].status, NodeStatus::Failed);
    assert_eq!(report.outcomes[1].status, NodeStatus::Skipped);
    assert!(backend.current_lock().is_none());
}
