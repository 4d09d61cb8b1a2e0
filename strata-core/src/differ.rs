//! Differ - Compare desired nodes with recorded state to generate a Plan
//!
//! Walks the resource graph in topological order and compares each node with
//! its StateRecord. Records with no matching node are deleted, dependents
//! first.

use std::collections::{HashMap, HashSet};

use crate::effect::Effect;
use crate::error::ConfigError;
use crate::graph::{ResourceGraph, ResourceNode, topological_sort};
use crate::plan::Plan;
use crate::provider::{ProviderRegistry, ResourceSchema};
use crate::resource::{AttributeRef, ResourceId, Value};
use crate::snapshot::{StateRecord, StateSnapshot};

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// No record -> needs creation
    Create,
    /// Record differs -> update in place
    Update { changed_attributes: Vec<String> },
    /// Record differs in an immutable attribute -> delete and create
    Replace { changed_attributes: Vec<String> },
    /// Record matches -> no action needed
    NoChange,
}

/// Compare resolved desired attributes with the current record
///
/// Only declared attributes are compared; attributes the provider computed
/// and nobody declared never cause a change. An attribute that is not known
/// until apply always counts as changed.
pub fn diff(
    desired: &HashMap<String, Value>,
    current: Option<&StateRecord>,
    schema: Option<&ResourceSchema>,
) -> Diff {
    let Some(current) = current else {
        return Diff::Create;
    };

    let changed = find_changed_attributes(desired, &current.attributes);
    if changed.is_empty() {
        return Diff::NoChange;
    }

    let immutable = schema.is_some_and(|s| changed.iter().any(|k| s.is_immutable(k)));
    if immutable {
        Diff::Replace {
            changed_attributes: changed,
        }
    } else {
        Diff::Update {
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes between desired and current state
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> Vec<String> {
    let mut changed: Vec<String> = desired
        .iter()
        .filter(|(key, desired_value)| {
            !desired_value.is_known() || current.get(*key) != Some(*desired_value)
        })
        .map(|(key, _)| key.clone())
        .collect();
    changed.sort();
    changed
}

/// Compute the Plan that moves the recorded state to the desired graph
pub fn create_plan(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    registry: &ProviderRegistry,
) -> Result<Plan, ConfigError> {
    let mut plan = Plan::new();

    // Expected attributes of every node once this plan is applied;
    // nodes absent from the map are being (re)created.
    let mut expected: HashMap<ResourceId, HashMap<String, Value>> = HashMap::new();

    for node in graph.topological_order() {
        registry.require(&node.id.kind)?;

        let resolved = resolve_for_plan(node, &expected);
        let record = snapshot.get(&node.id);
        let dependencies: Vec<ResourceId> =
            graph.dependencies_of(&node.id).into_iter().cloned().collect();
        let desired = node.to_resource(dependencies);

        let d = diff(&resolved, record, registry.schema(&node.id.kind));
        log::debug!("{}: {:?}", node.id, d);

        match (d, record) {
            (Diff::NoChange, Some(record)) => {
                expected.insert(node.id.clone(), record_attributes(record));
            }
            (Diff::Update { changed_attributes }, Some(record)) => {
                let mut attrs = record_attributes(record);
                for (key, value) in resolved {
                    if value.is_known() {
                        attrs.insert(key, value);
                    } else {
                        attrs.remove(&key);
                    }
                }
                expected.insert(node.id.clone(), attrs);
                plan.add(Effect::Update {
                    from: record.clone(),
                    to: desired,
                    changed_attributes,
                });
            }
            (Diff::Replace { changed_attributes }, Some(record)) => {
                plan.add(Effect::Replace {
                    from: record.clone(),
                    to: desired,
                    changed_attributes,
                });
            }
            _ => plan.add(Effect::Create(desired)),
        }
    }

    let orphaned: Vec<&StateRecord> = snapshot
        .records()
        .iter()
        .filter(|r| !graph.contains(&r.id))
        .collect();
    for record in delete_order(&orphaned) {
        plan.add(Effect::Delete(record.clone()));
    }

    Ok(plan)
}

/// Plan the removal of every recorded resource
pub fn plan_destroy(snapshot: &StateSnapshot) -> Plan {
    let records: Vec<&StateRecord> = snapshot.records().iter().collect();
    let mut plan = Plan::new();
    for record in delete_order(&records) {
        plan.add(Effect::Delete(record.clone()));
    }
    plan
}

/// Reverse dependency order: dependents first, ties broken by reverse realization order
fn delete_order<'a>(records: &[&'a StateRecord]) -> Vec<&'a StateRecord> {
    let positions: HashMap<&ResourceId, usize> =
        records.iter().enumerate().map(|(i, r)| (&r.id, i)).collect();

    let mut dependencies = vec![Vec::new(); records.len()];
    let mut dependents = vec![Vec::new(); records.len()];
    for (i, record) in records.iter().enumerate() {
        let mut targets: Vec<usize> = record
            .dependencies
            .iter()
            .filter_map(|d| positions.get(d).copied())
            .filter(|&j| j != i)
            .collect();
        targets.sort_unstable();
        targets.dedup();
        for &j in &targets {
            dependents[j].push(i);
        }
        dependencies[i] = targets;
    }

    let mut order = topological_sort(&dependencies, &dependents);
    if order.len() != records.len() {
        // Recorded dependencies should never form a cycle; keep the leftovers in record order
        log::warn!("state records contain a dependency cycle; ordering leftovers by record position");
        let placed: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..records.len()).filter(|i| !placed.contains(i)));
    }

    // Topological order puts dependencies first; deletion wants the reverse.
    // Among independent records, later realizations go first.
    order.reverse();
    order.into_iter().map(|i| records[i]).collect()
}

fn record_attributes(record: &StateRecord) -> HashMap<String, Value> {
    let mut attrs = record.attributes.clone();
    attrs
        .entry("id".to_string())
        .or_insert_with(|| Value::String(record.identifier.clone()));
    attrs
}

/// Resolve references against what earlier nodes are expected to look like after apply
fn resolve_for_plan(
    node: &ResourceNode,
    expected: &HashMap<ResourceId, HashMap<String, Value>>,
) -> HashMap<String, Value> {
    let lookup = |r: &AttributeRef| -> Option<Value> {
        expected
            .get(&r.target)
            .and_then(|attrs| attrs.get(&r.attribute))
            .cloned()
    };
    node.attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.resolve_with(&lookup)))
        .collect()
}
