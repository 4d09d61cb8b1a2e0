//! Graph - Build the resource dependency graph
//!
//! Expands resource definitions into concrete instances, reduces their
//! expressions, and records one "depends on" edge per distinct referenced
//! instance. The result is a DAG with a deterministic topological order
//! (Kahn's algorithm, ties broken by declaration order).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::config::ResourceDefinition;
use crate::error::ConfigError;
use crate::expression::{Expression, IndexExpr, ReferenceExpr};
use crate::provider::ProviderRegistry;
use crate::resource::{AttributeRef, Resource, ResourceId, Value};

/// One instantiated resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// Attributes reduced to literals and concrete references
    pub attributes: HashMap<String, Value>,
}

impl ResourceNode {
    /// Desired state of this node, including its dependencies
    pub fn to_resource(&self, dependencies: Vec<ResourceId>) -> Resource {
        Resource {
            id: self.id.clone(),
            attributes: self.attributes.clone(),
            dependencies,
        }
    }
}

/// Directed acyclic graph of resource nodes
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    positions: HashMap<ResourceId, usize>,
    /// Node position -> positions it depends on
    dependencies: Vec<Vec<usize>>,
    /// Node position -> positions depending on it
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.position_of(id).map(|i| &self.nodes[i])
    }

    /// Declaration position of a node
    pub fn position_of(&self, id: &ResourceId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.position_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a node, in declaration order
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.related(id, &self.dependencies)
    }

    /// Nodes that directly depend on this one, in declaration order
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.related(id, &self.dependents)
    }

    fn related<'a>(&'a self, id: &ResourceId, adjacency: &'a [Vec<usize>]) -> Vec<&'a ResourceId> {
        match self.position_of(id) {
            Some(i) => adjacency[i].iter().map(|&j| &self.nodes[j].id).collect(),
            None => Vec::new(),
        }
    }

    /// All edges as (from, to): `from` depends on `to`
    pub fn edges(&self) -> Vec<(&ResourceId, &ResourceId)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(i, deps)| deps.iter().map(move |&j| (&self.nodes[i].id, &self.nodes[j].id)))
            .collect()
    }

    /// Nodes with dependencies first; independent nodes keep declaration order
    pub fn topological_order(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(|&i| &self.nodes[i])
    }
}

/// Builds a `ResourceGraph` from definitions
pub struct GraphBuilder<'a> {
    definitions: &'a [ResourceDefinition],
    registry: Option<&'a ProviderRegistry>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(definitions: &'a [ResourceDefinition]) -> Self {
        Self {
            definitions,
            registry: None,
        }
    }

    /// Use provider schemas to accept references to computed attributes
    pub fn with_registry(mut self, registry: &'a ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(&self) -> Result<ResourceGraph, ConfigError> {
        let mut declared: HashMap<(&str, &str), &ResourceDefinition> = HashMap::new();
        for def in self.definitions {
            if declared
                .insert((def.kind.as_str(), def.name.as_str()), def)
                .is_some()
            {
                return Err(ConfigError::DuplicateResource(def.id()));
            }
        }

        let mut graph = ResourceGraph::default();
        for def in self.definitions {
            let indices: Vec<Option<usize>> = match def.count {
                Some(n) => (0..n).map(Some).collect(),
                None => vec![None],
            };
            for index in indices {
                let id = ResourceId {
                    kind: def.kind.clone(),
                    name: def.name.clone(),
                    index,
                };
                let reducer = Reducer {
                    builder: self,
                    declared: &declared,
                    from: &id,
                };
                let mut attributes = HashMap::new();
                for (key, expr) in &def.attributes {
                    attributes.insert(key.clone(), reducer.reduce(key, expr)?);
                }
                graph.positions.insert(id.clone(), graph.nodes.len());
                graph.nodes.push(ResourceNode { id, attributes });
            }
        }

        graph.dependencies = vec![Vec::new(); graph.nodes.len()];
        graph.dependents = vec![Vec::new(); graph.nodes.len()];
        for (i, node) in graph.nodes.iter().enumerate() {
            let mut refs = Vec::new();
            for value in node.attributes.values() {
                value.collect_refs(&mut refs);
            }
            let mut targets: Vec<usize> = refs
                .iter()
                .filter_map(|r| graph.positions.get(&r.target).copied())
                .collect();
            targets.sort_unstable();
            targets.dedup();
            for &j in &targets {
                graph.dependents[j].push(i);
            }
            graph.dependencies[i] = targets;
        }

        graph.order = topological_sort(&graph.dependencies, &graph.dependents);
        if graph.order.len() != graph.nodes.len() {
            let mut ordered = vec![false; graph.nodes.len()];
            for &i in &graph.order {
                ordered[i] = true;
            }
            let members = graph
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !ordered[*i])
                .map(|(_, n)| n.id.clone())
                .collect();
            return Err(ConfigError::Cycle { members });
        }

        log::debug!(
            "built resource graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.dependencies.iter().map(Vec::len).sum::<usize>()
        );

        Ok(graph)
    }
}

/// Kahn's algorithm; ready nodes are taken lowest position first.
/// Returns fewer positions than nodes when there is a cycle.
pub(crate) fn topological_sort(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }
    order
}

/// Reduces the expressions of one instance
struct Reducer<'b, 'a> {
    builder: &'b GraphBuilder<'a>,
    declared: &'b HashMap<(&'a str, &'a str), &'a ResourceDefinition>,
    from: &'b ResourceId,
}

impl Reducer<'_, '_> {
    fn reduce(&self, attribute: &str, expr: &Expression) -> Result<Value, ConfigError> {
        match expr {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|e| self.reduce(attribute, e))
                    .collect::<Result<_, _>>()?,
            )),
            Expression::Map(map) => {
                let mut out = HashMap::new();
                for (k, e) in map {
                    out.insert(k.clone(), self.reduce(attribute, e)?);
                }
                Ok(Value::Map(out))
            }
            Expression::CountIndex => {
                let index = self.own_index(attribute)?;
                Ok(Value::Int(index as i64))
            }
            Expression::Select(items) => {
                let index = self.own_index(attribute)?;
                let item = items.get(index).ok_or_else(|| ConfigError::IndexOutOfRange {
                    from: self.from.clone(),
                    target: format!("{}.{}", self.from.kind, attribute),
                    index,
                    len: items.len(),
                })?;
                self.reduce(attribute, item)
            }
            Expression::Template(parts) => Ok(Value::Interpolation(
                parts
                    .iter()
                    .map(|e| self.reduce(attribute, e))
                    .collect::<Result<_, _>>()?,
            )),
            Expression::Reference(r) => self.reduce_reference(attribute, r),
        }
    }

    fn own_index(&self, attribute: &str) -> Result<usize, ConfigError> {
        self.from
            .index
            .ok_or_else(|| ConfigError::CountIndexOutsideCount {
                from: self.from.clone(),
                attribute: attribute.to_string(),
            })
    }

    fn reduce_reference(&self, attribute: &str, r: &ReferenceExpr) -> Result<Value, ConfigError> {
        let unresolved = || ConfigError::UnresolvedReference {
            from: self.from.clone(),
            reference: r.to_string(),
        };

        let target = self
            .declared
            .get(&(r.kind.as_str(), r.name.as_str()))
            .ok_or_else(unresolved)?;

        if !self.has_attribute(target, &r.attribute) {
            return Err(unresolved());
        }

        let at = |index: Option<usize>| {
            Value::ResourceRef(AttributeRef::new(
                ResourceId {
                    kind: target.kind.clone(),
                    name: target.name.clone(),
                    index,
                },
                r.attribute.clone(),
            ))
        };
        let checked = |index: usize, len: usize| {
            if index < len {
                Ok(at(Some(index)))
            } else {
                Err(ConfigError::IndexOutOfRange {
                    from: self.from.clone(),
                    target: format!("{}.{}", target.kind, target.name),
                    index,
                    len,
                })
            }
        };

        match (target.count, &r.index) {
            (None, IndexExpr::None) => Ok(at(None)),
            (None, _) => Err(unresolved()),
            (Some(_), IndexExpr::None) => Err(ConfigError::MissingIndex {
                from: self.from.clone(),
                reference: r.to_string(),
            }),
            (Some(len), IndexExpr::Fixed(i)) => checked(*i, len),
            (Some(len), IndexExpr::CountIndex) => checked(self.own_index(attribute)?, len),
            (Some(len), IndexExpr::Splat) => Ok(Value::List((0..len).map(|i| at(Some(i))).collect())),
        }
    }

    /// Declared attributes, the provider-assigned `id`, and schema-computed attributes
    fn has_attribute(&self, target: &ResourceDefinition, attribute: &str) -> bool {
        attribute == "id"
            || target.attributes.contains_key(attribute)
            || self
                .builder
                .registry
                .and_then(|r| r.schema(&target.kind))
                .is_some_and(|s| s.is_computed(attribute))
    }
}
