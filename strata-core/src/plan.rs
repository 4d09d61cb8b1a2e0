//! Plan - Ordered collection of Effects
//!
//! A Plan lists Effects in dependency order: creates and updates after the
//! resources they reference, deletes before the resources they referenced.
//! No side effects occur until the Plan is applied.

use crate::effect::{Action, Effect};
use crate::resource::ResourceId;

/// Plan containing Effects to be executed
#[derive(Debug, Clone, Default)]
pub struct Plan {
    effects: Vec<Effect>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Position of the effect for a resource
    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.effects.iter().position(|e| e.id() == id)
    }

    /// For each effect, the effects that must complete before it may start
    ///
    /// Creates, updates and replaces wait for the effects of the resources
    /// they reference. Anything that removes an existing instance waits for
    /// the removal of every instance that referenced it. A delete also waits
    /// for updates and replaces of instances whose recorded state referenced it.
    pub fn prerequisites(&self) -> Vec<Vec<usize>> {
        self.effects
            .iter()
            .enumerate()
            .map(|(i, effect)| {
                let mut waits = Vec::new();

                if let Some(desired) = effect.desired() {
                    for (j, other) in self.effects.iter().enumerate() {
                        if j != i
                            && other.desired().is_some()
                            && desired.dependencies.contains(other.id())
                        {
                            waits.push(j);
                        }
                    }
                }

                if effect.removes_existing() {
                    for (j, other) in self.effects.iter().enumerate() {
                        let removes_dependent = match other {
                            Effect::Delete(record) => record.dependencies.contains(effect.id()),
                            // Kept dependents moving off a deleted resource
                            Effect::Update { from, .. } | Effect::Replace { from, .. } => {
                                matches!(effect, Effect::Delete(_))
                                    && from.dependencies.contains(effect.id())
                            }
                            Effect::Create(_) => false,
                        };
                        if j != i && removes_dependent && !waits.contains(&j) {
                            waits.push(j);
                        }
                    }
                }

                waits
            })
            .collect()
    }

    /// Generate a summary of the Plan for display
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for effect in &self.effects {
            match effect.action() {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Replace => summary.replace += 1,
                Action::Delete => summary.delete += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Plan: {} to add, {} to change, {} to replace, {} to destroy.",
            self.create, self.update, self.replace, self.delete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::snapshot::StateRecord;

    #[test]
    fn empty_plan() {
        let plan = Plan::new();
        assert!(plan.is_empty());
        assert!(plan.prerequisites().is_empty());
    }

    #[test]
    fn plan_summary() {
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new(ResourceId::new("vpc", "a"))));
        plan.add(Effect::Create(Resource::new(ResourceId::new("vpc", "b"))));
        plan.add(Effect::Delete(StateRecord::new(ResourceId::new("vpc", "c"), "vpc-3")));

        let summary = plan.summary();
        assert_eq!(summary.create, 2);
        assert_eq!(summary.delete, 1);
        assert_eq!(
            summary.to_string(),
            "Plan: 2 to add, 0 to change, 0 to replace, 1 to destroy."
        );
    }

    #[test]
    fn prerequisites_follow_edges_both_ways() {
        let vpc = ResourceId::new("vpc", "v");
        let subnet = ResourceId::new("subnet", "s");
        let old_vpc = ResourceId::new("vpc", "old");
        let old_subnet = ResourceId::new("subnet", "old");

        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new(vpc.clone())));
        plan.add(Effect::Create(Resource::new(subnet).with_dependency(vpc)));
        plan.add(Effect::Delete(
            StateRecord::new(old_subnet, "subnet-1").with_dependency(old_vpc.clone()),
        ));
        plan.add(Effect::Delete(StateRecord::new(old_vpc, "vpc-1")));

        let prereqs = plan.prerequisites();
        assert_eq!(prereqs[0], Vec::<usize>::new());
        assert_eq!(prereqs[1], vec![0]);
        assert_eq!(prereqs[2], Vec::<usize>::new());
        assert_eq!(prereqs[3], vec![2]);
    }

    #[test]
    fn delete_waits_for_dependents_moving_away() {
        let old_vpc = ResourceId::new("vpc", "old");
        let new_vpc = ResourceId::new("vpc", "new");
        let subnet = ResourceId::new("subnet", "s");

        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new(new_vpc.clone())));
        plan.add(Effect::Update {
            from: StateRecord::new(subnet.clone(), "subnet-1").with_dependency(old_vpc.clone()),
            to: Resource::new(subnet).with_dependency(new_vpc),
            changed_attributes: vec!["vpc_id".to_string()],
        });
        plan.add(Effect::Delete(StateRecord::new(old_vpc, "vpc-1")));

        let prereqs = plan.prerequisites();
        assert_eq!(prereqs[1], vec![0]);
        assert_eq!(prereqs[2], vec![1]);
    }
}
