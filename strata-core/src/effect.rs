//! Effect - A single side effect the executor performs against a provider

use crate::resource::{Resource, ResourceId};
use crate::snapshot::StateRecord;

/// Kind of operation, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Replace,
    Delete,
}

impl Action {
    /// Symbol used when printing plans
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Delete => "-",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Create => "Create",
            Action::Update => "Update",
            Action::Replace => "Replace",
            Action::Delete => "Delete",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Create(Resource),
    Update {
        from: StateRecord,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Delete the existing instance, then create it again
    Replace {
        from: StateRecord,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    Delete(StateRecord),
}

impl Effect {
    pub fn id(&self) -> &ResourceId {
        match self {
            Effect::Create(r) => &r.id,
            Effect::Update { to, .. } | Effect::Replace { to, .. } => &to.id,
            Effect::Delete(record) => &record.id,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Effect::Create(_) => Action::Create,
            Effect::Update { .. } => Action::Update,
            Effect::Replace { .. } => Action::Replace,
            Effect::Delete(_) => Action::Delete,
        }
    }

    /// Desired state, for everything but deletes
    pub fn desired(&self) -> Option<&Resource> {
        match self {
            Effect::Create(r) => Some(r),
            Effect::Update { to, .. } | Effect::Replace { to, .. } => Some(to),
            Effect::Delete(_) => None,
        }
    }

    /// Existing record this effect modifies or removes
    pub fn prior(&self) -> Option<&StateRecord> {
        match self {
            Effect::Create(_) => None,
            Effect::Update { from, .. } | Effect::Replace { from, .. } => Some(from),
            Effect::Delete(record) => Some(record),
        }
    }

    /// Removes an existing instance at some point (delete or replace)
    pub fn removes_existing(&self) -> bool {
        matches!(self, Effect::Delete(_) | Effect::Replace { .. })
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action(), self.id())
    }
}
