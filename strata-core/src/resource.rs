//! Resource - Representing resources, their addresses and their state

use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a resource instance
///
/// Repeated definitions (`count`) expand into one instance per index, so the
/// identity of a node is kind + name + optional index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Resource kind (e.g., "vpc", "subnet")
    pub kind: String,
    /// Logical name given in the configuration
    pub name: String,
    /// Replica index for repeated definitions
    pub index: Option<usize>,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(kind: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            index: Some(index),
        }
    }

    /// Parse an address of the form `kind.name` or `kind.name[3]`
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, rest) = s.split_once('.')?;
        if kind.is_empty() || rest.is_empty() {
            return None;
        }
        match rest.strip_suffix(']').and_then(|r| r.split_once('[')) {
            Some((name, index)) => {
                let index = index.parse().ok()?;
                Some(Self::indexed(kind, name, index))
            }
            None => Some(Self::new(kind, rest)),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}.{}[{}]", self.kind, self.name, i),
            None => write!(f, "{}.{}", self.kind, self.name),
        }
    }
}

/// Reference to one attribute of a concrete resource instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    pub target: ResourceId,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Reference to another resource's attribute, resolved once that resource is realized
    ResourceRef(AttributeRef),
    /// String built from literal text and references (`"${vpc.main.id}-igw"`)
    Interpolation(Vec<Value>),
    /// Value that will only be known after apply
    Unknown,
}

impl Value {
    /// Collect every resource reference contained in this value
    pub fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a AttributeRef>) {
        match self {
            Value::ResourceRef(r) => refs.push(r),
            Value::List(items) | Value::Interpolation(items) => {
                for item in items {
                    item.collect_refs(refs);
                }
            }
            Value::Map(map) => {
                for v in map.values() {
                    v.collect_refs(refs);
                }
            }
            _ => {}
        }
    }

    /// Returns true if the value contains no references and nothing unknown
    pub fn is_known(&self) -> bool {
        match self {
            Value::ResourceRef(_) | Value::Unknown => false,
            Value::List(items) | Value::Interpolation(items) => items.iter().all(Value::is_known),
            Value::Map(map) => map.values().all(Value::is_known),
            _ => true,
        }
    }

    /// Replace references using `lookup`; references it cannot answer become `Unknown`
    pub fn resolve_with<F>(&self, lookup: &F) -> Value
    where
        F: Fn(&AttributeRef) -> Option<Value>,
    {
        match self {
            Value::ResourceRef(r) => lookup(r).unwrap_or(Value::Unknown),
            Value::List(items) => Value::List(items.iter().map(|v| v.resolve_with(lookup)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolve_with(lookup)))
                    .collect(),
            ),
            Value::Interpolation(parts) => {
                let resolved: Vec<Value> = parts.iter().map(|v| v.resolve_with(lookup)).collect();
                if !resolved.iter().all(Value::is_known) {
                    return Value::Unknown;
                }
                Value::String(resolved.iter().map(Value::to_plain_string).collect())
            }
            other => other.clone(),
        }
    }

    /// Render the value as it appears inside an interpolated string
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            // References are resolved before anything is persisted, but keep them readable
            Value::ResourceRef(r) => serde_json::Value::String(format!("${{{}}}", r)),
            Value::Interpolation(_) | Value::Unknown => serde_json::Value::String(self.to_string()),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::String(n.to_string()),
            },
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
            serde_json::Value::Null => Value::String("null".to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) => {
                let strs: Vec<_> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", strs.join(", "))
            }
            Value::Map(map) => {
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                let strs: Vec<_> = keys
                    .into_iter()
                    .map(|k| format!("{}: {}", k, map[k]))
                    .collect();
                write!(f, "{{{}}}", strs.join(", "))
            }
            Value::ResourceRef(r) => write!(f, "{}", r),
            Value::Interpolation(parts) => {
                write!(f, "\"")?;
                for part in parts {
                    match part {
                        Value::String(s) => write!(f, "{}", s)?,
                        other => write!(f, "${{{}}}", other)?,
                    }
                }
                write!(f, "\"")
            }
            Value::Unknown => write!(f, "(known after apply)"),
        }
    }
}

/// Desired state of one resource instance, as declared in the configuration
///
/// Attributes may still hold references; they are resolved right before the
/// provider is called.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub attributes: HashMap<String, Value>,
    /// Resources this one references (its outgoing edges)
    pub dependencies: Vec<ResourceId>,
}

impl Resource {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: HashMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.dependencies.push(id);
        self
    }
}

/// Current state fetched from actual infrastructure
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: ResourceId,
    /// Provider-assigned identifier (e.g., vpc-0a1b2c3d)
    pub identifier: Option<String>,
    pub attributes: HashMap<String, Value>,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: HashMap::new(),
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: HashMap<String, Value>) -> Self {
        Self {
            id,
            identifier: None,
            attributes,
            exists: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}
