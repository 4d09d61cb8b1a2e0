//! Expression - Attribute expressions as written in resource definitions
//!
//! Expressions are reduced to `Value`s per resource instance by the graph
//! builder. Supported forms inside a JSON string:
//!
//! - `${kind.name.attr}`
//! - `${kind.name[2].attr}`, `${kind.name[count.index].attr}`, `${kind.name[*].attr}`
//! - `${count.index}`
//! - any mix of literal text and the above (`"${vpc.main.id}-igw"`)
//!
//! A JSON object `{"$select": [...]}` picks the element at the instance index.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::resource::Value;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_-]*)(?:\[([^\]]+)\])?\.([A-Za-z_][A-Za-z0-9_]*)$",
    )
    .expect("reference pattern is valid")
});

/// Reserved key for index-based selection
pub const SELECT_KEY: &str = "$select";

/// How a reference picks instances of a repeated resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExpr {
    /// `kind.name.attr`
    None,
    /// `kind.name[2].attr`
    Fixed(usize),
    /// `kind.name[count.index].attr`
    CountIndex,
    /// `kind.name[*].attr`
    Splat,
}

/// Reference to an attribute of a declared resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceExpr {
    pub kind: String,
    pub name: String,
    pub index: IndexExpr,
    pub attribute: String,
}

impl std::fmt::Display for ReferenceExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = match self.index {
            IndexExpr::None => String::new(),
            IndexExpr::Fixed(i) => format!("[{}]", i),
            IndexExpr::CountIndex => "[count.index]".to_string(),
            IndexExpr::Splat => "[*]".to_string(),
        };
        write!(f, "{}.{}{}.{}", self.kind, self.name, index, self.attribute)
    }
}

/// Attribute expression of a resource definition
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Scalar literal
    Literal(Value),
    List(Vec<Expression>),
    Map(HashMap<String, Expression>),
    Reference(ReferenceExpr),
    /// The replica index of the instance being built
    CountIndex,
    /// Element of a fixed list chosen by the replica index
    Select(Vec<Expression>),
    /// Literal text mixed with expressions
    Template(Vec<Expression>),
}

impl Expression {
    /// Build an expression from a JSON value
    pub fn from_json(json: &serde_json::Value) -> Result<Self, String> {
        match json {
            serde_json::Value::String(s) => parse_string(s),
            serde_json::Value::Array(items) => Ok(Expression::List(
                items.iter().map(Expression::from_json).collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(map) => {
                if let Some(select) = map.get(SELECT_KEY) {
                    if map.len() != 1 {
                        return Err(format!("{} must be the only key of its object", SELECT_KEY));
                    }
                    let serde_json::Value::Array(items) = select else {
                        return Err(format!("{} expects a list", SELECT_KEY));
                    };
                    return Ok(Expression::Select(
                        items.iter().map(Expression::from_json).collect::<Result<_, _>>()?,
                    ));
                }
                let mut entries = HashMap::new();
                for (k, v) in map {
                    entries.insert(k.clone(), Expression::from_json(v)?);
                }
                Ok(Expression::Map(entries))
            }
            other => Ok(Expression::Literal(Value::from_json(other))),
        }
    }
}

/// Parse a string literal, splitting out `${...}` segments
fn parse_string(s: &str) -> Result<Expression, String> {
    let mut parts = Vec::new();
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        if open > 0 {
            parts.push(Expression::Literal(Value::String(rest[..open].to_string())));
        }
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| format!("unclosed '${{' in \"{}\"", s))?;
        let inner = rest[open + 2..open + close].trim();
        parts.push(parse_reference(inner)?);
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(Expression::Literal(Value::String(rest.to_string())));
    }

    match parts.len() {
        0 => Ok(Expression::Literal(Value::String(String::new()))),
        1 => Ok(parts.remove(0)),
        _ => Ok(Expression::Template(parts)),
    }
}

fn parse_reference(inner: &str) -> Result<Expression, String> {
    if inner == "count.index" {
        return Ok(Expression::CountIndex);
    }

    let caps = REFERENCE
        .captures(inner)
        .ok_or_else(|| format!("invalid reference '{}'", inner))?;

    let index = match caps.get(3).map(|m| m.as_str().trim()) {
        None => IndexExpr::None,
        Some("*") => IndexExpr::Splat,
        Some("count.index") => IndexExpr::CountIndex,
        Some(n) => IndexExpr::Fixed(
            n.parse()
                .map_err(|_| format!("invalid index '{}' in '{}'", n, inner))?,
        ),
    };

    Ok(Expression::Reference(ReferenceExpr {
        kind: caps[1].to_string(),
        name: caps[2].to_string(),
        index,
        attribute: caps[4].to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(kind: &str, name: &str, index: IndexExpr, attribute: &str) -> Expression {
        Expression::Reference(ReferenceExpr {
            kind: kind.to_string(),
            name: name.to_string(),
            index,
            attribute: attribute.to_string(),
        })
    }

    #[test]
    fn plain_string_is_literal() {
        let expr = Expression::from_json(&json!("10.0.0.0/16")).unwrap();
        assert_eq!(expr, Expression::Literal(Value::String("10.0.0.0/16".to_string())));
    }

    #[test]
    fn whole_string_reference() {
        let expr = Expression::from_json(&json!("${vpc.main.id}")).unwrap();
        assert_eq!(expr, reference("vpc", "main", IndexExpr::None, "id"));
    }

    #[test]
    fn indexed_references() {
        let fixed = Expression::from_json(&json!("${subnet.public[1].id}")).unwrap();
        assert_eq!(fixed, reference("subnet", "public", IndexExpr::Fixed(1), "id"));

        let by_count = Expression::from_json(&json!("${subnet.public[count.index].id}")).unwrap();
        assert_eq!(by_count, reference("subnet", "public", IndexExpr::CountIndex, "id"));

        let splat = Expression::from_json(&json!("${subnet.public[*].id}")).unwrap();
        assert_eq!(splat, reference("subnet", "public", IndexExpr::Splat, "id"));
    }

    #[test]
    fn template_mixes_text_and_references() {
        let expr = Expression::from_json(&json!("${eks_cluster.main.name}-nodes-${count.index}"))
            .unwrap();
        match expr {
            Expression::Template(parts) => {
                assert_eq!(parts.len(), 4);
                assert_eq!(parts[1], Expression::Literal(Value::String("-nodes-".to_string())));
                assert_eq!(parts[3], Expression::CountIndex);
            }
            other => panic!("Expected Template, got {:?}", other),
        }
    }

    #[test]
    fn select_object() {
        let expr = Expression::from_json(&json!({"$select": ["us-east-1a", "us-east-1b"]})).unwrap();
        match expr {
            Expression::Select(items) => assert_eq!(items.len(), 2),
            other => panic!("Expected Select, got {:?}", other),
        }

        assert!(Expression::from_json(&json!({"$select": "a"})).is_err());
        assert!(Expression::from_json(&json!({"$select": [], "x": 1})).is_err());
    }

    #[test]
    fn invalid_references_are_rejected() {
        assert!(Expression::from_json(&json!("${vpc}")).is_err());
        assert!(Expression::from_json(&json!("${vpc.main.id")).is_err());
        assert!(Expression::from_json(&json!("${subnet.public[x].id}")).is_err());
    }

    #[test]
    fn nested_objects_and_lists_keep_their_shape() {
        let expr = Expression::from_json(&json!({
            "subnets": "${subnet.private[*].id}",
            "role": ["${iam_role.cluster.arn}"]
        }))
        .unwrap();
        match expr {
            Expression::Map(map) => {
                assert_eq!(map["subnets"], reference("subnet", "private", IndexExpr::Splat, "id"));
                assert_eq!(
                    map["role"],
                    Expression::List(vec![reference("iam_role", "cluster", IndexExpr::None, "arn")])
                );
            }
            other => panic!("Expected Map, got {:?}", other),
        }
    }
}
