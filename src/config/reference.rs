//! `${...}` templates inside attribute values.
//!
//! Load-time expressions (`var.*`, `count.index`, `each.key`,
//! `each.value`) are substituted by the configuration parser. Resource
//! references survive loading and are resolved during planning (against
//! planned values) and again during execution (against live state).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;

use super::address::{parse_segments, split_address, ResourceAddress};
use super::value::{lookup_path, Attributes, Value};

/// A reference from an attribute to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceAddress,
    /// Attribute path inside the referenced resource, at least one segment.
    pub attribute: Vec<String>,
}

/// Outcome of resolving a value: known now, or only after apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Fully resolved value.
    Known(Value),
    /// Depends on an attribute that is only known after apply.
    Unknown,
}

/// Expression inside `${...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expression {
    Var(String),
    CountIndex,
    EachKey,
    EachValue,
    Resource(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Part {
    Literal(String),
    Expr { source: String, expression: Expression },
}

/// Parsed string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Template {
    pub parts: Vec<Part>,
}

impl Template {
    /// Parses a string that may contain `${...}` expressions.
    pub fn parse(text: &str, module_path: &[String]) -> Result<Self, ConfigError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("$${") {
                literal.push_str("${");
                rest = after;
            } else if let Some(after) = rest.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| ConfigError::expression(text, "unterminated ${"))?;
                let source = after[..end].trim().to_string();
                let expression = parse_expression(&source, module_path)?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Expr { source, expression });
                rest = &after[end + 1..];
            } else {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    literal.push(c);
                }
                rest = chars.as_str();
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Returns the single expression if the template is exactly one `${...}`.
    pub fn as_single_expression(&self) -> Option<&Expression> {
        match self.parts.as_slice() {
            [Part::Expr { expression, .. }] => Some(expression),
            _ => None,
        }
    }

    /// Returns true if the template has no expressions.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }
}

fn parse_expression(source: &str, module_path: &[String]) -> Result<Expression, ConfigError> {
    match source {
        "count.index" => return Ok(Expression::CountIndex),
        "each.key" => return Ok(Expression::EachKey),
        "each.value" => return Ok(Expression::EachValue),
        _ => {}
    }
    if let Some(name) = source.strip_prefix("var.") {
        if !super::address::is_identifier(name) {
            return Err(ConfigError::expression(source, "invalid variable name"));
        }
        return Ok(Expression::Var(name.to_string()));
    }

    let segments = parse_segments(source)
        .map_err(|e| ConfigError::expression(source, e.to_string()))?;
    let (relative, rest) = split_address(source, &segments)
        .map_err(|e| ConfigError::expression(source, e.to_string()))?;
    if rest.is_empty() {
        return Err(ConfigError::expression(
            source,
            "a resource reference must name an attribute",
        ));
    }

    let mut attribute = Vec::new();
    for segment in rest {
        attribute.push(segment.name.clone());
        match &segment.index {
            Some(super::address::InstanceKey::Index(i)) => attribute.push(i.to_string()),
            Some(super::address::InstanceKey::Key(k)) => attribute.push(k.clone()),
            None => {}
        }
    }

    let mut full_path = module_path.to_vec();
    full_path.extend(relative.module_path.iter().cloned());
    Ok(Expression::Resource(Reference {
        target: ResourceAddress {
            module_path: full_path,
            ..relative
        },
        attribute,
    }))
}

/// Collects every resource reference inside a value.
///
/// # Errors
///
/// Returns an error if a template is malformed.
pub fn find_references(value: &Value, module_path: &[String]) -> Result<Vec<Reference>, ConfigError> {
    let mut found = Vec::new();
    collect_references(value, module_path, &mut found)?;
    Ok(found)
}

fn collect_references(
    value: &Value,
    module_path: &[String],
    found: &mut Vec<Reference>,
) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            for part in Template::parse(s, module_path)?.parts {
                match part {
                    Part::Expr {
                        expression: Expression::Resource(reference),
                        ..
                    } => found.push(reference),
                    Part::Expr { source, .. } => {
                        return Err(ConfigError::expression(
                            source,
                            "only resource references may remain after loading",
                        ));
                    }
                    Part::Literal(_) => {}
                }
            }
        }
        Value::List(items) => {
            for item in items {
                collect_references(item, module_path, found)?;
            }
        }
        Value::Map(map) | Value::Object(map) => {
            for item in map.values() {
                collect_references(item, module_path, found)?;
            }
        }
        Value::Number(_) | Value::Bool(_) => {}
    }
    Ok(())
}

/// Resolves every template in `value` through `lookup`.
///
/// A value whose string is exactly one reference takes the referenced
/// value as-is; embedded references are rendered as text. Any unknown
/// part makes the whole value unknown.
///
/// # Errors
///
/// Returns an error if a template is malformed.
pub fn resolve_value<F>(
    value: &Value,
    module_path: &[String],
    lookup: &mut F,
) -> Result<PlannedValue, ConfigError>
where
    F: FnMut(&Reference) -> PlannedValue,
{
    match value {
        Value::String(s) => resolve_string(s, module_path, lookup),
        Value::List(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                match resolve_value(item, module_path, lookup)? {
                    PlannedValue::Known(v) => resolved.push(v),
                    PlannedValue::Unknown => return Ok(PlannedValue::Unknown),
                }
            }
            Ok(PlannedValue::Known(Value::List(resolved)))
        }
        Value::Map(map) | Value::Object(map) => {
            let mut resolved = BTreeMap::new();
            for (key, item) in map {
                match resolve_value(item, module_path, lookup)? {
                    PlannedValue::Known(v) => {
                        resolved.insert(key.clone(), v);
                    }
                    PlannedValue::Unknown => return Ok(PlannedValue::Unknown),
                }
            }
            Ok(PlannedValue::Known(if matches!(value, Value::Object(_)) {
                Value::Object(resolved)
            } else {
                Value::Map(resolved)
            }))
        }
        Value::Number(_) | Value::Bool(_) => Ok(PlannedValue::Known(value.clone())),
    }
}

fn resolve_string<F>(text: &str, module_path: &[String], lookup: &mut F) -> Result<PlannedValue, ConfigError>
where
    F: FnMut(&Reference) -> PlannedValue,
{
    let template = Template::parse(text, module_path)?;
    if let Some(Expression::Resource(reference)) = template.as_single_expression() {
        return Ok(lookup(reference));
    }

    let mut out = String::new();
    for part in &template.parts {
        match part {
            Part::Literal(l) => out.push_str(l),
            Part::Expr {
                expression: Expression::Resource(reference),
                ..
            } => match lookup(reference) {
                PlannedValue::Known(v) => out.push_str(&v.interpolation_text()),
                PlannedValue::Unknown => return Ok(PlannedValue::Unknown),
            },
            Part::Expr { source, .. } => {
                return Err(ConfigError::expression(
                    source.clone(),
                    "only resource references may remain after loading",
                ));
            }
        }
    }
    Ok(PlannedValue::Known(Value::String(out)))
}

/// Resolves all attributes of a resource.
///
/// # Errors
///
/// Returns an error if a template is malformed.
pub fn resolve_attributes<F>(
    attributes: &Attributes,
    module_path: &[String],
    lookup: &mut F,
) -> Result<BTreeMap<String, PlannedValue>, ConfigError>
where
    F: FnMut(&Reference) -> PlannedValue,
{
    let mut resolved = BTreeMap::new();
    for (key, value) in attributes {
        resolved.insert(key.clone(), resolve_value(value, module_path, lookup)?);
    }
    Ok(resolved)
}

/// Looks up a reference inside known attributes.
#[must_use]
pub fn lookup_known(attributes: &Attributes, reference: &Reference) -> PlannedValue {
    lookup_path(attributes, &reference.attribute)
        .cloned()
        .map_or(PlannedValue::Unknown, PlannedValue::Known)
}

/// Escapes a literal so that it survives template parsing unchanged.
#[must_use]
pub fn escape_literal(text: &str) -> String {
    text.replace("${", "$${")
}

impl PlannedValue {
    /// Returns the value if it is known.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    /// Returns true if the value is only known after apply.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute.join("."))
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_find_references_in_nested_values() {
        let value = Value::Map(
            [
                ("a".to_string(), Value::from("${null_resource.x.id}")),
                (
                    "b".to_string(),
                    Value::List(vec![Value::from("prefix-${local_file.y[0].content}-suffix")]),
                ),
            ]
            .into(),
        );
        let refs = find_references(&value, &[]).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].target, addr("null_resource.x"));
        assert_eq!(refs[0].attribute, vec!["id"]);
        assert_eq!(refs[1].target, addr("local_file.y[0]"));
    }

    #[test]
    fn test_references_are_module_relative() {
        let module = vec!["net".to_string()];
        let refs = find_references(&Value::from("${null_resource.gw.id}"), &module).unwrap();
        assert_eq!(refs[0].target, addr("module.net.null_resource.gw"));

        let refs = find_references(&Value::from("${module.edge.null_resource.r.triggers.k}"), &module)
            .unwrap();
        assert_eq!(refs[0].target, addr("module.net.module.edge.null_resource.r"));
        assert_eq!(refs[0].attribute, vec!["triggers", "k"]);
    }

    #[test]
    fn test_escaped_template_is_literal() {
        let template = Template::parse("cost $${HOME}", &[]).unwrap();
        assert!(template.is_literal());
        let resolved = resolve_value(&Value::from("cost $${HOME}"), &[], &mut |_| PlannedValue::Unknown)
            .unwrap();
        assert_eq!(resolved, PlannedValue::Known(Value::from("cost ${HOME}")));
    }

    #[test]
    fn test_reference_without_attribute_rejected() {
        assert!(find_references(&Value::from("${null_resource.x}"), &[]).is_err());
        assert!(find_references(&Value::from("${null_resource.x.id"), &[]).is_err());
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let mut lookup = |_: &Reference| PlannedValue::Known(Value::List(vec![Value::from(1_i64)]));
        let resolved = resolve_value(&Value::from("${null_resource.x.ports}"), &[], &mut lookup).unwrap();
        assert_eq!(resolved, PlannedValue::Known(Value::List(vec![Value::from(1_i64)])));
    }

    #[test]
    fn test_embedded_reference_renders_text() {
        let mut lookup = |_: &Reference| PlannedValue::Known(Value::from(8080_i64));
        let resolved =
            resolve_value(&Value::from("http://host:${null_resource.x.port}/"), &[], &mut lookup).unwrap();
        assert_eq!(resolved, PlannedValue::Known(Value::from("http://host:8080/")));
    }

    #[test]
    fn test_unknown_propagates_through_containers() {
        let value = Value::Map([("k".to_string(), Value::List(vec![Value::from("${a_t.b.id}")]))].into());
        let resolved = resolve_value(&value, &[], &mut |_| PlannedValue::Unknown).unwrap();
        assert!(resolved.is_unknown());
    }
}
