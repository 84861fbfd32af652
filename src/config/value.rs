//! Typed attribute values.
//!
//! Attribute values form a closed set of variants with structural
//! equality. State files store them in a tagged form so that every
//! variant round-trips exactly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

/// Ordered attribute map of a resource.
pub type Attributes = BTreeMap<String, Value>;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// UTF-8 string, possibly containing `${...}` templates.
    String(String),
    /// Integer or floating point number.
    Number(serde_json::Number),
    /// Boolean.
    Bool(bool),
    /// Ordered list.
    List(Vec<Value>),
    /// Map of user-defined keys.
    Map(BTreeMap<String, Value>),
    /// Structured object returned by a provisioning client.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Converts a YAML value. YAML `null` yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error for non-finite numbers, non-string map keys and
    /// tagged YAML values.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Option<Self>, ConfigError> {
        let converted = match value {
            serde_yaml::Value::Null => return Ok(None),
            serde_yaml::Value::Bool(b) => Self::Bool(b),
            serde_yaml::Value::String(s) => Self::String(s),
            serde_yaml::Value::Number(n) => Self::Number(yaml_number(&n)?),
            serde_yaml::Value::Sequence(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = Self::from_yaml(item)? {
                        list.push(v);
                    }
                }
                Self::List(list)
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = BTreeMap::new();
                for (key, item) in mapping {
                    let key = match key {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(ConfigError::validation_general(format!(
                                "unsupported map key: {other:?}"
                            )));
                        }
                    };
                    if let Some(v) = Self::from_yaml(item)? {
                        map.insert(key, v);
                    }
                }
                Self::Map(map)
            }
            serde_yaml::Value::Tagged(tagged) => {
                return Err(ConfigError::validation_general(format!(
                    "YAML tags are not supported: {}",
                    tagged.tag
                )));
            }
        };
        Ok(Some(converted))
    }

    /// Converts a JSON value. JSON `null` yields `None`.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(b)),
            serde_json::Value::Number(n) => Some(Self::Number(n)),
            serde_json::Value::String(s) => Some(Self::String(s)),
            serde_json::Value::Array(items) => {
                Some(Self::List(items.into_iter().filter_map(Self::from_json).collect()))
            }
            serde_json::Value::Object(map) => Some(Self::Map(
                map.into_iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|v| (k, v)))
                    .collect(),
            )),
        }
    }

    /// Converts to plain JSON for display and plan output.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) | Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Returns the string slice if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the entries if this is a map or an object.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) | Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns true for strings, numbers and booleans.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::String(_) | Self::Number(_) | Self::Bool(_))
    }

    /// Text used when this value is interpolated inside a larger string.
    #[must_use]
    pub fn interpolation_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Walks a path of map keys and list indices.
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Self> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = match current {
                Self::Map(map) | Self::Object(map) => map.get(segment)?,
                Self::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Sets the value at a path of map keys whose parents already exist.
    /// Returns false if a parent is missing or not a map.
    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: Self) -> bool {
        let Some((last, parents)) = path.split_last() else {
            *self = value;
            return true;
        };
        let mut current = self;
        for segment in parents {
            current = match current {
                Self::Map(map) | Self::Object(map) => match map.get_mut(segment.as_ref()) {
                    Some(next) => next,
                    None => return false,
                },
                _ => return false,
            };
        }
        match current {
            Self::Map(map) | Self::Object(map) => {
                map.insert(last.as_ref().to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Removes the value at a path of map keys. Returns true if something was removed.
    pub fn remove_path<S: AsRef<str>>(&mut self, path: &[S]) -> bool {
        let Some((last, parents)) = path.split_last() else {
            return false;
        };
        let mut current = self;
        for segment in parents {
            current = match current {
                Self::Map(map) | Self::Object(map) => match map.get_mut(segment.as_ref()) {
                    Some(next) => next,
                    None => return false,
                },
                _ => return false,
            };
        }
        match current {
            Self::Map(map) | Self::Object(map) => map.remove(last.as_ref()).is_some(),
            _ => false,
        }
    }
}

/// Sets a dotted path inside an attribute map.
pub fn set_path<S: AsRef<str>>(attributes: &mut Attributes, path: &[S], value: Value) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return false;
    };
    if rest.is_empty() {
        attributes.insert(first.as_ref().to_string(), value);
        return true;
    }
    attributes
        .get_mut(first.as_ref())
        .is_some_and(|v| v.set_path(rest, value))
}

/// Looks up a dotted path inside an attribute map.
#[must_use]
pub fn lookup_path<'a, S: AsRef<str>>(attributes: &'a Attributes, path: &[S]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    attributes.get(first.as_ref())?.get_path(rest)
}

/// Removes a dotted path from an attribute map.
pub fn remove_path<S: AsRef<str>>(attributes: &mut Attributes, path: &[S]) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return attributes.remove(first.as_ref()).is_some();
    }
    attributes
        .get_mut(first.as_ref())
        .is_some_and(|v| v.remove_path(rest))
}

fn yaml_number(n: &serde_yaml::Number) -> Result<serde_json::Number, ConfigError> {
    if let Some(i) = n.as_i64() {
        return Ok(serde_json::Number::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Ok(serde_json::Number::from(u));
    }
    n.as_f64()
        .and_then(serde_json::Number::from_f64)
        .ok_or_else(|| ConfigError::validation_general(format!("number {n} is not finite")))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Number(serde_json::Number::from(i))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Self::Number(serde_json::Number::from(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_conversion_drops_nulls() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("{a: 1, b: ~, c: [x, ~, true]}").expect("yaml");
        let value = Value::from_yaml(yaml).expect("convert").expect("not null");

        let map = value.as_map().expect("map");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&Value::from(1_i64)));
        assert_eq!(
            map.get("c"),
            Some(&Value::List(vec![Value::from("x"), Value::from(true)]))
        );
    }

    #[test]
    fn test_map_and_object_are_distinct() {
        let entries: BTreeMap<String, Value> = [("k".to_string(), Value::from("v"))].into();
        assert_ne!(Value::Map(entries.clone()), Value::Object(entries));
    }

    #[test]
    fn test_tagged_serialization_preserves_variant() {
        let entries: BTreeMap<String, Value> = [("k".to_string(), Value::from(2_i64))].into();
        let object = Value::Object(entries);
        let json = serde_json::to_string(&object).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, object);
    }

    #[test]
    fn test_path_lookup_and_removal() {
        let mut attrs = Attributes::new();
        attrs.insert(
            "tags".to_string(),
            Value::Map([("env".to_string(), Value::from("prod"))].into()),
        );
        attrs.insert("ports".to_string(), Value::List(vec![Value::from(80_i64)]));

        assert_eq!(lookup_path(&attrs, &["tags", "env"]), Some(&Value::from("prod")));
        assert_eq!(lookup_path(&attrs, &["ports", "0"]), Some(&Value::from(80_i64)));
        assert!(lookup_path(&attrs, &["tags", "missing"]).is_none());

        assert!(remove_path(&mut attrs, &["tags", "env"]));
        assert!(!remove_path(&mut attrs, &["tags", "env"]));
        assert!(remove_path(&mut attrs, &["ports"]));
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_interpolation_text() {
        assert_eq!(Value::from("plain").interpolation_text(), "plain");
        assert_eq!(Value::from(42_i64).interpolation_text(), "42");
        assert_eq!(Value::List(vec![Value::from(1_i64)]).interpolation_text(), "[1]");
    }
}
