//! Resource addresses.
//!
//! An address is `module.<m>....<type>.<name>` with an optional instance
//! key: `[0]` for `count` instances and `["key"]` for `for_each`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Instance key of a resource expanded with `count` or `for_each`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    /// Position produced by `count`.
    Index(u64),
    /// Key produced by `for_each`.
    Key(String),
}

/// Unique identifier of a resource within a configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Names of the enclosing modules, outermost first.
    pub module_path: Vec<String>,
    /// Resource type, e.g. `local_file`.
    pub resource_type: String,
    /// Resource name within its module.
    pub name: String,
    /// Instance key for expanded resources.
    pub index: Option<InstanceKey>,
}

/// One `name` or `name[key]` step of a dotted traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub name: String,
    pub index: Option<InstanceKey>,
}

impl ResourceAddress {
    /// Creates a root-module address without instance key.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module_path: Vec::new(),
            resource_type: resource_type.into(),
            name: name.into(),
            index: None,
        }
    }

    /// Places the address inside the given module path.
    #[must_use]
    pub fn in_module(mut self, module_path: &[String]) -> Self {
        self.module_path = module_path.to_vec();
        self
    }

    /// Sets the instance key.
    #[must_use]
    pub fn with_index(mut self, index: InstanceKey) -> Self {
        self.index = Some(index);
        self
    }

    /// Returns the address without its instance key.
    #[must_use]
    pub fn base(&self) -> Self {
        Self {
            index: None,
            ..self.clone()
        }
    }

    /// Parses an address relative to a module path.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid address.
    pub fn parse_relative(text: &str, module_path: &[String]) -> Result<Self, ConfigError> {
        let segments = parse_segments(text)?;
        let (relative, rest) = split_address(text, &segments)?;
        if !rest.is_empty() {
            return Err(invalid(text, "unexpected trailing segments"));
        }
        let mut full = module_path.to_vec();
        full.extend(relative.module_path);
        Ok(Self {
            module_path: full,
            ..relative
        })
    }
}

/// Splits a traversal into a resource address and the remaining segments.
pub(crate) fn split_address<'a>(
    text: &str,
    segments: &'a [Segment],
) -> Result<(ResourceAddress, &'a [Segment]), ConfigError> {
    let mut module_path = Vec::new();
    let mut i = 0;
    while segments.get(i).is_some_and(|s| s.name == "module") {
        let module = segments
            .get(i + 1)
            .ok_or_else(|| invalid(text, "module keyword without a module name"))?;
        if segments[i].index.is_some() || module.index.is_some() {
            return Err(invalid(text, "module instances are not supported"));
        }
        module_path.push(module.name.clone());
        i += 2;
    }

    let resource_type = segments
        .get(i)
        .ok_or_else(|| invalid(text, "missing resource type"))?;
    let name = segments
        .get(i + 1)
        .ok_or_else(|| invalid(text, "missing resource name"))?;
    if resource_type.index.is_some() {
        return Err(invalid(text, "resource type cannot carry an index"));
    }

    let address = ResourceAddress {
        module_path,
        resource_type: resource_type.name.clone(),
        name: name.name.clone(),
        index: name.index.clone(),
    };
    Ok((address, &segments[i + 2..]))
}

/// Parses `a.b[0].c["k"]` into segments.
pub(crate) fn parse_segments(text: &str) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '.' || c == '[' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if !is_identifier(&name) {
            return Err(invalid(text, format!("'{name}' is not a valid identifier")));
        }

        let mut index = None;
        if chars.peek() == Some(&'[') {
            chars.next();
            index = Some(parse_index(text, &mut chars)?);
        }
        segments.push(Segment { name, index });

        match chars.next() {
            None => break,
            Some('.') => {}
            Some(c) => return Err(invalid(text, format!("unexpected character '{c}'"))),
        }
    }

    Ok(segments)
}

/// Parses the body of an index after its opening bracket, consuming the
/// closing bracket. Quoted keys accept `\"` and `\\` escapes.
fn parse_index(
    text: &str,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<InstanceKey, ConfigError> {
    if chars.peek() == Some(&'"') {
        chars.next();
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some('\\') => match chars.next() {
                    Some(c @ ('"' | '\\')) => key.push(c),
                    _ => return Err(invalid(text, "invalid escape in index key")),
                },
                Some(c) => key.push(c),
                None => return Err(invalid(text, "unterminated index")),
            }
        }
        if chars.next() != Some(']') {
            return Err(invalid(text, "expected ']' after quoted key"));
        }
        return Ok(InstanceKey::Key(key));
    }

    let mut raw = String::new();
    loop {
        match chars.next() {
            Some(']') => break,
            Some(c) => raw.push(c),
            None => return Err(invalid(text, "unterminated index")),
        }
    }
    raw.parse::<u64>()
        .map(InstanceKey::Index)
        .map_err(|_| invalid(text, format!("index '{raw}' must be a number or a quoted key")))
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_-]*`.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn invalid(text: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidAddress {
        address: text.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for ResourceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_relative(s, &[])
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => {
                f.write_str("[\"")?;
                for c in k.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"]")
            }
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.module_path {
            write!(f, "module.{module}.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(index) = &self.index {
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let addr: ResourceAddress = "local_file.motd".parse().unwrap();
        assert_eq!(addr.resource_type, "local_file");
        assert_eq!(addr.name, "motd");
        assert!(addr.module_path.is_empty());
        assert!(addr.index.is_none());
    }

    #[test]
    fn test_parse_module_and_index() {
        let addr: ResourceAddress = "module.net.module.edge.null_resource.gw[3]".parse().unwrap();
        assert_eq!(addr.module_path, vec!["net", "edge"]);
        assert_eq!(addr.index, Some(InstanceKey::Index(3)));
        assert_eq!(addr.to_string(), "module.net.module.edge.null_resource.gw[3]");
    }

    #[test]
    fn test_parse_string_key_with_dot() {
        let addr: ResourceAddress = r#"local_file.cfg["a.b"]"#.parse().unwrap();
        assert_eq!(addr.index, Some(InstanceKey::Key("a.b".into())));
        assert_eq!(addr.to_string(), r#"local_file.cfg["a.b"]"#);
    }

    #[test]
    fn test_string_key_with_quotes_round_trips() {
        for key in [r#"a"]b"#, r"back\slash", r#"\""#, "[]", ""] {
            let addr = ResourceAddress::new("null_resource", "n").with_index(InstanceKey::Key(key.to_string()));
            let rendered = addr.to_string();
            let back: ResourceAddress = rendered.parse().unwrap();
            assert_eq!(back, addr, "{rendered}");
        }
        assert_eq!(
            ResourceAddress::new("null_resource", "n")
                .with_index(InstanceKey::Key(r#"a"]b"#.to_string()))
                .to_string(),
            r#"null_resource.n["a\"]b"]"#
        );
        assert!(r#"null_resource.n["a\x"]"#.parse::<ResourceAddress>().is_err());
        assert!(r#"null_resource.n["a"x]"#.parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_parse_relative() {
        let module = vec!["net".to_string()];
        let addr = ResourceAddress::parse_relative("null_resource.a", &module).unwrap();
        assert_eq!(addr.to_string(), "module.net.null_resource.a");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("local_file".parse::<ResourceAddress>().is_err());
        assert!("local_file.a.b".parse::<ResourceAddress>().is_err());
        assert!("1abc.x".parse::<ResourceAddress>().is_err());
        assert!("local_file.a[x]".parse::<ResourceAddress>().is_err());
        assert!("local_file.a[0".parse::<ResourceAddress>().is_err());
        assert!("module.local_file".parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_ordering_is_componentwise() {
        let mut addrs: Vec<ResourceAddress> = ["b_t.a", "a_t.z", "module.m.a_t.a", "a_t.a[1]", "a_t.a"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        addrs.sort();
        let rendered: Vec<String> = addrs.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["a_t.a", "a_t.a[1]", "a_t.z", "b_t.a", "module.m.a_t.a"]
        );
    }

    #[test]
    fn test_serde_as_string() {
        let addr: ResourceAddress = "module.m.null_resource.x[\"k\"]".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#""module.m.null_resource.x[\"k\"]""#);
        let back: ResourceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
