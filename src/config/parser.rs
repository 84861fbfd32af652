//! Configuration parser for loading and resolving configuration files.
//!
//! Loading happens in two steps. [`ConfigParser::load_file`] reads the
//! YAML into a [`ConfigFile`]; [`ConfigParser::resolve`] substitutes
//! variables, expands `count`/`for_each` and modules, and produces the
//! flat [`Configuration`] the planner works on.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ForgeError, Result};

use super::address::{InstanceKey, ResourceAddress};
use super::reference::{escape_literal, Expression, Part, Template};
use super::spec::{ConfigFile, Configuration, ModuleConfig, Move, ResourceConfig, ResourceSpec};
use super::validator::ConfigValidator;
use super::value::{Attributes, Value};

/// Prefix of environment variables that set input variables.
pub const VAR_ENV_PREFIX: &str = "FORGEPLAN_VAR_";

/// Configuration parser for loading project configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
    /// Variables set on the command line.
    overrides: BTreeMap<String, String>,
}

/// Values visible to load-time expressions of one resource instance.
struct EvalContext<'a> {
    variables: &'a BTreeMap<String, Value>,
    count_index: Option<u64>,
    each: Option<(&'a str, &'a Value)>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Sets a variable, taking precedence over environment and defaults.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    /// Loads, validates and resolves a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is invalid, or cannot
    /// be resolved.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Configuration> {
        let mut file = self.load_file(path)?;
        Self::apply_env_overrides(&mut file)?;
        ConfigValidator::new().validate(&file)?;
        self.resolve(&file)
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ConfigFile> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ForgeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ConfigFile> {
        debug!("Parsing YAML configuration");

        let config: ConfigFile = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ForgeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Applies `FORGEPLAN_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an unusable value.
    pub fn apply_env_overrides(config: &mut ConfigFile) -> Result<()> {
        if let Ok(name) = std::env::var("FORGEPLAN_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(path) = std::env::var("FORGEPLAN_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(parallelism) = std::env::var("FORGEPLAN_PARALLELISM") {
            debug!("Overriding settings.parallelism from environment");
            config.settings.parallelism = parallelism.parse().map_err(|_| {
                ConfigError::validation(
                    format!("FORGEPLAN_PARALLELISM must be a positive integer, got '{parallelism}'"),
                    "settings.parallelism",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ForgeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Resolves variables, instances and modules into a flat configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for undefined variables, malformed expressions,
    /// invalid addresses or duplicate instances.
    pub fn resolve(&self, file: &ConfigFile) -> Result<Configuration> {
        let variables = self.resolve_variables(file)?;

        let mut specs = Vec::new();
        self.expand_module(&[], &file.resources, &file.modules, &variables, &mut specs)?;

        let mut seen = BTreeSet::new();
        for spec in &specs {
            if !seen.insert(spec.address.clone()) {
                return Err(ConfigError::DuplicateAddress {
                    address: spec.address.to_string(),
                }
                .into());
            }
        }
        let specs = expand_instance_dependencies(specs, &seen);

        let mut moves = Vec::with_capacity(file.moved.len());
        for moved in &file.moved {
            moves.push(Move {
                from: moved.from.parse()?,
                to: moved.to.parse()?,
            });
        }

        info!(
            "Resolved {} resource instance(s) and {} move(s)",
            specs.len(),
            moves.len()
        );
        Ok(Configuration {
            project: file.project.clone(),
            settings: file.settings,
            state: file.state.clone(),
            resources: specs,
            moves,
        })
    }

    /// CLI override, then `FORGEPLAN_VAR_<name>`, then the declared default.
    fn resolve_variables(&self, file: &ConfigFile) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for (name, declaration) in &file.variables {
            if let Some(value) = self.overrides.get(name) {
                debug!("Variable {name} set on the command line");
                values.insert(name.clone(), Value::from(value.as_str()));
            } else if let Ok(value) = std::env::var(format!("{VAR_ENV_PREFIX}{name}")) {
                debug!("Variable {name} set from environment");
                values.insert(name.clone(), Value::from(value));
            } else if let Some(default) = &declaration.default
                && let Some(value) = Value::from_yaml(default.clone())?
            {
                values.insert(name.clone(), value);
            }
        }
        for name in self.overrides.keys() {
            if !file.variables.contains_key(name) {
                warn!("Ignoring value for undeclared variable '{name}'");
            }
        }
        Ok(values)
    }

    fn expand_module(
        &self,
        module_path: &[String],
        resources: &[ResourceConfig],
        modules: &BTreeMap<String, ModuleConfig>,
        variables: &BTreeMap<String, Value>,
        out: &mut Vec<ResourceSpec>,
    ) -> Result<()> {
        for resource in resources {
            expand_resource(module_path, resource, variables, out)?;
        }
        for (name, module) in modules {
            let mut child = module_path.to_vec();
            child.push(name.clone());
            self.expand_module(&child, &module.resources, &module.modules, variables, out)?;
        }
        Ok(())
    }
}

fn expand_resource(
    module_path: &[String],
    resource: &ResourceConfig,
    variables: &BTreeMap<String, Value>,
    out: &mut Vec<ResourceSpec>,
) -> Result<()> {
    let base = ResourceAddress::new(&resource.resource_type, &resource.name).in_module(module_path);
    let plain = EvalContext {
        variables,
        count_index: None,
        each: None,
    };

    if let Some(count) = resource.count {
        for i in 0..count {
            let ctx = EvalContext {
                count_index: Some(i),
                ..plain
            };
            out.push(build_spec(
                base.clone().with_index(InstanceKey::Index(i)),
                resource,
                &ctx,
            )?);
        }
    } else if let Some(for_each) = &resource.for_each {
        let instances = for_each_instances(&base, for_each, &plain)?;
        for (key, value) in &instances {
            let ctx = EvalContext {
                each: Some((key.as_str(), value)),
                ..plain
            };
            out.push(build_spec(
                base.clone().with_index(InstanceKey::Key(key.clone())),
                resource,
                &ctx,
            )?);
        }
    } else {
        out.push(build_spec(base, resource, &plain)?);
    }
    Ok(())
}

fn for_each_instances(
    base: &ResourceAddress,
    for_each: &serde_yaml::Value,
    ctx: &EvalContext<'_>,
) -> Result<BTreeMap<String, Value>> {
    let Some(value) = Value::from_yaml(for_each.clone())? else {
        return Ok(BTreeMap::new());
    };
    let value = substitute(value, ctx)?;

    let field = format!("{base}.for_each");
    match value {
        Value::List(items) => {
            let mut instances = BTreeMap::new();
            for item in items {
                let Value::String(key) = item else {
                    return Err(ConfigError::validation("for_each list items must be strings", field).into());
                };
                instances.insert(key.clone(), Value::String(key));
            }
            Ok(instances)
        }
        Value::Map(map) | Value::Object(map) => Ok(map),
        _ => Err(ConfigError::validation("for_each must be a list or a map", field).into()),
    }
}

fn build_spec(
    address: ResourceAddress,
    resource: &ResourceConfig,
    ctx: &EvalContext<'_>,
) -> Result<ResourceSpec> {
    let mut attributes = Attributes::new();
    for (key, raw) in &resource.attributes {
        if let Some(value) = Value::from_yaml(raw.clone())? {
            attributes.insert(key.clone(), substitute(value, ctx)?);
        }
    }

    let module_path = address.module_path.clone();
    let mut spec = ResourceSpec::new(address, attributes)?.with_lifecycle(resource.lifecycle.clone());
    for dependency in &resource.depends_on {
        spec = spec.with_dependency(ResourceAddress::parse_relative(dependency, &module_path)?);
    }
    spec.timeout_secs = resource.timeout_secs;
    debug!("Built spec for {}", spec.address);
    Ok(spec)
}

/// `depends_on` naming a counted resource without index depends on every instance.
fn expand_instance_dependencies(
    specs: Vec<ResourceSpec>,
    known: &BTreeSet<ResourceAddress>,
) -> Vec<ResourceSpec> {
    let mut specs = specs;
    for spec in &mut specs {
        let mut expanded = BTreeSet::new();
        for dependency in &spec.depends_on {
            if known.contains(dependency) || dependency.index.is_some() {
                expanded.insert(dependency.clone());
                continue;
            }
            let instances: Vec<_> = known
                .iter()
                .filter(|a| a.index.is_some() && a.base() == *dependency)
                .cloned()
                .collect();
            if instances.is_empty() {
                expanded.insert(dependency.clone());
            } else {
                expanded.extend(instances);
            }
        }
        spec.depends_on = expanded;
    }
    specs.sort_by(|a, b| a.address.cmp(&b.address));
    specs
}

/// Replaces load-time expressions, leaving resource references in place.
fn substitute(value: Value, ctx: &EvalContext<'_>) -> Result<Value> {
    Ok(match value {
        Value::String(s) => substitute_string(&s, ctx)?,
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| substitute(item, ctx))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => Value::Map(substitute_map(map, ctx)?),
        Value::Object(map) => Value::Object(substitute_map(map, ctx)?),
        other => other,
    })
}

fn substitute_map(map: BTreeMap<String, Value>, ctx: &EvalContext<'_>) -> Result<BTreeMap<String, Value>> {
    map.into_iter()
        .map(|(k, v)| Ok((k, substitute(v, ctx)?)))
        .collect()
}

fn substitute_string(text: &str, ctx: &EvalContext<'_>) -> Result<Value> {
    let template = Template::parse(text, &[])?;
    if template.is_literal() {
        return Ok(Value::from(text));
    }
    if let Some(expression) = template.as_single_expression()
        && !matches!(expression, Expression::Resource(_))
    {
        return evaluate(expression, ctx);
    }

    let mut out = String::new();
    for part in &template.parts {
        match part {
            Part::Literal(literal) => out.push_str(&escape_literal(literal)),
            Part::Expr {
                expression: Expression::Resource(_),
                source,
            } => {
                out.push_str("${");
                out.push_str(source);
                out.push('}');
            }
            Part::Expr { expression, .. } => {
                out.push_str(&escape_literal(&evaluate(expression, ctx)?.interpolation_text()));
            }
        }
    }
    Ok(Value::String(out))
}

fn evaluate(expression: &Expression, ctx: &EvalContext<'_>) -> Result<Value> {
    match expression {
        Expression::Var(name) => ctx
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UndefinedVariable { name: name.clone() }.into()),
        Expression::CountIndex => ctx
            .count_index
            .map(Value::from)
            .ok_or_else(|| ConfigError::expression("count.index", "used outside a counted resource").into()),
        Expression::EachKey => ctx
            .each
            .map(|(key, _)| Value::from(key))
            .ok_or_else(|| ConfigError::expression("each.key", "used outside a for_each resource").into()),
        Expression::EachValue => ctx
            .each
            .map(|(_, value)| value.clone())
            .ok_or_else(|| ConfigError::expression("each.value", "used outside a for_each resource").into()),
        Expression::Resource(reference) => Err(ConfigError::expression(
            reference.target.to_string(),
            "resource references cannot be evaluated at load time",
        )
        .into()),
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["forgeplan.yaml", "forgeplan.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ForgeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(yaml: &str) -> Result<Configuration> {
        let parser = ConfigParser::new();
        let file = parser.parse_yaml(yaml, None)?;
        parser.resolve(&file)
    }

    fn addresses(config: &Configuration) -> Vec<String> {
        config.resources.iter().map(|s| s.address.to_string()).collect()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = resolve("project: { name: demo }").unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.settings.parallelism, 10);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_count_and_variables() {
        let yaml = r#"
project: { name: demo }
variables:
  greeting: { default: hello }
resources:
  - type: local_file
    name: motd
    count: 2
    attributes:
      path: "out/motd-${count.index}.txt"
      content: "${var.greeting}"
"#;
        let config = resolve(yaml).unwrap();
        assert_eq!(addresses(&config), vec!["local_file.motd[0]", "local_file.motd[1]"]);
        let second = &config.resources[1];
        assert_eq!(second.attributes["path"], Value::from("out/motd-1.txt"));
        assert_eq!(second.attributes["content"], Value::from("hello"));
    }

    #[test]
    fn test_cli_variable_wins_over_default() {
        let yaml = r#"
project: { name: demo }
variables:
  greeting: { default: hello }
resources:
  - { type: null_resource, name: a, attributes: { triggers: { g: "${var.greeting}" } } }
"#;
        let parser = ConfigParser::new().with_variable("greeting", "bonjour");
        let file = parser.parse_yaml(yaml, None).unwrap();
        let config = parser.resolve(&file).unwrap();
        let triggers = config.resources[0].attributes["triggers"].as_map().unwrap();
        assert_eq!(triggers["g"], Value::from("bonjour"));
    }

    #[test]
    fn test_undefined_variable_fails() {
        let yaml = r#"
project: { name: demo }
resources:
  - { type: null_resource, name: a, attributes: { triggers: { g: "${var.nope}" } } }
"#;
        let err = resolve(yaml).unwrap_err();
        assert!(matches!(err, ForgeError::Config(ConfigError::UndefinedVariable { .. })));
    }

    #[test]
    fn test_for_each_keys_with_quotes_round_trip() {
        let yaml = r#"
project: { name: demo }
resources:
  - type: null_resource
    name: n
    for_each: ['a"]b', 'back\slash']
"#;
        let config = resolve(yaml).unwrap();
        assert_eq!(config.resources.len(), 2);
        for spec in &config.resources {
            let reparsed: ResourceAddress = spec.address.to_string().parse().unwrap();
            assert_eq!(reparsed, spec.address);
        }
    }

    #[test]
    fn test_for_each_map_and_references_survive() {
        let yaml = r#"
project: { name: demo }
resources:
  - type: local_file
    name: site
    for_each: { blue: "b.txt", green: "g.txt" }
    attributes:
      path: "${each.value}"
      content: "${each.key} ${null_resource.seed.id} $${HOME}"
  - { type: null_resource, name: seed }
"#;
        let config = resolve(yaml).unwrap();
        assert_eq!(
            addresses(&config),
            vec![r#"local_file.site["blue"]"#, r#"local_file.site["green"]"#, "null_resource.seed"]
        );
        let blue = &config.resources[0];
        assert_eq!(blue.attributes["path"], Value::from("b.txt"));
        assert_eq!(
            blue.attributes["content"],
            Value::from("blue ${null_resource.seed.id} $${HOME}")
        );
        assert!(blue.references.contains(&"null_resource.seed".parse().unwrap()));
    }

    #[test]
    fn test_modules_prefix_addresses_and_dependencies() {
        let yaml = r#"
project: { name: demo }
modules:
  net:
    resources:
      - { type: null_resource, name: vpc }
      - { type: null_resource, name: subnet, depends_on: [null_resource.vpc] }
"#;
        let config = resolve(yaml).unwrap();
        let subnet = config.resource(&"module.net.null_resource.subnet".parse().unwrap()).unwrap();
        assert!(subnet.depends_on.contains(&"module.net.null_resource.vpc".parse().unwrap()));
    }

    #[test]
    fn test_depends_on_counted_resource_expands() {
        let yaml = r#"
project: { name: demo }
resources:
  - { type: null_resource, name: worker, count: 2 }
  - { type: null_resource, name: lb, depends_on: [null_resource.worker] }
"#;
        let config = resolve(yaml).unwrap();
        let lb = config.resource(&"null_resource.lb".parse().unwrap()).unwrap();
        assert_eq!(lb.depends_on.len(), 2);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let yaml = r#"
project: { name: demo }
resources:
  - { type: null_resource, name: a }
  - { type: null_resource, name: a }
"#;
        let err = resolve(yaml).unwrap_err();
        assert!(matches!(err, ForgeError::Config(ConfigError::DuplicateAddress { .. })));
    }

    #[test]
    fn test_moved_blocks_parse() {
        let yaml = r#"
project: { name: demo }
moved:
  - { from: null_resource.old, to: "module.app.null_resource.new" }
"#;
        let config = resolve(yaml).unwrap();
        assert_eq!(config.moves.len(), 1);
        assert_eq!(config.moves[0].to.module_path, vec!["app"]);
    }

    #[test]
    fn test_find_config_file_searches_upward() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("forgeplan.yaml"), "project: { name: x }").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("forgeplan.yaml"));
    }

    #[test]
    fn test_init_template_resolves() {
        let config = resolve(include_str!("../../templates/forgeplan.yaml")).unwrap();
        assert_eq!(
            addresses(&config),
            vec!["local_file.motd[0]", "local_file.motd[1]", "null_resource.seed"]
        );
        let seed: ResourceAddress = "null_resource.seed".parse().unwrap();
        for instance in ["local_file.motd[0]", "local_file.motd[1]"] {
            let address: ResourceAddress = instance.parse().unwrap();
            let motd = config.resources.iter().find(|r| r.address == address).unwrap();
            assert!(motd.dependencies().contains(&seed));
        }
    }
}
