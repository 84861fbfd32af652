//! Configuration validation.
//!
//! Validation runs on the raw [`ConfigFile`] before resolution and
//! collects every problem it finds. The first error is returned; the
//! rest are logged.

use crate::error::{ConfigError, ForgeError, Result};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::address::{is_identifier, ResourceAddress};
use super::reference::{Expression, Part, Template};
use super::spec::{ConfigFile, ModuleConfig, ResourceConfig, StateBackend};
use super::value::Value;

/// Validator for configuration files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Which instance expressions a resource block may use.
#[derive(Clone, Copy)]
struct InstanceMode {
    counted: bool,
    keyed: bool,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &ConfigFile) -> Result<ValidationResult> {
        let result = self.check(config);

        for warning in &result.warnings {
            warn!("{warning}");
        }

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            for error in result.errors.iter().skip(1) {
                warn!("Additional validation error: {error}");
            }
            let first_error = &result.errors[0];
            Err(ForgeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &ConfigFile) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_variables(config, &mut result);
        Self::validate_module("", &config.resources, &config.modules, &mut result);
        Self::validate_moved(config, &mut result);

        if config.resources.is_empty() && config.modules.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
        }

        result
    }

    fn validate_project(config: &ConfigFile, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if config.settings.parallelism == 0 {
            result.error("settings.parallelism", "Parallelism must be at least 1");
        }
        if config.settings.default_timeout_secs == 0 {
            result.error("settings.default_timeout_secs", "Default timeout must be at least 1 second");
        }

        match config.state.backend {
            StateBackend::Local => {
                if config.state.path.as_ref().is_some_and(String::is_empty) {
                    result.error("state.path", "State path cannot be empty");
                }
            }
            StateBackend::Memory => {
                if config.state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the memory backend"));
                }
                result.warnings.push(String::from(
                    "Memory state backend keeps nothing between runs",
                ));
            }
        }
    }

    fn validate_variables(config: &ConfigFile, result: &mut ValidationResult) {
        for name in config.variables.keys() {
            if !is_identifier(name) {
                result.error(
                    format!("variables.{name}"),
                    format!("Variable name '{name}' is not a valid identifier"),
                );
            }
        }
    }

    fn validate_module(
        prefix: &str,
        resources: &[ResourceConfig],
        modules: &BTreeMap<String, ModuleConfig>,
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let field = format!("{prefix}resources[{i}]");
            if !seen.insert((&resource.resource_type, &resource.name)) {
                result.error(
                    format!("{field}.name"),
                    format!(
                        "Duplicate resource: {}.{}",
                        resource.resource_type, resource.name
                    ),
                );
            }
            Self::validate_resource(&field, resource, result);
        }

        for (name, module) in modules {
            if !is_identifier(name) || name == "module" {
                result.error(
                    format!("{prefix}modules.{name}"),
                    format!("Module name '{name}' is not a valid identifier"),
                );
            }
            let child = format!("{prefix}modules.{name}.");
            Self::validate_module(&child, &module.resources, &module.modules, result);
        }
    }

    fn validate_resource(field: &str, resource: &ResourceConfig, result: &mut ValidationResult) {
        if !is_identifier(&resource.resource_type) || resource.resource_type == "module" {
            result.error(
                format!("{field}.type"),
                format!("Resource type '{}' is not a valid identifier", resource.resource_type),
            );
        }
        if !is_identifier(&resource.name) {
            result.error(
                format!("{field}.name"),
                format!("Resource name '{}' is not a valid identifier", resource.name),
            );
        }

        if resource.count.is_some() && resource.for_each.is_some() {
            result.error(field, "count and for_each cannot be used together");
        }
        if resource.count == Some(0) {
            result
                .warnings
                .push(format!("{field}.count: count is 0, no instances will be created"));
        }
        if resource.timeout_secs == Some(0) {
            result.error(format!("{field}.timeout_secs"), "Timeout must be at least 1 second");
        }

        for (i, path) in resource.lifecycle.ignore_changes.iter().enumerate() {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                result.error(
                    format!("{field}.lifecycle.ignore_changes[{i}]"),
                    format!("Invalid attribute path '{path}'"),
                );
            }
        }

        for (i, dependency) in resource.depends_on.iter().enumerate() {
            if let Err(e) = dependency.parse::<ResourceAddress>() {
                result.error(format!("{field}.depends_on[{i}]"), e.to_string());
            }
        }

        let mode = InstanceMode {
            counted: resource.count.is_some(),
            keyed: resource.for_each.is_some(),
        };
        for (key, raw) in &resource.attributes {
            match Value::from_yaml(raw.clone()) {
                Ok(Some(value)) => {
                    check_templates(&value, &format!("{field}.attributes.{key}"), mode, result);
                }
                Ok(None) => {}
                Err(e) => result.error(format!("{field}.attributes.{key}"), e.to_string()),
            }
        }
    }

    fn validate_moved(config: &ConfigFile, result: &mut ValidationResult) {
        let mut sources = HashSet::new();
        for (i, moved) in config.moved.iter().enumerate() {
            let field = format!("moved[{i}]");
            let from = moved.from.parse::<ResourceAddress>();
            let to = moved.to.parse::<ResourceAddress>();
            match (&from, &to) {
                (Ok(from), Ok(to)) => {
                    if from == to {
                        result.error(&field, format!("Move from {from} to itself"));
                    }
                    if from.resource_type != to.resource_type {
                        result.error(
                            &field,
                            format!("Cannot move {from} to {to}: resource types differ"),
                        );
                    }
                    if !sources.insert(from.clone()) {
                        result.error(&field, format!("{from} is moved more than once"));
                    }
                }
                (Err(e), _) => result.error(format!("{field}.from"), e.to_string()),
                (_, Err(e)) => result.error(format!("{field}.to"), e.to_string()),
            }
        }
    }
}

fn check_templates(value: &Value, field: &str, mode: InstanceMode, result: &mut ValidationResult) {
    match value {
        Value::String(s) => match Template::parse(s, &[]) {
            Ok(template) => {
                for part in template.parts {
                    match part {
                        Part::Expr {
                            expression: Expression::CountIndex,
                            ..
                        } if !mode.counted => {
                            result.error(field, "count.index used in a resource without count");
                        }
                        Part::Expr {
                            expression: Expression::EachKey | Expression::EachValue,
                            ..
                        } if !mode.keyed => {
                            result.error(field, "each.* used in a resource without for_each");
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => result.error(field, e.to_string()),
        },
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                check_templates(item, &format!("{field}[{i}]"), mode, result);
            }
        }
        Value::Map(map) | Value::Object(map) => {
            for (key, item) in map {
                check_templates(item, &format!("{field}.{key}"), mode, result);
            }
        }
        Value::Number(_) | Value::Bool(_) => {}
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
