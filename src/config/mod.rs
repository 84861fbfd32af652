//! Configuration module.
//!
//! This module handles everything that happens before planning:
//! - Typed attribute values and resource addresses
//! - Parsing `forgeplan.yaml` and resolving variables, instances and modules
//! - `${...}` reference templates
//! - Validation of configuration values
//! - Fingerprints of specs and state

mod address;
mod hash;
mod parser;
mod reference;
mod spec;
mod validator;
mod value;

pub use address::{is_identifier, InstanceKey, ResourceAddress};
pub use hash::{hash_bytes, ConfigHasher};
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, VAR_ENV_PREFIX};
pub use reference::{
    escape_literal, find_references, lookup_known, resolve_attributes, resolve_value, PlannedValue,
    Reference,
};
pub use spec::{
    ConfigFile, Configuration, LifecyclePolicy, ModuleConfig, Move, MovedConfig, ProjectConfig,
    ResourceConfig, ResourceSpec, Settings, StateBackend, StateConfig, VariableConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use value::{lookup_path, remove_path, set_path, Attributes, Value};
