// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Forgeplan
//!
//! A declarative provisioning engine with plan/apply semantics.
//!
//! ## Overview
//!
//! Forgeplan reads resource declarations from `forgeplan.yaml`, compares
//! them with the last-applied state and drives provisioning clients to
//! converge the two:
//!
//! - Dependencies come from `depends_on` and `${type.name.attr}` references
//! - Plans are deterministic and can be saved, reviewed and applied later
//! - Independent resources are provisioned concurrently, up to a bound
//! - State writes are serialized through optimistic serial checks
//!
//! ## Architecture
//!
//! 1. **Configuration**: parsed, validated and expanded into resource specs
//! 2. **Graph**: dependency DAG with cycle detection and stable ordering
//! 3. **Diff**: per-address create, update, replace, destroy or no-op
//! 4. **Scheduler**: execution graph walked with a bounded worker pool
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, values, addresses and references
//! - [`graph`]: Resource dependency graph
//! - [`state`]: State storage backends (local file, memory)
//! - [`provider`]: Provisioning client trait and built-in resource types
//! - [`planner`]: Diff, lifecycle policies, plans and execution
//! - [`refresh`]: Drift detection and state refresh
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: demo
//!
//! resources:
//!   - type: null_resource
//!     name: seed
//!   - type: local_file
//!     name: motd
//!     attributes:
//!       path: out/motd.txt
//!       content: "seed ${null_resource.seed.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod refresh;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Configuration, ResourceAddress, ResourceSpec};
pub use error::{ForgeError, Result};
pub use graph::ResourceGraph;
pub use planner::{DiffEngine, Plan, Planner, RunReport, Scheduler, SchedulerOptions};
pub use provider::{ProviderRegistry, Provisioner};
pub use refresh::{DriftReport, Refresher};
pub use state::{LocalStateStore, MemoryStateStore, StateStore};
