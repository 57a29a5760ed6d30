// ============================================================================
// Linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # v6lab
//!
//! A declarative, dependency-aware reconciler for IPv6 network test labs.
//!
//! ## Overview
//!
//! v6lab converges a set of declared cloud network resources to their
//! declared state:
//!
//! - Declare VPCs, subnets, routes, security rules and instances in YAML
//! - Wire them together with references to each other's outputs
//! - Preview the exact operations before anything changes
//! - Apply them with bounded parallelism, retries and partial-failure
//!   isolation
//!
//! ## Architecture
//!
//! A run flows through five stages:
//!
//! 1. **Graph**: declarations become a dependency graph ([`graph`])
//! 2. **Diff**: each node is compared with the last snapshot ([`planner`])
//! 3. **Plan**: diffs become ordered create, update and delete operations
//! 4. **Execute**: operations run against a [`provider::Provider`]
//! 5. **Commit**: confirmed outcomes are folded into the next snapshot ([`state`])
//!
//! ## Modules
//!
//! - [`config`]: Topology parsing and validation
//! - [`resource`]: Resource kinds, keys and property values
//! - [`graph`]: Dependency graph construction and fingerprinting
//! - [`planner`]: Diffing, planning and plan execution
//! - [`provider`]: Provider interface, retries, lookups, simulation
//! - [`state`]: Snapshot storage and locking
//! - [`reconciler`]: End-to-end runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: ipv6-only-testing
//!
//! resources:
//!   - kind: vpc
//!     name: lab
//!     properties:
//!       cidr_block: "10.0.0.0/16"
//!       assign_generated_ipv6_cidr_block: true
//!
//!   - kind: subnet
//!     name: ipv6_only
//!     properties:
//!       vpc_id: { ref: vpc.lab.id }
//!       ipv6_native: true
//!       ipv6_cidr_block:
//!         ref: vpc.lab.ipv6_cidr_block
//!         cidrsubnet: { newbits: 8, netnum: 0 }
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
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, TopologyConfig};
pub use error::{Result, V6labError};
pub use graph::{GraphBuilder, GraphHasher, ResourceGraph};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{Provider, SimulatedProvider};
pub use reconciler::{PlanPreview, Reconciler, RunReport};
pub use resource::{PropertyValue, ResourceKey, ResourceKind};
pub use state::{LocalStateStore, MemoryStateStore, RunOutcome, StateSnapshot, StateStore};
