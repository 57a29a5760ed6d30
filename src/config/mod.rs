//! Configuration module for v6lab topologies.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `v6lab.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of configuration values

mod parser;
mod spec;
mod validator;

pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, VARIABLE_ENV_PREFIX, find_config_file};
pub use spec::{
    EngineConfig, ImageRecord, LookupConfig, LookupKind, ProjectConfig, ResourceDeclaration,
    SimulationConfig, StateConfig, TopologyConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
