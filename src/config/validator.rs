//! Configuration validation for topology files.
//!
//! The validator checks what can be checked without building the graph:
//! naming, engine limits, lookup and variable usage. Schema and reference
//! checks belong to the graph builder.

use crate::error::{ConfigError, Result, V6labError};
use crate::resource::PropertyValue;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use super::parser::VARIABLE_ENV_PREFIX;
use super::spec::{EngineConfig, LookupConfig, TopologyConfig};

/// Validator for topology configurations.
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

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a topology configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &TopologyConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(V6labError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &TopologyConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_lookups(&config.lookups, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_usage(config, &mut result);

        result
    }

    fn validate_project(project: &super::spec::ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.concurrency == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("engine.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if engine.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.max_attempts"),
                message: String::from("At least one attempt is required"),
            });
        } else if engine.max_attempts > 10 {
            result.warnings.push(format!(
                "engine.max_attempts: {} attempts per operation is unusual",
                engine.max_attempts
            ));
        }

        if engine.initial_backoff_ms > engine.max_backoff_ms {
            result.errors.push(ValidationError {
                field: String::from("engine.initial_backoff_ms"),
                message: format!(
                    "Initial backoff ({} ms) exceeds maximum backoff ({} ms)",
                    engine.initial_backoff_ms, engine.max_backoff_ms
                ),
            });
        }
    }

    fn validate_lookups(lookups: &[LookupConfig], result: &mut ValidationResult) {
        let mut seen_names = HashSet::new();

        for (i, lookup) in lookups.iter().enumerate() {
            let prefix = format!("lookups[{i}]");

            if lookup.name.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: String::from("Lookup name cannot be empty"),
                });
            } else if !seen_names.insert(&lookup.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate lookup name: {}", lookup.name),
                });
            }

            if lookup.owners.is_empty() && lookup.filters.is_empty() {
                result.warnings.push(format!(
                    "{prefix}: Lookup '{}' has no owners or filters and matches every image",
                    lookup.name
                ));
            }

            for (attribute, patterns) in &lookup.filters {
                if patterns.is_empty() {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.filters.{attribute}"),
                        message: String::from("Filter needs at least one pattern"),
                    });
                }
            }
        }
    }

    fn validate_resources(config: &TopologyConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        for (i, resource) in config.resources.iter().enumerate() {
            if !is_valid_resource_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("resources[{i}].name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must start with a letter and use lowercase alphanumerics, '_' or '-'.",
                        resource.name
                    ),
                });
            }
        }
    }

    /// Checks that every lookup and variable used by a resource exists, and
    /// warns about the ones nothing uses.
    fn validate_usage(config: &TopologyConfig, result: &mut ValidationResult) {
        let defined_lookups: BTreeSet<&str> =
            config.lookups.iter().map(|l| l.name.as_str()).collect();
        let mut used_lookups = BTreeSet::new();
        let mut used_variables = BTreeSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            for (property, value) in &resource.properties {
                let field = format!("resources[{i}].properties.{property}");
                match value {
                    PropertyValue::Lookup(l) => {
                        used_lookups.insert(l.lookup.as_str());
                        if !defined_lookups.contains(l.lookup.as_str()) {
                            result.errors.push(ValidationError {
                                field,
                                message: format!("Unknown lookup '{}'", l.lookup),
                            });
                        }
                    }
                    PropertyValue::Variable(v) => {
                        used_variables.insert(v.var.as_str());
                        match config.variables.get(&v.var) {
                            None => result.errors.push(ValidationError {
                                field,
                                message: format!("Unknown variable '{}'", v.var),
                            }),
                            Some(value) if value.is_null() => result.errors.push(ValidationError {
                                field,
                                message: format!(
                                    "Variable '{}' has no value; set {VARIABLE_ENV_PREFIX}{}",
                                    v.var,
                                    v.var.to_uppercase()
                                ),
                            }),
                            Some(_) => {}
                        }
                    }
                    PropertyValue::Reference(_) | PropertyValue::Literal(_) => {}
                }
            }
        }

        for name in defined_lookups.difference(&used_lookups) {
            result.warnings.push(format!("Lookup '{name}' is never used"));
        }
        for name in config.variables.keys() {
            if !used_variables.contains(name.as_str()) {
                result.warnings.push(format!("Variable '{name}' is never used"));
            }
        }
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

/// Resource names additionally allow underscores.
fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> TopologyConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("ipv6-only-testing"));
        assert!(is_valid_name("lab-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Lab")); // uppercase
        assert!(!is_valid_name("123-lab")); // starts with number
        assert!(!is_valid_name("lab_one")); // underscore
        assert!(!is_valid_name("lab-")); // ends with hyphen
        assert!(!is_valid_name("lab--one")); // consecutive hyphens
    }

    #[test]
    fn test_resource_names_allow_underscores() {
        assert!(is_valid_resource_name("ipv6_only_subnet"));
        assert!(!is_valid_resource_name("_hidden"));
        assert!(!is_valid_resource_name("Mixed"));
    }

    #[test]
    fn test_engine_limits() {
        let config = parse(
            "project:\n  name: lab\nengine:\n  concurrency: 0\n  initial_backoff_ms: 5000\n  max_backoff_ms: 100\n",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["engine.concurrency", "engine.initial_backoff_ms"]);
    }

    #[test]
    fn test_unknown_lookup_and_variable() {
        let config = parse(
            r"
project:
  name: lab
variables:
  unused: 1
resources:
  - kind: instance
    name: box
    properties:
      ami: { lookup: missing }
      instance_type: { var: size }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert!(result.warnings.iter().any(|w| w.contains("'unused'")));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_null_variable_names_env_override() {
        let config = parse(
            r"
project:
  name: lab
variables:
  ssh_key_name: ~
resources:
  - kind: instance
    name: box
    properties:
      key_name: { var: ssh_key_name }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors[0].message.contains("V6LAB_VAR_SSH_KEY_NAME"));
    }

    #[test]
    fn test_duplicate_lookup() {
        let config = parse(
            r"
project:
  name: lab
lookups:
  - { name: alma, owners: ['1'] }
  - { name: alma, owners: ['2'] }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.errors[0].field, "lookups[1].name");
    }

    #[test]
    fn test_empty_topology_warns() {
        let result = ConfigValidator::new()
            .validate(&parse("project:\n  name: lab\n"))
            .expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
