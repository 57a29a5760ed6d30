//! Configuration parser for loading topology files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, V6labError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::TopologyConfig;

/// Prefix of environment variables that override topology variables.
pub const VARIABLE_ENV_PREFIX: &str = "V6LAB_VAR_";

/// Configuration parser for loading topology configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<TopologyConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(V6labError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            V6labError::Config(ConfigError::ParseError {
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
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<TopologyConfig> {
        debug!("Parsing YAML configuration");

        let config: TopologyConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            V6labError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {}: {} resources, {} lookups",
            config.project.name,
            config.resources.len(),
            config.lookups.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `V6LAB_PROJECT_NAME`, `V6LAB_STATE_PATH`,
    /// `V6LAB_CONCURRENCY` and `V6LAB_VAR_<NAME>` for each topology variable
    /// (upper-cased name).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<TopologyConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `V6LAB_CONCURRENCY` is not a positive integer.
    pub fn apply_env_overrides(
        config: &mut TopologyConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("V6LAB_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(path) = lookup("V6LAB_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(value) = lookup("V6LAB_CONCURRENCY") {
            let concurrency = value
                .parse::<usize>()
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| {
                    V6labError::Config(ConfigError::InvalidEnvVar {
                        name: String::from("V6LAB_CONCURRENCY"),
                        value: value.clone(),
                    })
                })?;
            debug!("Overriding engine.concurrency from environment");
            config.engine.concurrency = Some(concurrency);
        }

        for (name, value) in &mut config.variables {
            let env_name = format!("{VARIABLE_ENV_PREFIX}{}", name.to_uppercase());
            if let Some(raw) = lookup(&env_name) {
                debug!("Overriding variable {name} from {env_name}");
                *value = serde_json::Value::String(raw);
            }
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
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                V6labError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["v6lab.yaml", "v6lab.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
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

    Err(V6labError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PropertyValue, ResourceKey, ResourceKind};
    use std::collections::HashMap;

    const LAB: &str = r#"
project:
  name: ipv6-only-testing

variables:
  vpc_cidr_block_ipv4: "10.0.0.0/16"
  ssh_key_name: ~

lookups:
  - name: almalinux_9_x86_64
    owners: ["764336703387"]
    filters:
      architecture: [x86_64]
      name: ["AlmaLinux OS 9.*"]

resources:
  - kind: vpc
    name: ipv6_only_testing
    properties:
      cidr_block: { var: vpc_cidr_block_ipv4 }
      assign_generated_ipv6_cidr_block: true
  - kind: subnet
    name: ipv6_only_subnet
    properties:
      vpc_id: { ref: vpc.ipv6_only_testing.id }
      ipv6_native: true
      ipv6_cidr_block:
        ref: vpc.ipv6_only_testing.ipv6_cidr_block
        cidrsubnet: { newbits: 8, netnum: 0 }
"#;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = "project:\n  name: lab\n";
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(config.project.name, "lab");
        assert_eq!(config.project.environment, "lab");
        assert_eq!(config.engine.max_attempts, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_topology() {
        let config = ConfigParser::new().parse_yaml(LAB, None).expect("parse");
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.lookups[0].owners, vec!["764336703387"]);
        assert!(config.lookups[0].most_recent);
        assert_eq!(config.variables["ssh_key_name"], serde_json::Value::Null);

        let subnet = &config.resources[1];
        assert_eq!(subnet.kind, ResourceKind::Subnet);
        assert_eq!(
            subnet.properties["vpc_id"],
            PropertyValue::reference(ResourceKey::new(ResourceKind::Vpc, "ipv6_only_testing"), "id")
        );
        let cidr = subnet.properties["ipv6_cidr_block"]
            .as_reference()
            .and_then(|r| r.cidrsubnet)
            .expect("cidrsubnet");
        assert_eq!((cidr.newbits, cidr.netnum), (8, 0));
    }

    #[test]
    fn test_unknown_kind_is_a_parse_error() {
        let yaml = "project:\n  name: lab\nresources:\n  - kind: bucket\n    name: logs\n";
        let err = ConfigParser::new().parse_yaml(yaml, None).expect_err("bad kind");
        assert!(matches!(err, V6labError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml(LAB, None).expect("parse");
        let env: HashMap<&str, &str> = HashMap::from([
            ("V6LAB_PROJECT_NAME", "other"),
            ("V6LAB_CONCURRENCY", "3"),
            ("V6LAB_VAR_SSH_KEY_NAME", "lab-key"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, |n| env.get(n).map(|v| (*v).to_string()))
            .expect("overrides");

        assert_eq!(config.project.name, "other");
        assert_eq!(config.engine.concurrency, Some(3));
        assert_eq!(config.variables["ssh_key_name"], serde_json::json!("lab-key"));
    }

    #[test]
    fn test_invalid_concurrency_override() {
        let mut config = ConfigParser::new().parse_yaml(LAB, None).expect("parse");
        let err = ConfigParser::apply_env_overrides(&mut config, |n| {
            (n == "V6LAB_CONCURRENCY").then(|| String::from("0"))
        })
        .expect_err("zero");
        assert!(matches!(err, V6labError::Config(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("v6lab.yaml"), "project:\n  name: lab\n").expect("write");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("v6lab.yaml"));
    }
}
