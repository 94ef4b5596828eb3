//! Configuration loader for YAML files and environment overrides
//!
//! Settings are read from YAML, then a small set of environment variables is
//! applied on top so that secrets and sizing can be set per deployment
//! without editing the file.

use std::env;
use std::path::Path;
use tokio::fs;

use super::types::LambdaConfig;
use crate::errors::ConfigError;

pub const ENV_AUTH_TOKEN: &str = "LAMBDA_AUTH_TOKEN";
pub const ENV_POOL_SIZE: &str = "LAMBDA_POOL_SIZE";
pub const ENV_EXEC_TIMEOUT_SECS: &str = "LAMBDA_EXEC_TIMEOUT_SECS";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<LambdaConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<LambdaConfig, ConfigError> {
        let config: LambdaConfig = serde_yaml::from_str(content)?;
        Self::finish(config)
    }

    /// Built-in defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<LambdaConfig, ConfigError> {
        Self::finish(LambdaConfig::default())
    }

    fn finish(mut config: LambdaConfig) -> Result<LambdaConfig, ConfigError> {
        Self::apply_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides<F>(config: &mut LambdaConfig, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_AUTH_TOKEN) {
            config.auth.token = token;
        }
        if let Some(size) = lookup(ENV_POOL_SIZE) {
            config.pool.max_size = size.trim().parse().map_err(|e| {
                ConfigError::Invalid(format!("{} must be an integer: {}", ENV_POOL_SIZE, e))
            })?;
        }
        if let Some(secs) = lookup(ENV_EXEC_TIMEOUT_SECS) {
            config.execution.timeout_secs = secs.trim().parse().map_err(|e| {
                ConfigError::Invalid(format!(
                    "{} must be an integer: {}",
                    ENV_EXEC_TIMEOUT_SECS, e
                ))
            })?;
        }
        Ok(())
    }
}
