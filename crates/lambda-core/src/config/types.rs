//! Configuration types for the execution engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::language::SupportedLanguage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LambdaConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub runtimes: RuntimesConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret every execution request must present.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of idle containers per language, per execution mode.
    #[serde(default = "default_pool_size")]
    pub max_size: usize,
    /// Idle containers older than this are destroyed and replaced.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Hard wall-clock limit for one user program.
    #[serde(default = "default_exec_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory inside the container that staged scripts are copied to.
    #[serde(default = "default_container_work_dir")]
    pub container_work_dir: String,
    /// Host directory for staged source files; the system temp dir when unset.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout_secs(),
            container_work_dir: default_container_work_dir(),
            staging_dir: None,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimesConfig {
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub gvisor: GVisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_python_image")]
    pub python: String,
    #[serde(default = "default_javascript_image")]
    pub javascript: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            python: default_python_image(),
            javascript: default_javascript_image(),
        }
    }
}

impl ImageConfig {
    pub fn image_for(&self, language: SupportedLanguage) -> &str {
        match language {
            SupportedLanguage::Python => &self.python,
            SupportedLanguage::JavaScript => &self.javascript,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GVisorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OCI runtime name registered with the Docker daemon.
    #[serde(default = "default_gvisor_runtime")]
    pub runtime: String,
}

impl Default for GVisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime: default_gvisor_runtime(),
        }
    }
}

impl LambdaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.token must be set (or LAMBDA_AUTH_TOKEN exported)".to_string(),
            ));
        }
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.pool.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "pool.reap_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if !self.execution.container_work_dir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "execution.container_work_dir must be absolute, got '{}'",
                self.execution.container_work_dir
            )));
        }
        for language in SupportedLanguage::ALL {
            if self.runtimes.images.image_for(language).trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "runtimes.images.{} must not be empty",
                    language
                )));
            }
        }
        if self.runtimes.gvisor.enabled && self.runtimes.gvisor.runtime.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "runtimes.gvisor.runtime must be set when gVisor is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_pool_size() -> usize {
    2
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_exec_timeout_secs() -> u64 {
    10
}

fn default_container_work_dir() -> String {
    "/tmp".to_string()
}

fn default_python_image() -> String {
    "python:3.11".to_string()
}

fn default_javascript_image() -> String {
    "node:18".to_string()
}

fn default_gvisor_runtime() -> String {
    "runsc".to_string()
}
