//! Languages the engine can run and the isolation modes it can run them in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedLanguage {
    Python,
    JavaScript,
}

impl SupportedLanguage {
    pub const ALL: [SupportedLanguage; 2] = [SupportedLanguage::Python, SupportedLanguage::JavaScript];

    pub fn as_str(&self) -> &'static str {
        match self {
            SupportedLanguage::Python => "python",
            SupportedLanguage::JavaScript => "javascript",
        }
    }

    /// File extension used when staging source for this language.
    pub fn extension(&self) -> &'static str {
        match self {
            SupportedLanguage::Python => "py",
            SupportedLanguage::JavaScript => "js",
        }
    }

    /// Interpreter invocation for a script already present inside the container.
    pub fn run_command(&self, script_path: &str) -> Vec<String> {
        let interpreter = match self {
            SupportedLanguage::Python => "python3",
            SupportedLanguage::JavaScript => "node",
        };
        vec![interpreter.to_string(), script_path.to_string()]
    }
}

impl fmt::Display for SupportedLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupportedLanguage {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" => Ok(SupportedLanguage::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(SupportedLanguage::JavaScript),
            other => Err(ExecutionError::InvalidRequest(format!(
                "Unsupported language: {}",
                other
            ))),
        }
    }
}

/// Isolation strategy a request runs under. Metrics are grouped by this,
/// not by language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionMode {
    Docker,
    GVisor,
}

impl ExecutionMode {
    pub fn from_isolation_flag(use_gvisor: bool) -> Self {
        if use_gvisor {
            ExecutionMode::GVisor
        } else {
            ExecutionMode::Docker
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionMode::Docker => "Docker",
            ExecutionMode::GVisor => "gVisor",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
