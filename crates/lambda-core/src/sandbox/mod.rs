//! Sandbox runtime adapters.
//!
//! A `SandboxRuntime` hides which host tool actually runs containers. The pool
//! and dispatcher only see the four lifecycle operations below, so a plain
//! Docker backend, a gVisor-backed one, or a test double are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::errors::SandboxError;
use crate::language::SupportedLanguage;

pub mod docker;

pub use docker::DockerSandbox;

/// One running container. Deliberately not `Clone`: whoever holds the
/// handle has exclusive use of the container.
#[derive(Debug)]
pub struct ContainerHandle {
    id: String,
    language: SupportedLanguage,
    created_at: DateTime<Utc>,
    idle_since: Instant,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, language: SupportedLanguage) -> Self {
        Self {
            id: id.into(),
            language,
            created_at: Utc::now(),
            idle_since: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> SupportedLanguage {
        self.language
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }
}

/// Captured result of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    /// A run counts as failed on a non-zero exit or anything written to stderr.
    pub fn failed(&self) -> bool {
        self.exit_code != 0 || !self.stderr.trim().is_empty()
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable backend name, used in logs.
    fn backend_name(&self) -> &'static str;

    /// Start a long-lived idle container for `language`.
    async fn spawn(&self, language: SupportedLanguage) -> Result<ContainerHandle, SandboxError>;

    /// Copy a host file into the container at `remote_path`.
    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError>;

    /// Run `command` inside the container, giving up after `timeout`.
    async fn exec_in(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    /// Stop and remove the container.
    async fn destroy(&self, handle: ContainerHandle) -> Result<(), SandboxError>;
}
