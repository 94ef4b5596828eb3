//! Core execution engine for running untrusted functions in warm containers.
//!
//! A request carrying source code and a language is staged on the host,
//! copied into a pre-started container and run there under a wall-clock
//! limit. Containers come from a bounded per-language pool that refills
//! itself in the background, and every execution feeds a metrics ledger that
//! can be rolled up per isolation mode on demand.
//!
//! # Architecture Overview
//!
//! - **Sandbox runtime**: uniform spawn/copy/exec/destroy over Docker, with a
//!   gVisor variant selected by OCI runtime
//! - **Container pool**: exclusive hand-out, replenishment, idle eviction
//! - **Dispatcher**: auth, staging, execution, classification, timing
//! - **Metrics**: append-only ledger with per-mode rollup
//! - **Engine**: wiring plus warm-up, reaper and shutdown lifecycle

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod language;
pub mod metrics;
pub mod pool;
pub mod sandbox;
pub mod staging;

pub use config::{ConfigLoader, LambdaConfig};
pub use dispatcher::{Dispatcher, ExecutionRequest, ExecutionResult};
pub use engine::{Engine, WarmupState};
pub use errors::{ConfigError, ExecutionError, SandboxError};
pub use language::{ExecutionMode, SupportedLanguage};
pub use metrics::{MetricsAggregator, MetricsReport, ModeSummary};
pub use pool::ContainerPool;
pub use sandbox::{ContainerHandle, DockerSandbox, ExecOutput, SandboxRuntime};

#[cfg(test)]
pub mod test_utils;
