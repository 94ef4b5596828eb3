//! Execution dispatcher: the per-request protocol.
//!
//! A request is authorized, its language and isolation mode resolved, and its
//! source staged on the host. A container is then borrowed from the pool for
//! that mode, the file copied in and the interpreter run under a hard timeout.
//! Whatever happens after input validation, exactly one metric is recorded,
//! even if the caller stops waiting. Nothing is retried.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LambdaConfig;
use crate::errors::{ExecutionError, SandboxError};
use crate::language::{ExecutionMode, SupportedLanguage};
use crate::metrics::MetricsAggregator;
use crate::pool::ContainerPool;
use crate::sandbox::{ContainerHandle, ExecOutput};
use crate::staging::StagedSource;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    /// Raw language name as sent by the caller; validated by the dispatcher.
    pub lang: String,
    pub use_gvisor: bool,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Trimmed standard output of the user program.
    pub output: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub token: String,
    pub timeout: Duration,
    pub container_work_dir: String,
    pub staging_dir: Option<PathBuf>,
}

impl DispatcherSettings {
    pub fn from_config(config: &LambdaConfig) -> Self {
        Self {
            token: config.auth.token.clone(),
            timeout: config.execution.timeout(),
            container_work_dir: config.execution.container_work_dir.clone(),
            staging_dir: config.execution.staging_dir.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    settings: DispatcherSettings,
    pools: HashMap<ExecutionMode, ContainerPool>,
    metrics: Arc<MetricsAggregator>,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            settings,
            pools: HashMap::new(),
            metrics,
        }
    }

    /// Serve `mode` from `pool`.
    pub fn with_pool(mut self, mode: ExecutionMode, pool: ContainerPool) -> Self {
        self.pools.insert(mode, pool);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn supports(&self, mode: ExecutionMode) -> bool {
        self.pools.contains_key(&mode)
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        if request.token != self.settings.token {
            log::warn!("Rejected execution request with invalid token");
            return Err(ExecutionError::Unauthorized);
        }

        let language: SupportedLanguage = request.lang.parse()?;
        let mode = ExecutionMode::from_isolation_flag(request.use_gvisor);
        let pool = self.pools.get(&mode).ok_or_else(|| {
            ExecutionError::InvalidRequest(format!("{} execution is not enabled", mode))
        })?;

        // The attempt runs on its own task: dropping this future leaves it to
        // finish, return its container and record its metric.
        let dispatcher = self.clone();
        let pool = pool.clone();
        let attempt = tokio::spawn(async move {
            dispatcher.dispatch(&pool, mode, language, &request.code).await
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("{} {} execution task failed: {}", mode, language, e);
                Err(ExecutionError::RuntimeError(format!("execution task failed: {}", e)))
            }
        }
    }

    async fn dispatch(
        &self,
        pool: &ContainerPool,
        mode: ExecutionMode,
        language: SupportedLanguage,
        code: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        let (result, elapsed) = self.run(pool, language, code).await;
        self.metrics
            .record(mode, language, elapsed, result.is_err())
            .await;

        match &result {
            Ok(_) => log::info!("{} {} execution succeeded in {:?}", mode, language, elapsed),
            Err(e) => log::info!(
                "{} {} execution failed in {:?} ({}): {}",
                mode,
                language,
                elapsed,
                e.kind(),
                e
            ),
        }
        result
    }

    async fn run(
        &self,
        pool: &ContainerPool,
        language: SupportedLanguage,
        code: &str,
    ) -> (Result<ExecutionResult, ExecutionError>, Duration) {
        let attempt = Instant::now();

        // Removed when `staged` drops, on every path out of this function.
        let staged = match StagedSource::write(self.settings.staging_dir.as_deref(), language, code).await {
            Ok(staged) => staged,
            Err(e) => {
                return (
                    Err(ExecutionError::StagingFailed(format!(
                        "could not write source file: {}",
                        e
                    ))),
                    attempt.elapsed(),
                )
            }
        };

        let handle = match pool.acquire(language).await {
            Ok(handle) => handle,
            Err(e) => return (Err(e), attempt.elapsed()),
        };

        let started_at = Utc::now();
        let start = Instant::now();
        let runtime = pool.runtime();
        let remote_path = staged.remote_path(&self.settings.container_work_dir);

        if let Err(e) = runtime.copy_in(&handle, staged.path(), &remote_path).await {
            log::error!("Copy into container {} failed: {}", handle.id(), e);
            pool.discard(handle).await;
            return (Err(ExecutionError::StagingFailed(e.to_string())), start.elapsed());
        }

        let command = language.run_command(&remote_path);
        let exec = runtime.exec_in(&handle, &command, self.settings.timeout).await;
        let duration = start.elapsed();
        let finished_at = Utc::now();

        let result = match exec {
            Ok(output) => {
                let result = classify(output, started_at, finished_at, duration);
                self.return_container(pool, handle, &remote_path).await;
                result
            }
            Err(SandboxError::Timeout(limit)) => {
                // Destroying the container kills the runaway process with it.
                pool.discard(handle).await;
                Err(ExecutionError::Timeout(limit))
            }
            Err(e) => {
                pool.discard(handle).await;
                Err(ExecutionError::RuntimeError(format!("execution failed: {}", e)))
            }
        };
        (result, duration)
    }

    /// Remove the staged script from the container before it goes back into
    /// the pool, so the next borrower can't read it.
    async fn return_container(&self, pool: &ContainerPool, handle: ContainerHandle, remote_path: &str) {
        let cleanup = vec!["rm".to_string(), "-f".to_string(), remote_path.to_string()];
        match pool.runtime().exec_in(&handle, &cleanup, CLEANUP_TIMEOUT).await {
            Ok(output) if output.exit_code == 0 => pool.release(handle).await,
            Ok(output) => {
                log::warn!(
                    "Cleanup in container {} exited with {}, discarding it",
                    handle.id(),
                    output.exit_code
                );
                pool.discard(handle).await;
            }
            Err(e) => {
                log::warn!("Cleanup in container {} failed: {}", handle.id(), e);
                pool.discard(handle).await;
            }
        }
    }
}

fn classify(
    output: ExecOutput,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration: Duration,
) -> Result<ExecutionResult, ExecutionError> {
    if output.failed() {
        let stderr = output.stderr.trim();
        let message = if stderr.is_empty() {
            format!("process exited with status {}", output.exit_code)
        } else {
            stderr.to_string()
        };
        return Err(ExecutionError::RuntimeError(message));
    }

    Ok(ExecutionResult {
        output: output.stdout.trim().to_string(),
        stderr: output.stderr,
        started_at,
        finished_at,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockExec, MockSandbox};

    const TOKEN: &str = "secure123";

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            token: TOKEN.to_string(),
            timeout: Duration::from_secs(2),
            container_work_dir: "/tmp".to_string(),
            staging_dir: None,
        }
    }

    fn dispatcher(mock: &Arc<MockSandbox>) -> (Dispatcher, ContainerPool) {
        let pool = ContainerPool::new(mock.clone(), 1);
        let dispatcher = Dispatcher::new(settings(), Arc::new(MetricsAggregator::new()))
            .with_pool(ExecutionMode::Docker, pool.clone());
        (dispatcher, pool)
    }

    fn request(code: &str, lang: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            lang: lang.to_string(),
            use_gvisor: false,
            token: TOKEN.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_execution_records_one_metric() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, _pool) = dispatcher(&mock);

        let result = dispatcher.execute(request("  hello\n", "python")).await.unwrap();

        assert_eq!(result.output, "hello");
        assert!(result.finished_at >= result.started_at);
        let records = dispatcher.metrics().records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].errored);
        assert_eq!(records[0].mode, ExecutionMode::Docker);
        assert_eq!(records[0].language, SupportedLanguage::Python);
    }

    #[tokio::test]
    async fn test_runs_language_command_at_work_dir() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, _pool) = dispatcher(&mock);

        dispatcher.execute(request("console.log(1)", "js")).await.unwrap();

        let commands = mock.commands();
        assert_eq!(commands[0][0], "node");
        assert!(commands[0][1].starts_with("/tmp/") && commands[0][1].ends_with(".js"));
        assert_eq!(commands[1][0], "rm", "staged script is removed before reuse");
    }

    #[tokio::test]
    async fn test_unauthorized_touches_nothing() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, pool) = dispatcher(&mock);

        let mut req = request("print(1)", "python");
        req.token = "wrong".to_string();
        let err = dispatcher.execute(req).await.unwrap_err();

        assert_eq!(err, ExecutionError::Unauthorized);
        assert!(dispatcher.metrics().is_empty().await);
        assert_eq!(mock.spawn_calls(), 0);
        assert_eq!(pool.pending_count(SupportedLanguage::Python).await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_input_error() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher.execute(request("puts 1", "ruby")).await.unwrap_err();

        assert!(matches!(err, ExecutionError::InvalidRequest(_)));
        assert_eq!(mock.spawn_calls(), 0);
        assert!(dispatcher.metrics().is_empty().await);
    }

    #[tokio::test]
    async fn test_disabled_mode_is_input_error() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, _pool) = dispatcher(&mock);

        let mut req = request("print(1)", "python");
        req.use_gvisor = true;
        let err = dispatcher.execute(req).await.unwrap_err();

        assert!(matches!(err, ExecutionError::InvalidRequest(ref m) if m.contains("gVisor")));
        assert_eq!(mock.spawn_calls(), 0);
    }

    #[tokio::test]
    async fn test_copy_failure_is_staging_failed_and_recorded() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_fail_copy(true);
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher.execute(request("print(1)", "python")).await.unwrap_err();

        assert!(matches!(err, ExecutionError::StagingFailed(_)));
        assert!(err.is_infrastructure());
        assert_eq!(mock.exec_calls(), 0);
        assert_eq!(mock.destroy_calls(), 1, "container is discarded after a failed copy");
        let records = dispatcher.metrics().records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].errored);
    }

    #[tokio::test]
    async fn test_stderr_is_runtime_error() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_exec(MockExec::Output(ExecOutput {
            stdout: String::new(),
            stderr: "  NameError: name 'x' is not defined\n".to_string(),
            exit_code: 1,
        }));
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher.execute(request("x", "python")).await.unwrap_err();

        assert_eq!(
            err,
            ExecutionError::RuntimeError("NameError: name 'x' is not defined".to_string())
        );
        assert!(!err.is_infrastructure());
        assert!(dispatcher.metrics().records().await[0].errored);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr_is_runtime_error() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_exec(MockExec::Output(ExecOutput {
            stdout: "partial".to_string(),
            stderr: String::new(),
            exit_code: 3,
        }));
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher.execute(request("exit(3)", "python")).await.unwrap_err();
        assert_eq!(
            err,
            ExecutionError::RuntimeError("process exited with status 3".to_string())
        );
    }

    #[tokio::test]
    async fn test_timeout_discards_container() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_exec(MockExec::Timeout);
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher
            .execute(request("while True: pass", "python"))
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::Timeout(Duration::from_secs(2)));
        assert_eq!(mock.destroy_calls(), 1);
        assert!(dispatcher.metrics().records().await[0].errored);
    }

    #[tokio::test]
    async fn test_abandoned_call_still_returns_container_and_records() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_exec_delay(Duration::from_millis(300));
        let (dispatcher, pool) = dispatcher(&mock);
        pool.warm_up().await;

        // The caller gives up long before the program finishes.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.execute(request("print(1)", "python")),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..100 {
            if !dispatcher.metrics().is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = dispatcher.metrics().records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].errored);
        assert_eq!(pool.idle_count(SupportedLanguage::Python).await, 1);
        // One warm python, one warm javascript, nothing stranded.
        assert_eq!(mock.live_containers(), 2);
    }

    #[tokio::test]
    async fn test_container_unavailable_is_recorded() {
        let mock = Arc::new(MockSandbox::new());
        mock.set_fail_spawn(true);
        let (dispatcher, _pool) = dispatcher(&mock);

        let err = dispatcher.execute(request("print(1)", "python")).await.unwrap_err();

        assert!(matches!(err, ExecutionError::ContainerUnavailable(_)));
        let records = dispatcher.metrics().records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].errored);
    }

    #[tokio::test]
    async fn test_one_metric_per_call_matches_outcome() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, _pool) = dispatcher(&mock);

        let mut outcomes = Vec::new();
        for i in 0..6 {
            if i % 3 == 2 {
                mock.set_exec(MockExec::Fail("daemon went away".to_string()));
            } else {
                mock.set_exec(MockExec::Echo);
            }
            outcomes.push(dispatcher.execute(request("ok", "python")).await.is_err());
        }

        let records = dispatcher.metrics().records().await;
        assert_eq!(records.len(), outcomes.len());
        let flags: Vec<bool> = records.iter().map(|r| r.errored).collect();
        assert_eq!(flags, outcomes);

        let report = dispatcher.metrics().report().await;
        assert_eq!(report["Docker"].total_requests, 6);
        assert!((report["Docker"].error_rate - 2.0 / 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_container_returns_to_pool_after_run() {
        let mock = Arc::new(MockSandbox::new());
        let (dispatcher, pool) = dispatcher(&mock);
        pool.warm_up().await;

        dispatcher.execute(request("1", "python")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Target is one: the borrowed container or its replacement is idle,
        // the other one is destroyed as surplus.
        assert_eq!(pool.idle_count(SupportedLanguage::Python).await, 1);
        assert_eq!(mock.live_containers(), 2, "one python, one javascript");
    }
}
