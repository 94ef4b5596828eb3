//! Test doubles for the sandbox layer.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::SandboxError;
use crate::language::SupportedLanguage;
use crate::sandbox::{ContainerHandle, ExecOutput, SandboxRuntime};

/// What the mock answers when the interpreter is invoked.
#[derive(Debug, Clone)]
pub enum MockExec {
    /// Return whatever was copied in as stdout.
    Echo,
    Output(ExecOutput),
    Timeout,
    Fail(String),
}

/// In-memory `SandboxRuntime` that counts every call.
pub struct MockSandbox {
    next_id: AtomicUsize,
    spawn_calls: AtomicUsize,
    copy_calls: AtomicUsize,
    exec_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    fail_spawn: AtomicBool,
    fail_copy: AtomicBool,
    exec: Mutex<MockExec>,
    exec_delay: Mutex<Duration>,
    live: Mutex<HashSet<String>>,
    files: Mutex<HashMap<(String, String), String>>,
    commands: Mutex<Vec<Vec<String>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            spawn_calls: AtomicUsize::new(0),
            copy_calls: AtomicUsize::new(0),
            exec_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            fail_spawn: AtomicBool::new(false),
            fail_copy: AtomicBool::new(false),
            exec: Mutex::new(MockExec::Echo),
            exec_delay: Mutex::new(Duration::ZERO),
            live: Mutex::new(HashSet::new()),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_copy(&self, fail: bool) {
        self.fail_copy.store(fail, Ordering::SeqCst);
    }

    pub fn set_exec(&self, exec: MockExec) {
        *self.exec.lock().unwrap() = exec;
    }

    /// Make every interpreter run take `delay` before answering.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn spawn_calls(&self) -> usize {
        self.spawn_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> usize {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockSandbox {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, language: SupportedLanguage) -> Result<ContainerHandle, SandboxError> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend("no such image".to_string()));
        }
        let id = format!("mock-{}-{}", language, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(id.clone());
        Ok(ContainerHandle::new(id, language))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_copy.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend("copy refused".to_string()));
        }
        let contents = tokio::fs::read_to_string(local_path).await?;
        self.files
            .lock()
            .unwrap()
            .insert((handle.id().to_string(), remote_path.to_string()), contents);
        Ok(())
    }

    async fn exec_in(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.to_vec());

        if command.first().map(String::as_str) == Some("rm") {
            if let Some(path) = command.last() {
                self.files
                    .lock()
                    .unwrap()
                    .remove(&(handle.id().to_string(), path.clone()));
            }
            return Ok(ExecOutput::default());
        }

        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let behaviour = self.exec.lock().unwrap().clone();
        match behaviour {
            MockExec::Echo => {
                let path = command.last().cloned().unwrap_or_default();
                let stdout = self
                    .files
                    .lock()
                    .unwrap()
                    .get(&(handle.id().to_string(), path))
                    .cloned()
                    .unwrap_or_default();
                Ok(ExecOutput {
                    stdout,
                    ..Default::default()
                })
            }
            MockExec::Output(output) => Ok(output),
            MockExec::Timeout => Err(SandboxError::Timeout(timeout)),
            MockExec::Fail(message) => Err(SandboxError::Backend(message)),
        }
    }

    async fn destroy(&self, handle: ContainerHandle) -> Result<(), SandboxError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().remove(handle.id());
        Ok(())
    }
}
