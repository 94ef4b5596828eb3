//! Warm container pool.
//!
//! Keeps up to `max_size` idle containers per language for one sandbox
//! backend. Hand-out is a single pop under the pool lock, so a handle can never
//! be given to two callers. When a pop (or a discard, or an eviction) leaves a
//! language below its target, background spawns top it back up; in-flight
//! spawns are counted so concurrent acquirers don't overfill it. Shutdown
//! waits for every background spawn and destroy before returning.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::errors::{ExecutionError, SandboxError};
use crate::language::SupportedLanguage;
use crate::sandbox::{ContainerHandle, SandboxRuntime};

#[derive(Default)]
struct PoolState {
    idle: HashMap<SupportedLanguage, Vec<ContainerHandle>>,
    pending: HashMap<SupportedLanguage, usize>,
    /// Background spawns and destroys not yet finished.
    background: usize,
    closed: bool,
}

impl PoolState {
    fn idle_len(&self, language: SupportedLanguage) -> usize {
        self.idle.get(&language).map_or(0, Vec::len)
    }

    /// Reserve spawn slots for whatever `language` is short of `target`.
    fn reserve(&mut self, language: SupportedLanguage, target: usize) -> usize {
        if self.closed {
            return 0;
        }
        let pending = self.pending.get(&language).copied().unwrap_or(0);
        let deficit = target.saturating_sub(self.idle_len(language) + pending);
        if deficit > 0 {
            *self.pending.entry(language).or_insert(0) += deficit;
            self.background += deficit;
        }
        deficit
    }

    /// Push `handle` if there is room; hand it back otherwise.
    fn admit(&mut self, mut handle: ContainerHandle, max_size: usize) -> Option<ContainerHandle> {
        let language = handle.language();
        if self.closed || self.idle_len(language) >= max_size {
            return Some(handle);
        }
        handle.mark_idle();
        self.idle.entry(language).or_default().push(handle);
        None
    }
}

struct PoolInner {
    runtime: Arc<dyn SandboxRuntime>,
    max_size: usize,
    state: Mutex<PoolState>,
    settled: Notify,
}

/// Outcome of a warm-up pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmupReport {
    pub spawned: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

impl ContainerPool {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                max_size,
                state: Mutex::new(PoolState::default()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.inner.runtime
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Take an idle container, or spawn one if none is idle. Never waits for
    /// capacity.
    pub async fn acquire(&self, language: SupportedLanguage) -> Result<ContainerHandle, ExecutionError> {
        let popped = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(ExecutionError::ContainerUnavailable(
                    "container pool is shut down".to_string(),
                ));
            }
            state.idle.get_mut(&language).and_then(Vec::pop)
        };

        self.replenish(language).await;

        match popped {
            Some(handle) => {
                log::debug!("Acquired warm {} container {}", language, handle.id());
                Ok(handle)
            }
            None => {
                log::info!(
                    "No warm {} container available, spawning one ({})",
                    language,
                    self.inner.runtime.backend_name()
                );
                self.inner.runtime.spawn(language).await.map_err(|e| {
                    log::error!("Failed to spawn {} container: {}", language, e);
                    ExecutionError::ContainerUnavailable(e.to_string())
                })
            }
        }
    }

    /// Give back a container that is still healthy.
    pub async fn release(&self, handle: ContainerHandle) {
        let surplus = {
            let mut state = self.inner.state.lock().await;
            state.admit(handle, self.inner.max_size)
        };
        if let Some(handle) = surplus {
            log::debug!("Pool full or closed, destroying container {}", handle.id());
            self.destroy_in_background(handle).await;
        }
    }

    /// Throw away a container that can't be trusted any more (timed out,
    /// broken), then top the pool back up.
    pub async fn discard(&self, handle: ContainerHandle) {
        let language = handle.language();
        self.destroy(handle).await;
        self.replenish(language).await;
    }

    /// Fill every supported language up to `max_size` and wait for it.
    pub async fn warm_up(&self) -> WarmupReport {
        let mut slots = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            for language in SupportedLanguage::ALL {
                let reserved = state.reserve(language, self.inner.max_size);
                slots.extend(std::iter::repeat(language).take(reserved));
            }
        }

        log::info!(
            "Warming up {} containers ({})",
            slots.len(),
            self.inner.runtime.backend_name()
        );

        let results = join_all(slots.into_iter().map(|language| self.spawn_reserved(language))).await;

        let mut report = WarmupReport::default();
        for result in results {
            match result {
                Ok(()) => report.spawned += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }

    /// Destroy idle containers that have sat unused for longer than
    /// `max_idle` and replace them with fresh ones.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<ContainerHandle> = {
            let mut state = self.inner.state.lock().await;
            let mut expired = Vec::new();
            for handles in state.idle.values_mut() {
                let (stale, fresh): (Vec<_>, Vec<_>) =
                    handles.drain(..).partition(|h| h.idle_for() > max_idle);
                *handles = fresh;
                expired.extend(stale);
            }
            expired
        };

        let count = expired.len();
        if count == 0 {
            return 0;
        }

        log::info!("Evicting {} idle containers", count);
        let mut languages: Vec<SupportedLanguage> = expired.iter().map(|h| h.language()).collect();
        languages.sort();
        languages.dedup();

        join_all(expired.into_iter().map(|h| self.destroy(h))).await;
        for language in languages {
            self.replenish(language).await;
        }
        count
    }

    /// Close the pool and destroy every idle container, then wait for
    /// in-flight background spawns and destroys. Containers those spawns
    /// produce, and any released afterwards, are destroyed instead of pooled.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<ContainerHandle> = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            state.idle.drain().flat_map(|(_, handles)| handles).collect()
        };
        let count = drained.len();
        join_all(drained.into_iter().map(|h| self.destroy(h))).await;
        self.wait_for_background().await;
        log::info!(
            "Container pool ({}) shut down, {} idle containers destroyed",
            self.inner.runtime.backend_name(),
            count
        );
        count
    }

    pub async fn idle_count(&self, language: SupportedLanguage) -> usize {
        self.inner.state.lock().await.idle_len(language)
    }

    /// Background spawns and destroys still running.
    pub async fn background_count(&self) -> usize {
        self.inner.state.lock().await.background
    }

    pub async fn pending_count(&self, language: SupportedLanguage) -> usize {
        let state = self.inner.state.lock().await;
        state.pending.get(&language).copied().unwrap_or(0)
    }

    /// Idle containers per language, for health reporting.
    pub async fn snapshot(&self) -> BTreeMap<String, usize> {
        let state = self.inner.state.lock().await;
        SupportedLanguage::ALL
            .iter()
            .map(|language| (language.to_string(), state.idle_len(*language)))
            .collect()
    }

    async fn replenish(&self, language: SupportedLanguage) {
        let reserved = {
            let mut state = self.inner.state.lock().await;
            state.reserve(language, self.inner.max_size)
        };
        for _ in 0..reserved {
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.spawn_reserved(language).await {
                    log::warn!("Background {} container spawn failed: {}", language, e);
                }
            });
        }
    }

    /// Spawn into a slot previously taken with `reserve`.
    async fn spawn_reserved(&self, language: SupportedLanguage) -> Result<(), SandboxError> {
        let result = self.spawn_and_admit(language).await;
        self.finish_background().await;
        result
    }

    async fn spawn_and_admit(&self, language: SupportedLanguage) -> Result<(), SandboxError> {
        let result = self.inner.runtime.spawn(language).await;

        let surplus = {
            let mut state = self.inner.state.lock().await;
            if let Some(pending) = state.pending.get_mut(&language) {
                *pending = pending.saturating_sub(1);
            }
            match result {
                Ok(handle) => state.admit(handle, self.inner.max_size),
                Err(e) => return Err(e),
            }
        };

        if let Some(handle) = surplus {
            self.destroy(handle).await;
        }
        Ok(())
    }

    async fn destroy(&self, handle: ContainerHandle) {
        let id = handle.id().to_string();
        if let Err(e) = self.inner.runtime.destroy(handle).await {
            log::warn!("Failed to destroy container {}: {}", id, e);
        }
    }

    async fn destroy_in_background(&self, handle: ContainerHandle) {
        self.inner.state.lock().await.background += 1;
        let pool = self.clone();
        tokio::spawn(async move {
            pool.destroy(handle).await;
            pool.finish_background().await;
        });
    }

    async fn finish_background(&self) {
        let settled = {
            let mut state = self.inner.state.lock().await;
            state.background = state.background.saturating_sub(1);
            state.background == 0
        };
        if settled {
            self.inner.settled.notify_waiters();
        }
    }

    async fn wait_for_background(&self) {
        loop {
            // Created before the check so a notification in between isn't lost.
            let settled = self.inner.settled.notified();
            if self.inner.state.lock().await.background == 0 {
                return;
            }
            settled.await;
        }
    }
}
