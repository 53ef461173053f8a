//! Worker Manager: one external worker process per running clone.
//!
//! Per-clone lifecycle:
//!
//! ```text
//! starting --ready/heartbeat--> running --stop--> stopped
//!     |                            |
//!     +------error message---------+--heartbeat timeout--> error
//! ```
//!
//! The in-memory registry is rebuilt empty on every start. Each spawned
//! worker also gets a pid breadcrumb on disk so a later run can find and
//! terminate it if this process dies without cleaning up.

pub mod breadcrumb;
pub mod process;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clonesmith_common::protocol::env;
use clonesmith_common::{CloneRecord, CloneStatus, WorkerMessage, WorkerStatus};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{StoreError, WorkerError};
use crate::integrations::IntegrationStore;
use crate::store::{ClonePatch, StoreHandle};

pub use breadcrumb::Breadcrumbs;
pub use process::Termination;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub command: Vec<String>,
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    pub callback_url: String,
    pub breadcrumbs_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.worker.command.clone(),
            heartbeat_timeout: config.worker.heartbeat_timeout(),
            monitor_interval: config.worker.monitor_interval(),
            stop_grace: config.worker.stop_grace(),
            callback_url: config.callback_url(),
            breadcrumbs_dir: config.breadcrumbs_dir(),
            logs_dir: config.logs_dir(),
        }
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub clone_id: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { worker: WorkerSnapshot },
    OrphanStopped { pid: u32 },
    NotRunning,
}

/// Result of terminating one breadcrumb during a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweptOrphan {
    pub clone_id: String,
    pub pid: Option<u32>,
    pub terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct WorkerRecord {
    generation: u64,
    status: WorkerStatus,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    last_heartbeat: Instant,
    shutdown: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    fn snapshot(&self, clone_id: &str, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            clone_id: clone_id.to_string(),
            status: self.status,
            pid: self.pid,
            started_at: self.started_at,
            last_heartbeat_secs: now.saturating_duration_since(self.last_heartbeat).as_secs(),
        }
    }
}

struct Inner {
    store: StoreHandle,
    integrations: IntegrationStore,
    settings: WorkerSettings,
    breadcrumbs: Breadcrumbs,
    registry: Mutex<HashMap<String, WorkerRecord>>,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(store: StoreHandle, integrations: IntegrationStore, settings: WorkerSettings) -> Self {
        let breadcrumbs = Breadcrumbs::new(settings.breadcrumbs_dir.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                integrations,
                settings,
                breadcrumbs,
                registry: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.inner.settings
    }

    pub fn breadcrumbs(&self) -> &Breadcrumbs {
        &self.inner.breadcrumbs
    }

    /// Spawn a worker for a clone. Returns once the process exists; it does
    /// not wait for the worker to report ready.
    pub async fn start(&self, clone_id: &str) -> Result<WorkerSnapshot, WorkerError> {
        let clone = match self.inner.store.get_clone(clone_id).await {
            Ok(clone) => clone,
            Err(StoreError::NotFound { .. }) => {
                return Err(WorkerError::CloneNotFound(clone_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if clone.status == CloneStatus::Training {
            return Err(WorkerError::CloneNotTrained(clone_id.to_string()));
        }

        let generation = self.reserve(clone_id).await?;
        match self.launch(&clone, generation).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.release(clone_id, generation).await;
                Err(e)
            }
        }
    }

    /// Claim the registry slot so concurrent starts for one clone fail fast.
    async fn reserve(&self, clone_id: &str) -> Result<u64, WorkerError> {
        let mut registry = self.inner.registry.lock().await;
        if registry.contains_key(clone_id) {
            return Err(WorkerError::AlreadyRunning(clone_id.to_string()));
        }
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        registry.insert(
            clone_id.to_string(),
            WorkerRecord {
                generation,
                status: WorkerStatus::Starting,
                pid: None,
                started_at: Utc::now(),
                last_heartbeat: Instant::now(),
                shutdown: None,
                watcher: None,
            },
        );
        Ok(generation)
    }

    async fn release(&self, clone_id: &str, generation: u64) {
        let mut registry = self.inner.registry.lock().await;
        if registry
            .get(clone_id)
            .is_some_and(|record| record.generation == generation)
        {
            registry.remove(clone_id);
        }
    }

    async fn launch(&self, clone: &CloneRecord, generation: u64) -> Result<WorkerSnapshot, WorkerError> {
        let clone_id = clone.id.as_str();
        let settings = &self.inner.settings;

        self.terminate_orphan(clone_id).await?;

        let integrations = self.inner.integrations.get_integrations(clone_id).await?;
        let integrations_json = serde_json::to_string(&integrations)
            .map_err(|e| WorkerError::Other(e.into()))?;

        let (program, args) = settings.command.split_first().ok_or_else(|| {
            WorkerError::Other(anyhow::anyhow!("worker.command is empty"))
        })?;

        let (stdout, stderr) = self.open_log(clone_id)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env(env::CLONE_ID, clone_id)
            .env(env::MODEL_ID, &clone.model_id)
            .env(env::PERSONA, &clone.persona)
            .env(env::INTEGRATIONS, integrations_json)
            .env(env::CALLBACK_URL, &settings.callback_url)
            .env(env::API_KEY, &clone.api_key);
        if let Some(dir) = &clone.adapter_dir {
            cmd.env(env::ADAPTER_DIR, dir);
        }
        if let Some(dir) = &clone.rag_index_dir {
            cmd.env(env::RAG_INDEX_DIR, dir);
        }
        if let Some(prompt) = &clone.system_prompt {
            cmd.env(env::SYSTEM_PROMPT, prompt);
        }

        let child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            clone_id: clone_id.to_string(),
            source,
        })?;
        let pid = child.id();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (registered_tx, registered_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(
            self.clone(),
            clone_id.to_string(),
            generation,
            child,
            shutdown_rx,
            registered_rx,
        ));

        if let Some(pid) = pid
            && let Err(e) = self.inner.breadcrumbs.write(clone_id, pid)
        {
            drop(registered_tx);
            let _ = shutdown_tx.send(());
            let _ = watcher.await;
            return Err(WorkerError::Breadcrumb(e));
        }

        let snapshot = {
            let mut registry = self.inner.registry.lock().await;
            match registry.get_mut(clone_id) {
                Some(record) if record.generation == generation => {
                    record.pid = pid;
                    record.shutdown = Some(shutdown_tx);
                    record.watcher = Some(watcher);
                    record.snapshot(clone_id, Instant::now())
                }
                _ => {
                    drop(registry);
                    // Stopped while we were spawning.
                    drop(registered_tx);
                    let _ = shutdown_tx.send(());
                    let _ = watcher.await;
                    let _ = self.inner.breadcrumbs.remove(clone_id);
                    return Err(WorkerError::NotRegistered(clone_id.to_string()));
                }
            }
        };

        let marked = self
            .inner
            .store
            .update_clone(clone_id, ClonePatch::running(true))
            .await;
        // Exit cleanup may run from here on, even if the worker is already gone.
        let _ = registered_tx.send(());
        marked?;
        info!(clone_id, pid = ?pid, "Worker started");
        Ok(snapshot)
    }

    fn open_log(&self, clone_id: &str) -> Result<(Stdio, Stdio), WorkerError> {
        let dir = &self.inner.settings.logs_dir;
        let path = dir.join(format!("worker-{}.log", clone_id));
        let open = || -> std::io::Result<std::fs::File> {
            std::fs::create_dir_all(dir)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "=== worker starting at {} ===", Utc::now().to_rfc3339())?;
            Ok(file)
        };
        let file = open().map_err(|e| {
            WorkerError::Other(anyhow::anyhow!("Failed to open {}: {}", path.display(), e))
        })?;
        let err_file = file.try_clone().map_err(|e| {
            WorkerError::Other(anyhow::anyhow!("Failed to open {}: {}", path.display(), e))
        })?;
        Ok((Stdio::from(file), Stdio::from(err_file)))
    }

    /// Terminate a process left behind by a previous run, if the breadcrumb
    /// names one that is still alive.
    async fn terminate_orphan(&self, clone_id: &str) -> Result<Option<u32>, WorkerError> {
        let breadcrumbs = &self.inner.breadcrumbs;
        let Some(pid) = breadcrumbs.read(clone_id).map_err(WorkerError::Breadcrumb)? else {
            return Ok(None);
        };
        if !process::is_alive(pid) {
            debug!(clone_id, pid, "Removing stale breadcrumb");
            breadcrumbs.remove(clone_id).map_err(WorkerError::Breadcrumb)?;
            return Ok(None);
        }

        warn!(clone_id, pid, "Found orphaned worker from a previous run, terminating");
        match process::terminate_pid(pid, self.inner.settings.stop_grace).await {
            Ok(outcome) => {
                info!(clone_id, pid, outcome = ?outcome, "Orphaned worker terminated");
                breadcrumbs.remove(clone_id).map_err(WorkerError::Breadcrumb)?;
                Ok(Some(pid))
            }
            Err(e) => Err(WorkerError::Orphan {
                clone_id: clone_id.to_string(),
                pid,
                message: e.to_string(),
            }),
        }
    }

    /// Stop a clone's worker. Falls back to the breadcrumb when nothing is
    /// registered, so this also works for workers from a previous run.
    pub async fn stop(&self, clone_id: &str) -> Result<StopOutcome, WorkerError> {
        let record = self.inner.registry.lock().await.remove(clone_id);

        let outcome = match record {
            Some(mut record) => {
                let mut snapshot = record.snapshot(clone_id, Instant::now());
                if let Some(shutdown) = record.shutdown.take() {
                    let _ = shutdown.send(());
                }
                if let Some(watcher) = record.watcher.take()
                    && let Err(e) = watcher.await
                {
                    warn!(clone_id, error = %e, "Worker watcher panicked");
                }
                self.inner
                    .breadcrumbs
                    .remove(clone_id)
                    .map_err(WorkerError::Breadcrumb)?;
                snapshot.status = WorkerStatus::Stopped;
                info!(clone_id, pid = ?snapshot.pid, "Worker stopped");
                StopOutcome::Stopped { worker: snapshot }
            }
            None => match self.terminate_orphan(clone_id).await? {
                Some(pid) => StopOutcome::OrphanStopped { pid },
                None => StopOutcome::NotRunning,
            },
        };

        if !matches!(outcome, StopOutcome::NotRunning) {
            self.mark_not_running(clone_id).await;
        }
        Ok(outcome)
    }

    async fn mark_not_running(&self, clone_id: &str) {
        if let Err(e) = self
            .inner
            .store
            .update_clone(clone_id, ClonePatch::running(false))
            .await
        {
            warn!(clone_id, error = %e, "Failed to clear is_running");
        }
    }

    async fn mark_failed(&self, clone_id: &str) {
        if let Err(e) = self
            .inner
            .store
            .update_clone(clone_id, ClonePatch::status(CloneStatus::Failed))
            .await
        {
            warn!(clone_id, error = %e, "Failed to mark clone failed");
        }
    }

    /// Apply a liveness message from a worker.
    pub async fn handle_message(&self, message: &WorkerMessage) -> Result<WorkerStatus, WorkerError> {
        let clone_id = message.clone_id();
        let status = {
            let mut registry = self.inner.registry.lock().await;
            let record = registry
                .get_mut(clone_id)
                .ok_or_else(|| WorkerError::NotRegistered(clone_id.to_string()))?;

            match message {
                WorkerMessage::Ready { .. } | WorkerMessage::Heartbeat { .. } => {
                    record.last_heartbeat = Instant::now();
                    if record.status == WorkerStatus::Starting {
                        record.status = WorkerStatus::Running;
                        info!(clone_id, kind = message.kind(), "Worker is running");
                    }
                }
                WorkerMessage::Error { message: reason, .. } => {
                    record.status = WorkerStatus::Error;
                    error!(clone_id, reason = %reason, "Worker reported a fault");
                }
            }
            record.status
        };

        if matches!(message, WorkerMessage::Error { .. }) {
            self.mark_failed(clone_id).await;
        }
        Ok(status)
    }

    /// Mark every running worker whose last heartbeat is older than the
    /// timeout as `error`, and fail its clone. Processes are left alone.
    pub async fn check_heartbeats_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.inner.settings.heartbeat_timeout;
        let expired: Vec<(String, Duration)> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .iter_mut()
                .filter(|(_, record)| record.status == WorkerStatus::Running)
                .filter_map(|(clone_id, record)| {
                    let elapsed = now.saturating_duration_since(record.last_heartbeat);
                    if elapsed > timeout {
                        record.status = WorkerStatus::Error;
                        Some((clone_id.clone(), elapsed))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (clone_id, elapsed) in &expired {
            let err = WorkerError::HeartbeatTimeout {
                clone_id: clone_id.clone(),
                elapsed_secs: elapsed.as_secs(),
            };
            warn!(clone_id = %clone_id, "{}", err);
            self.mark_failed(clone_id).await;
        }
        expired.into_iter().map(|(clone_id, _)| clone_id).collect()
    }

    /// Run the heartbeat check on a fixed interval until aborted.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.settings.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.check_heartbeats_at(Instant::now()).await;
            }
        })
    }

    /// Terminate every live process named by a breadcrumb that this manager
    /// does not own, and remove those breadcrumbs.
    pub async fn sweep_orphans(&self) -> Result<Vec<SweptOrphan>, WorkerError> {
        let owned: Vec<String> = self.inner.registry.lock().await.keys().cloned().collect();
        let swept = sweep_breadcrumbs(&self.inner.breadcrumbs, self.inner.settings.stop_grace, &owned)
            .await
            .map_err(WorkerError::Breadcrumb)?;
        for orphan in swept.iter().filter(|o| o.terminated) {
            self.mark_not_running(&orphan.clone_id).await;
        }
        Ok(swept)
    }

    /// Stop every registered worker concurrently.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.registry.lock().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Stopping all workers");
        let handles: Vec<_> = ids
            .into_iter()
            .map(|clone_id| {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.stop(&clone_id).await {
                        error!(clone_id = %clone_id, error = %e, "Failed to stop worker");
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let registry = self.inner.registry.lock().await;
        let mut workers: Vec<WorkerSnapshot> = registry
            .iter()
            .map(|(clone_id, record)| record.snapshot(clone_id, now))
            .collect();
        workers.sort_by(|a, b| a.clone_id.cmp(&b.clone_id));
        workers
    }

    pub async fn status(&self, clone_id: &str) -> Option<WorkerStatus> {
        self.inner
            .registry
            .lock()
            .await
            .get(clone_id)
            .map(|record| record.status)
    }

    /// Cleanup after a worker exits on its own.
    async fn on_exit(&self, clone_id: &str, generation: u64) {
        let removed = {
            let mut registry = self.inner.registry.lock().await;
            if registry
                .get(clone_id)
                .is_some_and(|record| record.generation == generation)
            {
                registry.remove(clone_id);
                true
            } else {
                false
            }
        };
        // A mismatch means `stop` owns the cleanup.
        if !removed {
            return;
        }
        if let Err(e) = self.inner.breadcrumbs.remove(clone_id) {
            warn!(clone_id, error = %e, "Failed to remove breadcrumb");
        }
        self.mark_not_running(clone_id).await;
    }
}

/// Owns the child process: reaps it on natural exit, or terminates it when
/// asked to shut down.
///
/// Exit cleanup waits for `registered`, which `launch` fires once the
/// registry entry and the clone's `is_running` flag are in place. A dropped
/// sender means the launch failed and cleans up after itself.
async fn watch(
    manager: WorkerManager,
    clone_id: String,
    generation: u64,
    mut child: Child,
    shutdown: oneshot::Receiver<()>,
    registered: oneshot::Receiver<()>,
) {
    let grace = manager.inner.settings.stop_grace;
    let exited = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(clone_id = %clone_id, code = ?status.code(), "Worker exited"),
                Err(e) => error!(clone_id = %clone_id, error = %e, "Failed to wait on worker"),
            }
            true
        }
        _ = shutdown => {
            terminate_child(&clone_id, &mut child, grace).await;
            false
        }
    };
    if registered.await.is_err() {
        return;
    }
    if exited {
        manager.on_exit(&clone_id, generation).await;
    }
}

async fn terminate_child(clone_id: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id()
        && let Err(e) = process::send_signal(pid, libc::SIGTERM)
    {
        debug!(clone_id, pid, error = %e, "SIGTERM failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(clone_id, code = ?status.code(), "Worker exited after SIGTERM"),
        Ok(Err(e)) => warn!(clone_id, error = %e, "Failed to wait on worker"),
        Err(_) => {
            warn!(clone_id, grace_secs = grace.as_secs(), "Worker ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                error!(clone_id, error = %e, "Failed to kill worker");
            }
        }
    }
}

/// Terminate processes named by breadcrumbs and remove the breadcrumbs.
/// Clone ids in `skip` belong to live workers and are left untouched.
pub async fn sweep_breadcrumbs(
    breadcrumbs: &Breadcrumbs,
    grace: Duration,
    skip: &[String],
) -> std::io::Result<Vec<SweptOrphan>> {
    let mut swept = Vec::new();
    for (clone_id, pid) in breadcrumbs.list()? {
        if skip.contains(&clone_id) {
            continue;
        }
        let mut entry = SweptOrphan {
            clone_id: clone_id.clone(),
            pid,
            terminated: false,
            error: None,
        };
        if let Some(pid) = pid {
            match process::terminate_pid(pid, grace).await {
                Ok(Termination::NotRunning) => {}
                Ok(outcome) => {
                    warn!(clone_id = %clone_id, pid, outcome = ?outcome, "Terminated orphaned worker");
                    entry.terminated = true;
                }
                Err(e) => {
                    error!(clone_id = %clone_id, pid, error = %e, "Failed to terminate orphaned worker");
                    entry.error = Some(e.to_string());
                }
            }
        }
        if entry.error.is_none() {
            breadcrumbs.remove(&clone_id)?;
        }
        swept.push(entry);
    }
    Ok(swept)
}
