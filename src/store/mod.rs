//! Record Store: job and clone records behind a single owning task.
//!
//! `StoreHandle` is a cheap cloneable sender. Every read and mutation is a
//! closure shipped to the owning task and run against `Records`, so callers
//! never hold a lock. Mutations mark collections dirty; the task flushes
//! dirty collections once the debounce window after the first unflushed
//! mutation has passed. `force_save` flushes immediately.

mod records;

pub use records::{
    ClonePatch, Collection, INTERRUPTED_BY_RESTART, JobPatch, NewTraining, Record, Records,
    SanitizeReport,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clonesmith_common::{CloneRecord, Job};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::StoreError;

type StoreFn = Box<dyn FnOnce(&mut Records) + Send>;

enum Command {
    Call(StoreFn),
    Flush(oneshot::Sender<Result<(), StoreError>>),
    Shutdown(oneshot::Sender<Result<(), StoreError>>),
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Command>,
    flushes: Arc<AtomicU64>,
}

impl StoreHandle {
    /// Load records from `dir`, sanitize them, persist any repairs and start
    /// the owning task.
    pub async fn open(
        dir: &Path,
        debounce: Duration,
    ) -> Result<(Self, JoinHandle<()>, SanitizeReport), StoreError> {
        let dir = dir.to_path_buf();
        let (records, report) = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || -> Result<(Records, SanitizeReport), StoreError> {
                std::fs::create_dir_all(&dir).map_err(|e| StoreError::Persist {
                    path: dir.clone(),
                    source: e.into(),
                })?;
                let mut records = Records::load(&dir)?;
                let report = records.sanitize();
                records.save(&dir)?;
                Ok((records, report))
            }
        })
        .await
        .map_err(|e| StoreError::Other(anyhow::anyhow!("Store load task panicked: {}", e)))??;

        if !report.is_empty() {
            warn!(
                interrupted_jobs = report.interrupted_jobs.len(),
                failed_clones = report.failed_clones.len(),
                stopped_clones = report.stopped_clones.len(),
                "Sanitized records left over from a previous run"
            );
        }
        info!(
            jobs = records.jobs.len(),
            clones = records.clones.len(),
            dir = %dir.display(),
            "Record store loaded"
        );

        let (handle, task) = Self::spawn(records, dir, debounce);
        Ok((handle, task, report))
    }

    /// Start the owning task over already-loaded records.
    pub fn spawn(records: Records, dir: PathBuf, debounce: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flushes = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(records, dir, debounce, rx, flushes.clone()));
        (Self { tx, flushes }, task)
    }

    /// Run a closure against the records on the owning task.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Records) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Call(Box::new(move |records| {
            let _ = reply_tx.send(f(records));
        }));
        self.tx.send(command).map_err(|_| StoreError::Unavailable)?;
        reply_rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Flush now, bypassing the debounce window.
    pub async fn force_save(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .map_err(|_| StoreError::Unavailable)?;
        reply_rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Flush and stop the owning task. Later calls fail with `Unavailable`.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply_tx))
            .map_err(|_| StoreError::Unavailable)?;
        reply_rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Number of completed flushes, debounced or forced.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        let id = id.to_string();
        self.call(move |records| records.get_job(&id)).await
    }

    pub async fn get_clone(&self, id: &str) -> Result<CloneRecord, StoreError> {
        let id = id.to_string();
        self.call(move |records| records.get_clone(&id)).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.call(|records| Ok(records.jobs.list())).await
    }

    pub async fn list_clones(&self) -> Result<Vec<CloneRecord>, StoreError> {
        self.call(|records| Ok(records.clones.list())).await
    }

    pub async fn create_training(
        &self,
        params: NewTraining,
    ) -> Result<(Job, CloneRecord), StoreError> {
        self.call(move |records| Ok(records.create_training(params)))
            .await
    }

    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        let id = id.to_string();
        self.call(move |records| records.update_job(&id, patch)).await
    }

    pub async fn update_clone(
        &self,
        id: &str,
        patch: ClonePatch,
    ) -> Result<CloneRecord, StoreError> {
        let id = id.to_string();
        self.call(move |records| records.update_clone(&id, patch))
            .await
    }

    pub async fn append_log(&self, id: &str, line: impl Into<String>) -> Result<(), StoreError> {
        let id = id.to_string();
        let line = line.into();
        self.call(move |records| records.append_log(&id, line))
            .await
    }
}

async fn run(
    mut records: Records,
    dir: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<Command>,
    flushes: Arc<AtomicU64>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Call(f)) => {
                    f(&mut records);
                    if records.is_dirty() && deadline.is_none() {
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Some(Command::Flush(reply)) => {
                    let result = flush(&mut records, &dir, &flushes);
                    deadline = None;
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown(reply)) => {
                    let result = flush(&mut records, &dir, &flushes);
                    let _ = reply.send(result);
                    debug!("Record store stopped");
                    return;
                }
                None => break,
            },
            _ = wait_until(deadline), if deadline.is_some() => {
                deadline = None;
                if let Err(e) = flush(&mut records, &dir, &flushes) {
                    error!(error = %e, "Debounced record flush failed, retrying");
                    deadline = Some(Instant::now() + debounce);
                }
            }
        }
    }

    if let Err(e) = flush(&mut records, &dir, &flushes) {
        error!(error = %e, "Final record flush failed");
    }
}

fn flush(records: &mut Records, dir: &Path, flushes: &AtomicU64) -> Result<(), StoreError> {
    if !records.is_dirty() {
        return Ok(());
    }
    records.save(dir)?;
    flushes.fetch_add(1, Ordering::Relaxed);
    debug!(dir = %dir.display(), "Flushed records");
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
