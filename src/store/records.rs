use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clonesmith_common::{CloneRecord, CloneStatus, Job, JobStatus, KnowledgeSource};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StoreError;
use crate::util::{new_api_key, new_id, read_json_opt, write_json_atomic};

pub const INTERRUPTED_BY_RESTART: &str = "Interrupted by server restart";

/// A record kind persisted as one `id -> record` JSON file.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + 'static {
    const KIND: &'static str;
    const FILE_NAME: &'static str;

    fn id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn touch(&mut self, now: DateTime<Utc>);
}

impl Record for Job {
    const KIND: &'static str = "Job";
    const FILE_NAME: &'static str = "jobs.json";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for CloneRecord {
    const KIND: &'static str = "Clone";
    const FILE_NAME: &'static str = "clones.json";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// In-memory map of one record kind plus a dirty flag for the flusher.
#[derive(Debug, Clone)]
pub struct Collection<T: Record> {
    items: BTreeMap<String, T>,
    dirty: bool,
}

impl<T: Record> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            dirty: false,
        }
    }
}

impl<T: Record> Collection<T> {
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(T::FILE_NAME);
        let items: BTreeMap<String, T> = read_json_opt(&path)?.unwrap_or_default();
        Ok(Self {
            items,
            dirty: false,
        })
    }

    pub fn save(&mut self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(T::FILE_NAME);
        write_json_atomic(&path, &self.items).map_err(|source| StoreError::Persist {
            path: path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }

    pub fn insert(&mut self, record: T) {
        self.items.insert(record.id().to_string(), record);
        self.dirty = true;
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    /// Look up, mutate and stamp a record. The closure's error aborts the
    /// update before anything is marked dirty.
    pub fn update<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut T) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let record = self.items.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })?;
        let result = f(record)?;
        record.touch(Utc::now());
        self.dirty = true;
        Ok(result)
    }

    /// Most recently created first.
    pub fn list(&self) -> Vec<T> {
        let mut records: Vec<T> = self.items.values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Fields needed to open a training run.
#[derive(Debug, Clone)]
pub struct NewTraining {
    pub name: String,
    pub model_id: String,
    pub dataset_path: PathBuf,
    pub persona: String,
    pub system_prompt: Option<String>,
}

/// Partial job update. Only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub processed_dir: Option<PathBuf>,
    pub knowledge_file: Option<PathBuf>,
    pub rag_index_dir: Option<PathBuf>,
    pub adapter_dir: Option<PathBuf>,
    pub knowledge_count: Option<usize>,
    pub knowledge_sources: Option<Vec<KnowledgeSource>>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Partial clone update. Only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct ClonePatch {
    pub status: Option<CloneStatus>,
    pub is_running: Option<bool>,
    pub adapter_dir: Option<PathBuf>,
    pub rag_index_dir: Option<PathBuf>,
    pub knowledge_count: Option<usize>,
    pub knowledge_sources: Option<Vec<KnowledgeSource>>,
    pub integrations: Option<Vec<String>>,
}

impl ClonePatch {
    pub fn status(status: CloneStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn running(is_running: bool) -> Self {
        Self {
            is_running: Some(is_running),
            ..Default::default()
        }
    }
}

/// What `sanitize` changed after a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub interrupted_jobs: Vec<String>,
    pub failed_clones: Vec<String>,
    pub stopped_clones: Vec<String>,
}

impl SanitizeReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted_jobs.is_empty()
            && self.failed_clones.is_empty()
            && self.stopped_clones.is_empty()
    }
}

/// All job and clone records. Owned by exactly one task at runtime.
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub jobs: Collection<Job>,
    pub clones: Collection<CloneRecord>,
}

impl Records {
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            jobs: Collection::load(dir)?,
            clones: Collection::load(dir)?,
        })
    }

    /// Write every dirty collection to `dir`.
    pub fn save(&mut self, dir: &Path) -> Result<(), StoreError> {
        if self.jobs.is_dirty() {
            self.jobs.save(dir)?;
        }
        if self.clones.is_dirty() {
            self.clones.save(dir)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.jobs.is_dirty() || self.clones.is_dirty()
    }

    /// Create a queued job and its training clone, linked both ways.
    pub fn create_training(&mut self, params: NewTraining) -> (Job, CloneRecord) {
        let now = Utc::now();
        let job_id = new_id();
        let clone_id = new_id();

        let job = Job {
            id: job_id.clone(),
            status: JobStatus::Queued,
            model_id: params.model_id.clone(),
            dataset_path: params.dataset_path,
            system_prompt: params.system_prompt.clone(),
            persona: params.persona.clone(),
            clone_id: Some(clone_id.clone()),
            processed_dir: None,
            knowledge_file: None,
            rag_index_dir: None,
            adapter_dir: None,
            knowledge_count: 0,
            knowledge_sources: Vec::new(),
            logs: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        };

        let clone = CloneRecord {
            id: clone_id,
            name: params.name,
            status: CloneStatus::Training,
            is_running: false,
            job_id: Some(job_id),
            api_key: new_api_key(),
            model_id: params.model_id,
            persona: params.persona,
            system_prompt: params.system_prompt,
            adapter_dir: None,
            rag_index_dir: None,
            knowledge_count: 0,
            knowledge_sources: Vec::new(),
            integrations: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.jobs.insert(job.clone());
        self.clones.insert(clone.clone());
        (job, clone)
    }

    /// Apply a partial job update.
    ///
    /// A status equal to the current one is ignored; any other status must
    /// be a legal forward move or the whole patch is rejected.
    pub fn update_job(&mut self, id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        self.jobs.update(id, |job| {
            if let Some(next) = patch.status
                && next != job.status
            {
                if !job.status.can_transition_to(next) {
                    return Err(StoreError::InvalidTransition {
                        id: job.id.clone(),
                        from: job.status,
                        to: next,
                    });
                }
                job.status = next;
            }
            if let Some(dir) = patch.processed_dir {
                job.processed_dir = Some(dir);
            }
            if let Some(file) = patch.knowledge_file {
                job.knowledge_file = Some(file);
            }
            if let Some(dir) = patch.rag_index_dir {
                job.rag_index_dir = Some(dir);
            }
            if let Some(dir) = patch.adapter_dir {
                job.adapter_dir = Some(dir);
            }
            if let Some(count) = patch.knowledge_count {
                job.knowledge_count = count;
            }
            if let Some(sources) = patch.knowledge_sources {
                job.knowledge_sources = sources;
            }
            if let Some(error) = patch.error {
                job.error = Some(error);
            }
            Ok(job.clone())
        })
    }

    pub fn update_clone(&mut self, id: &str, patch: ClonePatch) -> Result<CloneRecord, StoreError> {
        self.clones.update(id, |clone| {
            if let Some(status) = patch.status {
                clone.status = status;
            }
            if let Some(is_running) = patch.is_running {
                clone.is_running = is_running;
            }
            if let Some(dir) = patch.adapter_dir {
                clone.adapter_dir = Some(dir);
            }
            if let Some(dir) = patch.rag_index_dir {
                clone.rag_index_dir = Some(dir);
            }
            if let Some(count) = patch.knowledge_count {
                clone.knowledge_count = count;
            }
            if let Some(sources) = patch.knowledge_sources {
                clone.knowledge_sources = sources;
            }
            if let Some(integrations) = patch.integrations {
                clone.integrations = integrations;
            }
            Ok(clone.clone())
        })
    }

    pub fn append_log(&mut self, id: &str, line: impl Into<String>) -> Result<(), StoreError> {
        let line = line.into();
        self.jobs.update(id, move |job| {
            job.logs.push(line);
            Ok(())
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::job_not_found(id))
    }

    pub fn get_clone(&self, id: &str) -> Result<CloneRecord, StoreError> {
        self.clones
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::clone_not_found(id))
    }

    /// Repair state that cannot be true after a restart.
    ///
    /// Jobs still queued or running have no pipeline left to finish them and
    /// are failed. No worker survives in memory, so every clone is marked not
    /// running. A clone still training whose job is failed or missing is
    /// failed with it.
    pub fn sanitize(&mut self) -> SanitizeReport {
        let mut report = SanitizeReport::default();
        let now = Utc::now();

        let mut jobs_changed = false;
        for job in self.jobs.values_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(INTERRUPTED_BY_RESTART.to_string());
                job.logs.push(format!("[orchestrator] {}", INTERRUPTED_BY_RESTART));
                job.touch(now);
                report.interrupted_jobs.push(job.id.clone());
                jobs_changed = true;
            }
        }
        if jobs_changed {
            self.jobs.mark_dirty();
        }

        let failed_jobs: Vec<String> = self
            .jobs
            .items
            .values()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| job.id.clone())
            .collect();

        let mut clones_changed = false;
        for clone in self.clones.items.values_mut() {
            if clone.is_running {
                clone.is_running = false;
                clone.touch(now);
                report.stopped_clones.push(clone.id.clone());
                clones_changed = true;
            }
            if clone.status == CloneStatus::Training {
                let job_alive = clone
                    .job_id
                    .as_deref()
                    .map(|job_id| {
                        self.jobs.items.contains_key(job_id)
                            && !failed_jobs.iter().any(|failed| failed == job_id)
                    })
                    .unwrap_or(false);
                if !job_alive {
                    clone.status = CloneStatus::Failed;
                    clone.touch(now);
                    report.failed_clones.push(clone.id.clone());
                    clones_changed = true;
                }
            }
        }
        if clones_changed {
            self.clones.mark_dirty();
        }

        report
    }
}
