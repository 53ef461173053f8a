//! Pipeline Runner: drives one training job through its external stages.
//!
//! Stages run strictly in sequence:
//!
//! 1. dataset parsing (fatal on failure)
//! 2. knowledge indexing, only when parsing produced knowledge (non-fatal)
//! 3. model adaptation (fatal on failure)
//!
//! `submit` returns as soon as the job and clone records are durable; the
//! stages run on a detached task. Every submission mints a fresh job id, so
//! a job is driven by exactly one runner invocation.

pub mod knowledge;
pub mod stage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clonesmith_common::{CloneStatus, JobStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::PipelineError;
use crate::store::{ClonePatch, JobPatch, NewTraining, StoreHandle};
use crate::util::is_safe_id;

pub use knowledge::KnowledgeSummary;
pub use stage::{Stage, StageCommand};

const KNOWLEDGE_FILE: &str = "knowledge.jsonl";
const TRAIN_FILE: &str = "train.jsonl";
const EVAL_FILE: &str = "eval.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub dataset_id: String,
    pub model_id: String,
    pub persona: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Display name for the clone; defaults to the persona.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub clone_id: String,
}

/// Stage commands and directory layout, resolved from config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub uploads_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub parse_command: Vec<String>,
    pub index_command: Vec<String>,
    pub adapt_command: Vec<String>,
    pub output_format: String,
    pub eval_split: f64,
    pub working_dir: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            uploads_dir: config.uploads_dir(),
            jobs_dir: config.jobs_dir(),
            parse_command: config.pipeline.parse_command.clone(),
            index_command: config.pipeline.index_command.clone(),
            adapt_command: config.pipeline.adapt_command.clone(),
            output_format: config.pipeline.output_format.clone(),
            eval_split: config.pipeline.eval_split,
            working_dir: config.pipeline.working_dir.clone(),
        }
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.uploads_dir.join(dataset_id)
    }

    pub fn job_layout(&self, job_id: &str) -> JobLayout {
        let root = self.jobs_dir.join(job_id);
        let processed = root.join("processed");
        JobLayout {
            knowledge_file: processed.join(KNOWLEDGE_FILE),
            train_file: processed.join(TRAIN_FILE),
            eval_file: processed.join(EVAL_FILE),
            processed_dir: processed,
            rag_index_dir: root.join("rag_index"),
            adapter_dir: root.join("adapter"),
            checkpoints_dir: root.join("checkpoints"),
            root,
        }
    }

    pub fn parse_command(
        &self,
        dataset_dir: &Path,
        layout: &JobLayout,
        persona: &str,
    ) -> Result<StageCommand, PipelineError> {
        StageCommand::new(
            Stage::Parse,
            &self.parse_command,
            vec![
                "--inputs".into(),
                path_arg(dataset_dir),
                "--output-dir".into(),
                path_arg(&layout.processed_dir),
                "--persona".into(),
                persona.to_string(),
                "--format".into(),
                self.output_format.clone(),
                "--eval-split".into(),
                self.eval_split.to_string(),
            ],
            self.working_dir.clone(),
        )
    }

    pub fn index_command(&self, layout: &JobLayout) -> Result<StageCommand, PipelineError> {
        StageCommand::new(
            Stage::Index,
            &self.index_command,
            vec![
                "--knowledge-file".into(),
                path_arg(&layout.knowledge_file),
                "--output-dir".into(),
                path_arg(&layout.rag_index_dir),
            ],
            self.working_dir.clone(),
        )
    }

    pub fn adapt_command(
        &self,
        layout: &JobLayout,
        request: &TrainingRequest,
    ) -> Result<StageCommand, PipelineError> {
        let mut args = vec![
            "--train-file".into(),
            path_arg(&layout.train_file),
            "--eval-file".into(),
            path_arg(&layout.eval_file),
            "--model-id".into(),
            request.model_id.clone(),
            "--adapter-dir".into(),
            path_arg(&layout.adapter_dir),
            "--output-dir".into(),
            path_arg(&layout.checkpoints_dir),
            "--persona-name".into(),
            request.persona.clone(),
        ];
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            args.push("--system-prompt".into());
            args.push(prompt.to_string());
        }
        StageCommand::new(Stage::Adapt, &self.adapt_command, args, self.working_dir.clone())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Per-job artifact paths.
#[derive(Debug, Clone)]
pub struct JobLayout {
    pub root: PathBuf,
    pub processed_dir: PathBuf,
    pub knowledge_file: PathBuf,
    pub train_file: PathBuf,
    pub eval_file: PathBuf,
    pub rag_index_dir: PathBuf,
    pub adapter_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
}

#[derive(Clone)]
pub struct PipelineRunner {
    store: StoreHandle,
    settings: Arc<PipelineSettings>,
}

impl PipelineRunner {
    pub fn new(store: StoreHandle, settings: PipelineSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Check a request before any record exists.
    pub async fn validate(&self, request: &TrainingRequest) -> Result<PathBuf, PipelineError> {
        let dataset_id = request.dataset_id.trim();
        if dataset_id.is_empty() {
            return Err(PipelineError::Validation("dataset_id is required".into()));
        }
        if !is_safe_id(dataset_id) {
            return Err(PipelineError::Validation(format!(
                "dataset_id '{}' may only contain letters, digits, '_', '-' and '.'",
                dataset_id
            )));
        }
        if request.model_id.trim().is_empty() {
            return Err(PipelineError::Validation("model_id is required".into()));
        }
        if request.persona.trim().is_empty() {
            return Err(PipelineError::Validation("persona is required".into()));
        }

        let dataset_dir = self.settings.dataset_dir(dataset_id);
        let dir = dataset_dir.clone();
        let has_files = tokio::task::spawn_blocking(move || {
            dir.is_dir()
                && walkdir::WalkDir::new(&dir)
                    .into_iter()
                    .filter_map(Result::ok)
                    .any(|entry| entry.file_type().is_file())
        })
        .await
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("Dataset scan panicked: {}", e)))?;

        if !has_files {
            return Err(PipelineError::Validation(format!(
                "dataset '{}' has no uploaded files",
                dataset_id
            )));
        }
        Ok(dataset_dir)
    }

    /// Create the job and clone, persist them, and start the pipeline in the
    /// background.
    pub async fn submit(&self, request: TrainingRequest) -> Result<Submission, PipelineError> {
        let dataset_dir = self.validate(&request).await?;
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(request.persona.trim())
            .to_string();

        let (job, clone) = self
            .store
            .create_training(NewTraining {
                name,
                model_id: request.model_id.trim().to_string(),
                dataset_path: dataset_dir,
                persona: request.persona.trim().to_string(),
                system_prompt: request.system_prompt.clone(),
            })
            .await?;
        self.store.force_save().await?;

        info!(job_id = %job.id, clone_id = %clone.id, dataset_id = %request.dataset_id, "Training job queued");

        let runner = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            runner.run_pipeline(&job_id, request).await;
        });

        Ok(Submission {
            job_id: job.id,
            clone_id: clone.id,
        })
    }

    /// Drive a job to a terminal state. Failures are recorded on the job and
    /// its clone, never returned.
    pub async fn run_pipeline(&self, job_id: &str, request: TrainingRequest) {
        let clone_id = match self.store.get_job(job_id).await {
            Ok(job) => job.clone_id,
            Err(e) => {
                error!(job_id, error = %e, "Cannot run pipeline for unknown job");
                return;
            }
        };

        match self.execute(job_id, clone_id.as_deref(), &request).await {
            Ok(()) => info!(job_id, "Pipeline succeeded"),
            Err(e) => {
                error!(job_id, error = %e, "Pipeline failed");
                self.record_failure(job_id, clone_id.as_deref(), &e).await;
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        clone_id: Option<&str>,
        request: &TrainingRequest,
    ) -> Result<(), PipelineError> {
        self.store
            .update_job(job_id, JobPatch::status(JobStatus::Running))
            .await?;

        let settings = &self.settings;
        let dataset_dir = settings.dataset_dir(request.dataset_id.trim());
        let layout = settings.job_layout(job_id);
        tokio::fs::create_dir_all(&layout.processed_dir)
            .await
            .map_err(|e| {
                PipelineError::Other(anyhow::anyhow!(
                    "Failed to create {}: {}",
                    layout.processed_dir.display(),
                    e
                ))
            })?;

        self.store
            .update_job(
                job_id,
                JobPatch {
                    processed_dir: Some(layout.processed_dir.clone()),
                    knowledge_file: Some(layout.knowledge_file.clone()),
                    ..Default::default()
                },
            )
            .await?;

        // Stage 1
        let parse = settings.parse_command(&dataset_dir, &layout, &request.persona)?;
        stage::run_stage(&self.store, job_id, &parse).await?;

        let summary = {
            let file = layout.knowledge_file.clone();
            let dir = dataset_dir.clone();
            tokio::task::spawn_blocking(move || knowledge::summarize(&file, &dir))
                .await
                .map_err(|e| PipelineError::Other(anyhow::anyhow!("Knowledge scan panicked: {}", e)))??
        };
        self.record_knowledge(job_id, clone_id, &summary).await?;

        // Stage 2
        let mut rag_index_dir = None;
        if summary.count > 0 {
            let index = settings.index_command(&layout)?;
            match stage::run_stage(&self.store, job_id, &index).await {
                Ok(()) => {
                    self.store
                        .update_job(
                            job_id,
                            JobPatch {
                                rag_index_dir: Some(layout.rag_index_dir.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    rag_index_dir = Some(layout.rag_index_dir.clone());
                }
                Err(e) => {
                    warn!(job_id, error = %e, "Knowledge indexing failed, continuing without an index");
                    self.store
                        .append_log(
                            job_id,
                            format!("[orchestrator] {}; continuing without a retrieval index", e),
                        )
                        .await?;
                }
            }
        } else {
            self.store
                .append_log(
                    job_id,
                    "[orchestrator] No knowledge chunks produced; skipping knowledge indexing",
                )
                .await?;
        }

        // Stage 3
        let adapt = settings.adapt_command(&layout, request)?;
        stage::run_stage(&self.store, job_id, &adapt).await?;

        self.store
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Succeeded),
                    adapter_dir: Some(layout.adapter_dir.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .append_log(job_id, "[orchestrator] Training complete")
            .await?;

        if let Some(clone_id) = clone_id {
            self.store
                .update_clone(
                    clone_id,
                    ClonePatch {
                        status: Some(CloneStatus::Ready),
                        adapter_dir: Some(layout.adapter_dir.clone()),
                        rag_index_dir,
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn record_knowledge(
        &self,
        job_id: &str,
        clone_id: Option<&str>,
        summary: &KnowledgeSummary,
    ) -> Result<(), PipelineError> {
        self.store
            .update_job(
                job_id,
                JobPatch {
                    knowledge_count: Some(summary.count),
                    knowledge_sources: Some(summary.sources.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let mut line = format!(
            "[orchestrator] Parsed {} knowledge chunks from {} sources",
            summary.count,
            summary.sources.len()
        );
        if summary.skipped > 0 {
            line.push_str(&format!(" ({} malformed lines skipped)", summary.skipped));
        }
        self.store.append_log(job_id, line).await?;

        if let Some(clone_id) = clone_id {
            self.store
                .update_clone(
                    clone_id,
                    ClonePatch {
                        knowledge_count: Some(summary.count),
                        knowledge_sources: Some(summary.sources.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn record_failure(&self, job_id: &str, clone_id: Option<&str>, err: &PipelineError) {
        let message = err.to_string();
        if let Err(e) = self
            .store
            .append_log(job_id, format!("[orchestrator] {}", message))
            .await
        {
            warn!(job_id, error = %e, "Failed to log pipeline failure");
        }
        if let Err(e) = self.store.update_job(job_id, JobPatch::failed(message)).await {
            error!(job_id, error = %e, "Failed to mark job failed");
        }
        if let Some(clone_id) = clone_id
            && let Err(e) = self
                .store
                .update_clone(clone_id, ClonePatch::status(CloneStatus::Failed))
                .await
        {
            error!(job_id, clone_id, error = %e, "Failed to mark clone failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Records;
    use clonesmith_common::Job;
    use std::time::Duration;
    use tempfile::TempDir;

    const ARGS_PARSER: &str = r#"
out=""; adapter=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-dir) out="$2"; shift 2 ;;
    --adapter-dir) adapter="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

    struct Fixture {
        dir: TempDir,
        store: StoreHandle,
        runner: PipelineRunner,
    }

    impl Fixture {
        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls"))
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }
    }

    /// Write a stage script that records its invocation then runs `body`.
    fn script(dir: &Path, name: &str, body: &str) -> Vec<String> {
        let path = dir.join(format!("{}.sh", name));
        let calls = dir.join("calls");
        let text = format!(
            "#!/bin/sh\n{}\necho {} >> '{}'\n{}\n",
            ARGS_PARSER,
            name,
            calls.display(),
            body
        );
        std::fs::write(&path, text).unwrap();
        vec!["sh".to_string(), path.to_string_lossy().into_owned()]
    }

    fn parse_ok(chunks_per_file: usize) -> String {
        format!(
            r#"mkdir -p "$out"
echo "parsing dataset"
: > "$out/train.jsonl"; : > "$out/eval.jsonl"
for f in a.txt b.txt c.txt; do
  i=0
  while [ $i -lt {n} ]; do
    echo "{{\"chunk_id\":\"$f-$i\",\"source\":\"$f\",\"content\":\"x\"}}" >> "$out/knowledge.jsonl"
    i=$((i+1))
  done
done"#,
            n = chunks_per_file
        )
    }

    const INDEX_OK: &str = r#"mkdir -p "$out"; echo indexed"#;
    const ADAPT_OK: &str = r#"mkdir -p "$adapter"; echo weights > "$adapter/adapter.bin"; echo "epoch 1/1""#;

    async fn fixture(parse: &str, index: &str, adapt: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let dataset = dir.path().join("uploads").join("d1");
        std::fs::create_dir_all(&dataset).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(dataset.join(name), "some personal notes").unwrap();
        }

        let settings = PipelineSettings {
            uploads_dir: dir.path().join("uploads"),
            jobs_dir: dir.path().join("jobs"),
            parse_command: script(dir.path(), "parse", parse),
            index_command: script(dir.path(), "index", index),
            adapt_command: script(dir.path(), "adapt", adapt),
            output_format: "huggingface".into(),
            eval_split: 0.1,
            working_dir: None,
        };
        let (store, _task) = StoreHandle::spawn(
            Records::default(),
            dir.path().join("records"),
            Duration::from_millis(20),
        );
        let runner = PipelineRunner::new(store.clone(), settings);
        Fixture { dir, store, runner }
    }

    fn request() -> TrainingRequest {
        TrainingRequest {
            dataset_id: "d1".into(),
            model_id: "mistral-7b".into(),
            persona: "Ada".into(),
            system_prompt: Some("Stay in character.".into()),
            name: None,
        }
    }

    async fn wait_terminal(store: &StoreHandle, job_id: &str) -> Job {
        for _ in 0..500 {
            let job = store.get_job(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never finished", job_id);
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let fx = fixture(&parse_ok(4), INDEX_OK, ADAPT_OK).await;
        let submission = fx.runner.submit(request()).await.unwrap();

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded, "logs: {:?}", job.logs);
        assert!(job.error.is_none());
        assert!(job.processed_dir.is_some());
        assert!(job.knowledge_file.is_some());
        assert!(job.rag_index_dir.is_some());
        assert!(job.adapter_dir.as_ref().unwrap().join("adapter.bin").exists());
        assert_eq!(job.knowledge_count, 12);
        assert!(job.logs.contains(&"[parse] parsing dataset".to_string()));
        assert!(job.logs.contains(&"[adapt] epoch 1/1".to_string()));

        let clone = fx.store.get_clone(&submission.clone_id).await.unwrap();
        assert_eq!(clone.status, CloneStatus::Ready);
        assert_eq!(clone.knowledge_count, 12);
        assert_eq!(clone.knowledge_sources.len(), 3);
        assert!(clone.knowledge_sources.iter().all(|s| s.chunks == 4));
        assert!(clone.knowledge_sources.iter().all(|s| s.size_bytes == Some(19)));
        assert_eq!(clone.adapter_dir, job.adapter_dir);
        assert_eq!(clone.rag_index_dir, job.rag_index_dir);
        assert_eq!(clone.name, "Ada");

        assert_eq!(fx.calls(), vec!["parse", "index", "adapt"]);
    }

    #[tokio::test]
    async fn test_adaptation_failure_fails_job_and_clone() {
        let fx = fixture(&parse_ok(4), INDEX_OK, "echo 'CUDA out of memory' >&2; exit 1").await;
        let submission = fx.runner.submit(request()).await.unwrap();

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.contains("model adaptation"), "{}", error);
        assert!(error.contains("code 1"), "{}", error);
        assert!(job.logs.contains(&"[adapt:stderr] CUDA out of memory".to_string()));

        let clone = fx.store.get_clone(&submission.clone_id).await.unwrap();
        assert_eq!(clone.status, CloneStatus::Failed);
    }

    #[tokio::test]
    async fn test_parse_failure_skips_remaining_stages() {
        let fx = fixture("echo 'no parser for .xyz'; exit 2", INDEX_OK, ADAPT_OK).await;
        let submission = fx.runner.submit(request()).await.unwrap();

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("dataset parsing"));
        assert!(job.adapter_dir.is_none());
        assert_eq!(fx.calls(), vec!["parse"]);

        let clone = fx.store.get_clone(&submission.clone_id).await.unwrap();
        assert_eq!(clone.status, CloneStatus::Failed);
    }

    #[tokio::test]
    async fn test_index_failure_is_not_fatal() {
        let fx = fixture(&parse_ok(2), "echo 'faiss missing' >&2; exit 1", ADAPT_OK).await;
        let submission = fx.runner.submit(request()).await.unwrap();

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded, "logs: {:?}", job.logs);
        assert!(job.rag_index_dir.is_none());
        assert!(job.logs.iter().any(|l| l.contains("continuing without a retrieval index")));
        assert_eq!(fx.calls(), vec!["parse", "index", "adapt"]);

        let clone = fx.store.get_clone(&submission.clone_id).await.unwrap();
        assert_eq!(clone.status, CloneStatus::Ready);
        assert!(clone.rag_index_dir.is_none());
        assert!(clone.adapter_dir.is_some());
    }

    #[tokio::test]
    async fn test_no_knowledge_skips_indexing() {
        let fx = fixture(r#"mkdir -p "$out"; echo "no knowledge docs""#, INDEX_OK, ADAPT_OK).await;
        let submission = fx.runner.submit(request()).await.unwrap();

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.knowledge_count, 0);
        assert!(job.rag_index_dir.is_none());
        assert_eq!(fx.calls(), vec!["parse", "adapt"]);
    }

    #[tokio::test]
    async fn test_submit_returns_before_stages_finish() {
        let fx = fixture(
            r#"mkdir -p "$out"; echo "step one"; sleep 2; echo "step two""#,
            INDEX_OK,
            ADAPT_OK,
        )
        .await;
        let submission = fx.runner.submit(request()).await.unwrap();

        // Durable before the caller hears about it.
        let on_disk = std::fs::read_to_string(fx.dir.path().join("records").join("jobs.json")).unwrap();
        assert!(on_disk.contains(&submission.job_id));

        // Output shows up mid-stage.
        let mut seen = false;
        for _ in 0..100 {
            let job = fx.store.get_job(&submission.job_id).await.unwrap();
            if job.logs.contains(&"[parse] step one".to_string()) {
                assert_eq!(job.status, JobStatus::Running);
                assert!(!job.logs.contains(&"[parse] step two".to_string()));
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "first line never streamed");

        let job = wait_terminal(&fx.store, &submission.job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_each_submission_gets_its_own_job() {
        let fx = fixture(&parse_ok(1), INDEX_OK, ADAPT_OK).await;
        let first = fx.runner.submit(request()).await.unwrap();
        let second = fx.runner.submit(request()).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_ne!(first.clone_id, second.clone_id);
        wait_terminal(&fx.store, &first.job_id).await;
        wait_terminal(&fx.store, &second.job_id).await;
    }

    #[tokio::test]
    async fn test_validation_rejects_before_creating_records() {
        let fx = fixture(&parse_ok(1), INDEX_OK, ADAPT_OK).await;
        std::fs::create_dir_all(fx.dir.path().join("uploads").join("empty")).unwrap();

        let cases = [
            TrainingRequest { dataset_id: "".into(), ..request() },
            TrainingRequest { dataset_id: "../etc".into(), ..request() },
            TrainingRequest { dataset_id: "missing".into(), ..request() },
            TrainingRequest { dataset_id: "empty".into(), ..request() },
            TrainingRequest { model_id: " ".into(), ..request() },
            TrainingRequest { persona: "".into(), ..request() },
        ];
        for case in cases {
            let err = fx.runner.submit(case.clone()).await.unwrap_err();
            assert!(matches!(err, PipelineError::Validation(_)), "{:?}", case);
        }
        assert!(fx.store.list_jobs().await.unwrap().is_empty());
        assert!(fx.store.list_clones().await.unwrap().is_empty());
    }

    #[test]
    fn test_stage_arguments() {
        let settings = PipelineSettings {
            uploads_dir: PathBuf::from("/data/uploads"),
            jobs_dir: PathBuf::from("/data/jobs"),
            parse_command: vec!["python3".into(), "-m".into(), "dataset_pipeline.cli".into()],
            index_command: vec!["python3".into(), "rag/build_index.py".into()],
            adapt_command: vec!["python3".into(), "train_qlora.py".into()],
            output_format: "sharegpt".into(),
            eval_split: 0.2,
            working_dir: None,
        };
        let layout = settings.job_layout("j1");

        let parse = settings
            .parse_command(&settings.dataset_dir("d1"), &layout, "Ada")
            .unwrap();
        assert_eq!(
            parse.display(),
            "python3 -m dataset_pipeline.cli --inputs /data/uploads/d1 --output-dir /data/jobs/j1/processed --persona Ada --format sharegpt --eval-split 0.2"
        );

        let index = settings.index_command(&layout).unwrap();
        assert_eq!(
            index.display(),
            "python3 rag/build_index.py --knowledge-file /data/jobs/j1/processed/knowledge.jsonl --output-dir /data/jobs/j1/rag_index"
        );

        let mut req = request();
        let adapt = settings.adapt_command(&layout, &req).unwrap();
        assert!(adapt.args.ends_with(&["--system-prompt".to_string(), "Stay in character.".to_string()]));
        assert!(adapt.display().contains("--adapter-dir /data/jobs/j1/adapter"));
        assert!(adapt.display().contains("--output-dir /data/jobs/j1/checkpoints"));

        req.system_prompt = None;
        let adapt = settings.adapt_command(&layout, &req).unwrap();
        assert!(!adapt.args.contains(&"--system-prompt".to_string()));
    }
}
