//! External stage invocation with line-by-line log streaming.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::store::StoreHandle;

/// Upper bound on log lines written per store call.
const LOG_BATCH: usize = 50;

/// How long output is still read after the stage process exits. Descendants
/// that inherited the pipes can hold them open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Index,
    Adapt,
}

impl Stage {
    /// Human-readable name used in job errors.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parse => "dataset parsing",
            Self::Index => "knowledge indexing",
            Self::Adapt => "model adaptation",
        }
    }

    /// Short prefix for job log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Index => "index",
            Self::Adapt => "adapt",
        }
    }

    /// A failing fatal stage ends the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Index)
    }
}

/// One fully-resolved stage invocation.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl StageCommand {
    /// Build from a configured `[program, fixed args...]` prefix plus the
    /// stage's own arguments.
    pub fn new(
        stage: Stage,
        command: &[String],
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let (program, prefix) = command.split_first().ok_or_else(|| {
            PipelineError::Validation(format!("no command configured for {}", stage.label()))
        })?;
        let mut all_args = prefix.to_vec();
        all_args.extend(args);
        Ok(Self {
            stage,
            program: program.clone(),
            args: all_args,
            working_dir,
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Run a stage to completion, appending its output to the job log as it
/// arrives. Judged only by exit status.
pub async fn run_stage(
    store: &StoreHandle,
    job_id: &str,
    command: &StageCommand,
) -> Result<(), PipelineError> {
    let stage = command.stage;
    let started = Instant::now();
    info!(job_id, stage = stage.tag(), command = %command.display(), "Stage starting");
    store
        .append_log(job_id, format!("[orchestrator] Starting {}", stage.label()))
        .await?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| PipelineError::StageSpawn {
        stage: stage.label(),
        source,
    })?;

    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_log_lines(store.clone(), job_id.to_string(), line_rx));

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(
            stdout,
            format!("[{}]", stage.tag()),
            line_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(
            stderr,
            format!("[{}:stderr]", stage.tag()),
            line_tx.clone(),
        )));
    }
    drop(line_tx);

    let status = child.wait().await;
    let abort_handles: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
    let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
        for reader in readers {
            if let Err(e) = reader.await {
                warn!(job_id, stage = stage.tag(), error = %e, "Output reader panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            job_id,
            stage = stage.tag(),
            "Stage output still open after exit, detaching"
        );
        for handle in abort_handles {
            handle.abort();
        }
    }
    if let Err(e) = writer.await {
        warn!(job_id, stage = stage.tag(), error = %e, "Log writer panicked");
    }

    let status = status.map_err(|e| PipelineError::Other(e.into()))?;
    let elapsed = started.elapsed().as_secs_f64();
    if status.success() {
        info!(job_id, stage = stage.tag(), elapsed_secs = elapsed, "Stage finished");
        store
            .append_log(
                job_id,
                format!("[orchestrator] Finished {} in {:.1}s", stage.label(), elapsed),
            )
            .await?;
        Ok(())
    } else {
        warn!(job_id, stage = stage.tag(), code = ?status.code(), fatal = stage.is_fatal(), "Stage failed");
        Err(PipelineError::StageFailed {
            stage: stage.label(),
            exit_code: status.code(),
        })
    }
}

async fn forward_lines<R>(stream: R, prefix: String, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                if tx.send(format!("{} {}", prefix, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Stage output stream closed");
                break;
            }
        }
    }
}

/// Drain lines into the job log, batching whatever is already queued.
async fn write_log_lines(store: StoreHandle, job_id: String, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut batch = Vec::new();
    while let Some(line) = rx.recv().await {
        batch.push(line);
        while batch.len() < LOG_BATCH {
            match rx.try_recv() {
                Ok(line) => batch.push(line),
                Err(_) => break,
            }
        }
        let lines = std::mem::take(&mut batch);
        let id = job_id.clone();
        let result = store
            .call(move |records| {
                for line in lines {
                    records.append_log(&id, line)?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "Failed to append stage output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTraining, Records};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn store_with_job(dir: &TempDir) -> (StoreHandle, String) {
        let (store, _task) = StoreHandle::spawn(
            Records::default(),
            dir.path().join("records"),
            Duration::from_millis(20),
        );
        let (job, _) = store
            .create_training(NewTraining {
                name: "n".into(),
                model_id: "m".into(),
                dataset_path: dir.path().to_path_buf(),
                persona: "p".into(),
                system_prompt: None,
            })
            .await
            .unwrap();
        (store, job.id)
    }

    fn sh(script: &str, stage: Stage) -> StageCommand {
        StageCommand::new(
            stage,
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            Vec::new(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_stage_policy() {
        assert!(Stage::Parse.is_fatal());
        assert!(!Stage::Index.is_fatal());
        assert!(Stage::Adapt.is_fatal());
        assert_eq!(Stage::Adapt.label(), "model adaptation");
    }

    #[test]
    fn test_command_prefix_and_args() {
        let cmd = StageCommand::new(
            Stage::Index,
            &["python3".to_string(), "rag/build_index.py".to_string()],
            vec!["--output-dir".to_string(), "/x".to_string()],
            None,
        )
        .unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["rag/build_index.py", "--output-dir", "/x"]);
        assert_eq!(cmd.display(), "python3 rag/build_index.py --output-dir /x");

        assert!(StageCommand::new(Stage::Parse, &[], Vec::new(), None).is_err());
    }

    #[tokio::test]
    async fn test_output_streams_into_job_log() {
        let dir = TempDir::new().unwrap();
        let (store, job_id) = store_with_job(&dir).await;

        run_stage(
            &store,
            &job_id,
            &sh("echo one; echo two; echo oops >&2", Stage::Parse),
        )
        .await
        .unwrap();

        let logs = store.get_job(&job_id).await.unwrap().logs;
        assert!(logs.contains(&"[parse] one".to_string()));
        assert!(logs.contains(&"[parse:stderr] oops".to_string()));
        let one = logs.iter().position(|l| l == "[parse] one").unwrap();
        let two = logs.iter().position(|l| l == "[parse] two").unwrap();
        assert!(one < two);
        assert!(logs.last().unwrap().contains("Finished dataset parsing"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_stage_failure() {
        let dir = TempDir::new().unwrap();
        let (store, job_id) = store_with_job(&dir).await;

        let err = run_stage(&store, &job_id, &sh("echo bad; exit 3", Stage::Adapt))
            .await
            .unwrap_err();
        match err {
            PipelineError::StageFailed { stage, exit_code } => {
                assert_eq!(stage, "model adaptation");
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
        let logs = store.get_job(&job_id).await.unwrap().logs;
        assert!(logs.contains(&"[adapt] bad".to_string()));
    }

    #[tokio::test]
    async fn test_exit_status_wins_over_lingering_descendants() {
        let dir = TempDir::new().unwrap();
        let (store, job_id) = store_with_job(&dir).await;

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(3),
            run_stage(&store, &job_id, &sh("sleep 5 & echo done; exit 1", Stage::Parse)),
        )
        .await
        .expect("stage verdict waited on a background process")
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                exit_code: Some(1),
                ..
            }
        ));
        let logs = store.get_job(&job_id).await.unwrap().logs;
        assert!(logs.contains(&"[parse] done".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let (store, job_id) = store_with_job(&dir).await;
        let cmd = StageCommand::new(
            Stage::Parse,
            &["/definitely/not/a/program".to_string()],
            Vec::new(),
            None,
        )
        .unwrap();
        let err = run_stage(&store, &job_id, &cmd).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageSpawn { .. }));
    }
}
