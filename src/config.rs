//! Configuration for clonesmith.
//!
//! Settings are layered: built-in defaults, then `clonesmith.toml`, then
//! environment variables, then CLI flags (applied by `main`).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8420
//!
//! [storage]
//! data_dir = "/var/lib/clonesmith"
//! flush_debounce_ms = 500
//!
//! [pipeline]
//! parse_command = ["python3", "-m", "dataset_pipeline.cli"]
//! index_command = ["python3", "rag/build_index.py"]
//! adapt_command = ["python3", "train_qlora.py"]
//! output_format = "huggingface"
//!
//! [worker]
//! command = ["python3", "-m", "ai_clone_server.worker"]
//! heartbeat_timeout_secs = 20
//! monitor_interval_secs = 10
//! stop_grace_secs = 10
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "clonesmith.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL handed to workers. Derived from host/port when empty.
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            callback_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Coalescing window for record store flushes
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".clonesmith"))
        .unwrap_or_else(|| PathBuf::from(".clonesmith"))
}

fn default_flush_debounce_ms() -> u64 {
    500
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_debounce_ms: default_flush_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_parse_command")]
    pub parse_command: Vec<String>,
    #[serde(default = "default_index_command")]
    pub index_command: Vec<String>,
    #[serde(default = "default_adapt_command")]
    pub adapt_command: Vec<String>,
    /// Output format passed to the parsing stage (huggingface, sharegpt, instruct)
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_eval_split")]
    pub eval_split: f64,
    /// Working directory for stage processes; inherits ours when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_parse_command() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "dataset_pipeline.cli".into()]
}

fn default_index_command() -> Vec<String> {
    vec!["python3".into(), "rag/build_index.py".into()]
}

fn default_adapt_command() -> Vec<String> {
    vec!["python3".into(), "train_qlora.py".into()]
}

fn default_output_format() -> String {
    "huggingface".to_string()
}

fn default_eval_split() -> f64 {
    0.1
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            parse_command: default_parse_command(),
            index_command: default_index_command(),
            adapt_command: default_adapt_command(),
            output_format: default_output_format(),
            eval_split: default_eval_split(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: Vec<String>,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_worker_command() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "ai_clone_server.worker".into()]
}

fn default_heartbeat_timeout_secs() -> u64 {
    20
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_stop_grace_secs() -> u64 {
    10
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl WorkerSection {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files; stderr only when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// The complete clonesmith.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse clonesmith.toml")
    }

    /// Resolve configuration: an explicit path must exist; otherwise
    /// `<data_dir>/clonesmith.toml` is used when present. Environment
    /// overrides are applied in both cases.
    pub fn resolve(explicit: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let dir = data_dir
                    .map(Path::to_path_buf)
                    .or_else(|| std::env::var_os("CLONESMITH_DATA_DIR").map(PathBuf::from))
                    .unwrap_or_else(default_data_dir);
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    Self::load(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        if let Some(dir) = data_dir {
            config.storage.data_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize clonesmith.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Environment variables override file settings.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("CLONESMITH_DATA_DIR")
            && !dir.trim().is_empty()
        {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(host) = std::env::var("CLONESMITH_HOST")
            && !host.trim().is_empty()
        {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("CLONESMITH_PORT")
            && let Ok(port) = port.trim().parse()
        {
            self.server.port = port;
        }
        if let Ok(level) = std::env::var("CLONESMITH_LOG")
            && !level.trim().is_empty()
        {
            self.logging.level = level;
        }
        if let Ok(cmd) = std::env::var("CLONESMITH_WORKER_CMD") {
            let parts: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if !parts.is_empty() {
                self.worker.command = parts;
            }
        }
    }

    /// URL workers use to reach the liveness endpoint.
    pub fn callback_url(&self) -> String {
        match self.server.callback_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.storage.flush_debounce_ms)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.storage.data_dir.join("records")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.storage.data_dir.join("uploads")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.storage.data_dir.join("jobs")
    }

    pub fn breadcrumbs_dir(&self) -> PathBuf {
        self.storage.data_dir.join("run").join("workers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.storage.data_dir.join("logs")
    }

    pub fn integrations_file(&self) -> PathBuf {
        self.records_dir().join("integrations.json")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.records_dir(),
            self.uploads_dir(),
            self.jobs_dir(),
            self.breadcrumbs_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, command) in [
            ("pipeline.parse_command", &self.pipeline.parse_command),
            ("pipeline.index_command", &self.pipeline.index_command),
            ("pipeline.adapt_command", &self.pipeline.adapt_command),
            ("worker.command", &self.worker.command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                warnings.push(format!("{} is empty", name));
            }
        }

        if !(self.pipeline.eval_split > 0.0 && self.pipeline.eval_split < 1.0) {
            warnings.push(format!(
                "pipeline.eval_split must be between 0 and 1, got {}",
                self.pipeline.eval_split
            ));
        }

        if self.worker.heartbeat_timeout_secs == 0 {
            warnings.push("worker.heartbeat_timeout_secs is 0".to_string());
        }
        if self.worker.monitor_interval_secs == 0 {
            warnings.push("worker.monitor_interval_secs is 0".to_string());
        }
        if self.worker.heartbeat_timeout_secs < self.worker.monitor_interval_secs {
            warnings.push(format!(
                "worker.heartbeat_timeout_secs ({}) is shorter than worker.monitor_interval_secs ({})",
                self.worker.heartbeat_timeout_secs, self.worker.monitor_interval_secs
            ));
        }

        if self.storage.flush_debounce_ms > 10_000 {
            warnings.push(format!(
                "storage.flush_debounce_ms is {}ms; a crash can lose that much history",
                self.storage.flush_debounce_ms
            ));
        }

        warnings
    }
}
