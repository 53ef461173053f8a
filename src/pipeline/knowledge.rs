//! Knowledge record scan: per-source chunk counts after dataset parsing.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clonesmith_common::KnowledgeSource;
use serde::Deserialize;

const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Deserialize)]
struct ChunkLine {
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeSummary {
    pub count: usize,
    /// In order of first appearance in the file.
    pub sources: Vec<KnowledgeSource>,
    /// Lines that were not valid JSON objects.
    pub skipped: usize,
}

/// Scan a knowledge JSONL file. A missing file means no knowledge.
pub fn summarize(knowledge_file: &Path, dataset_dir: &Path) -> Result<KnowledgeSummary> {
    let file = match File::open(knowledge_file) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(KnowledgeSummary::default());
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to open knowledge file {}", knowledge_file.display())
            });
        }
    };

    let mut summary = KnowledgeSummary::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in BufReader::new(file).lines() {
        let line = line
            .with_context(|| format!("Failed to read {}", knowledge_file.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let chunk: ChunkLine = match serde_json::from_str(trimmed) {
            Ok(chunk) => chunk,
            Err(_) => {
                summary.skipped += 1;
                continue;
            }
        };
        let source = chunk
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());

        summary.count += 1;
        match index.get(&source) {
            Some(&i) => summary.sources[i].chunks += 1,
            None => {
                index.insert(source.clone(), summary.sources.len());
                summary.sources.push(KnowledgeSource {
                    source,
                    chunks: 1,
                    size_bytes: None,
                });
            }
        }
    }

    for entry in &mut summary.sources {
        entry.size_bytes = source_size(&entry.source, dataset_dir);
    }

    Ok(summary)
}

/// Best-effort byte size of a source file; `None` when it cannot be found.
fn source_size(source: &str, dataset_dir: &Path) -> Option<u64> {
    if source == UNKNOWN_SOURCE {
        return None;
    }
    candidates(source, dataset_dir)
        .into_iter()
        .find_map(|path| std::fs::metadata(path).ok().filter(|m| m.is_file()))
        .map(|m| m.len())
}

fn candidates(source: &str, dataset_dir: &Path) -> Vec<PathBuf> {
    let path = Path::new(source);
    let mut out = Vec::new();
    if path.is_absolute() {
        out.push(path.to_path_buf());
    } else {
        out.push(dataset_dir.join(path));
    }
    if let Some(name) = path.file_name() {
        let by_name = dataset_dir.join(name);
        if !out.contains(&by_name) {
            out.push(by_name);
        }
    }
    out
}
