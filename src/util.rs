//! Shared utility functions for the clonesmith crate.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Generate a fresh record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an opaque API key for a clone.
pub fn new_api_key() -> String {
    format!("cs_{}", uuid::Uuid::new_v4().simple())
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// Writes to a sibling temp file and renames it over the target, so a crash
/// mid-write leaves the previous file intact.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Whether `id` is safe to use as a single path component.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(new_id(), new_id());
        let key = new_api_key();
        assert!(key.starts_with("cs_"));
        assert_eq!(key.len(), 35);
    }

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.json");

        let mut map = HashMap::new();
        map.insert("a".to_string(), 1);
        write_json_atomic(&path, &map).unwrap();
        map.insert("b".to_string(), 2);
        write_json_atomic(&path, &map).unwrap();

        let loaded: HashMap<String, i32> = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_read_json_opt_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Vec<String>> = read_json_opt(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_read_json_opt_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_json_opt::<Vec<String>>(&path).is_err());
    }

    #[test]
    fn test_is_safe_id() {
        assert!(is_safe_id("dataset-01_v2.final"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id(".."));
        assert!(!is_safe_id("."));
        assert!(!is_safe_id("../etc"));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id("a b"));
    }
}
