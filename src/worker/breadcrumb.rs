//! Durable pid breadcrumbs: `<dir>/<clone_id>.pid`, holding only the pid.
//!
//! Used for crash recovery only. The in-memory registry is the source of
//! truth for liveness while the manager runs.

use std::io;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "pid";

#[derive(Debug, Clone)]
pub struct Breadcrumbs {
    dir: PathBuf,
}

impl Breadcrumbs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, clone_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", clone_id, EXTENSION))
    }

    pub fn write(&self, clone_id: &str, pid: u32) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(clone_id);
        let tmp = path.with_extension("pid.tmp");
        std::fs::write(&tmp, pid.to_string())?;
        std::fs::rename(&tmp, &path)
    }

    /// The recorded pid, or `None` if there is no breadcrumb or it does not
    /// hold a valid pid.
    pub fn read(&self, clone_id: &str) -> io::Result<Option<u32>> {
        match std::fs::read_to_string(self.path_for(clone_id)) {
            Ok(content) => Ok(parse_pid(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a breadcrumb; a missing file is not an error.
    pub fn remove(&self, clone_id: &str) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(clone_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All breadcrumbs as `(clone_id, pid)`. Unparseable files yield `None`.
    pub fn list(&self) -> io::Result<Vec<(String, Option<u32>)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(clone_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let pid = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| parse_pid(&content));
            out.push((clone_id.to_string(), pid));
        }
        out.sort();
        Ok(out)
    }
}

fn parse_pid(content: &str) -> Option<u32> {
    content.trim().parse().ok().filter(|pid| *pid > 0)
}
