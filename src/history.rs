//! Append-only cross-run history store
//!
//! One JSON line per run, append order significant. The store exposes only
//! `append` and `read_all`; entries are never edited in place, which keeps
//! the repeatability analysis trustworthy. An append serializes the whole
//! entry into one buffer and writes it with a single call, so a concurrent
//! reader never observes a partially written entry.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{BenchError, Result};
use crate::models::RunMetrics;

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one run's metrics as a single whole-line write
    pub fn append(&self, entry: &RunMetrics) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// All runs in append order. A missing file is an empty history; a
    /// partial trailing line (append in progress) is skipped with a
    /// warning, but a corrupt entry mid-file is a data-integrity error.
    pub fn read_all(&self) -> Result<Vec<RunMetrics>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        let mut runs = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunMetrics>(line) {
                Ok(run) => runs.push(run),
                Err(e) if index + 1 == lines.len() => {
                    warn!("skipping partial trailing history entry: {}", e);
                }
                Err(e) => {
                    return Err(BenchError::DataFormat(format!(
                        "corrupt history entry at {}:{}: {}",
                        self.path.display(),
                        index + 1,
                        e
                    )));
                }
            }
        }
        Ok(runs)
    }

    /// The most recent `n` runs, append order preserved
    pub fn last(&self, n: usize) -> Result<Vec<RunMetrics>> {
        let mut runs = self.read_all()?;
        let skip = runs.len().saturating_sub(n);
        Ok(runs.split_off(skip))
    }
}
