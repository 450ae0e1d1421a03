//! Per-run artifact directory
//!
//! Each run owns a directory under the configured output root holding the
//! replay progress log, labeled detector status snapshots, the run manifest,
//! `metrics.json` and a copy of the detector's own log. Everything is
//! written incrementally so a cancelled run still leaves a usable partial
//! artifact set.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{JailStatus, RunMetrics};

/// What this run was configured to do, written at replay start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub source_log: String,
    pub dataset: String,
    pub jail: String,
    pub speed_factor: f64,
    pub sleep_cap_secs: f64,
    pub status_interval: u64,
    pub clock_override: bool,
    /// First replayed timestamp; the epoch the detector observes under its
    /// virtual-clock wrapper. Fixed for the detector's lifetime: moving it
    /// requires restarting the detector, never a mid-run change.
    pub virtual_epoch: Option<DateTime<Utc>>,
}

pub struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    /// Create (or reopen) the artifact directory for a run
    pub fn create<P: AsRef<Path>>(base: P, run_id: &str) -> Result<Self> {
        let dir = base.as_ref().join(run_id);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(self.dir.join("manifest.json"), json)?;
        Ok(())
    }

    /// Append one timestamped line to the replay progress log
    pub fn append_progress(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("progress.log"))?;
        writeln!(file, "{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), line)?;
        Ok(())
    }

    /// Persist a labeled detector status snapshot
    pub fn write_snapshot(&self, label: &str, status: &JailStatus) -> Result<PathBuf> {
        let path = self.dir.join(format!("status_{}.json", label));
        let json = serde_json::to_string_pretty(status)?;
        fs::write(&path, json)?;
        debug!("wrote status snapshot {}", path.display());
        Ok(path)
    }

    /// Write metrics.json atomically (temp file + rename) so a reader never
    /// sees a half-written result
    pub fn write_metrics(&self, metrics: &RunMetrics) -> Result<PathBuf> {
        let path = self.dir.join("metrics.json");
        let tmp = self.dir.join(".metrics.json.tmp");
        let json = serde_json::to_string_pretty(metrics)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Copy the detector's own log next to the results for troubleshooting;
    /// a missing source is not an error, the run just lacks that artifact
    pub fn copy_detector_log<P: AsRef<Path>>(&self, source: P) -> Result<Option<PathBuf>> {
        let source = source.as_ref();
        if !source.exists() {
            warn!("detector log {} not found, skipping copy", source.display());
            return Ok(None);
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "detector.log".to_string());
        let dest = self.dir.join(name);
        fs::copy(source, &dest)?;
        Ok(Some(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BannedIp;

    fn status() -> JailStatus {
        JailStatus {
            queried_at: Utc::now(),
            jail: "sshd".to_string(),
            banned: vec![BannedIp {
                ip: "192.0.2.1".parse().unwrap(),
                ban_time: Some(Utc::now()),
            }],
        }
    }

    #[test]
    fn test_create_and_snapshot_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = RunDir::create(base.path(), "run-1").unwrap();

        let path = run_dir.write_snapshot("before", &status()).unwrap();
        let loaded: JailStatus =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.jail, "sshd");
        assert_eq!(loaded.banned.len(), 1);
    }

    #[test]
    fn test_progress_appends() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = RunDir::create(base.path(), "run-1").unwrap();
        run_dir.append_progress("emitted=100").unwrap();
        run_dir.append_progress("emitted=200").unwrap();

        let content = fs::read_to_string(run_dir.path().join("progress.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("emitted=200"));
    }

    #[test]
    fn test_copy_missing_detector_log_is_none() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = RunDir::create(base.path(), "run-1").unwrap();
        let copied = run_dir.copy_detector_log("/nonexistent/fail2ban.log").unwrap();
        assert!(copied.is_none());
    }

    #[test]
    fn test_reopen_existing_run_dir() {
        let base = tempfile::tempdir().unwrap();
        let first = RunDir::create(base.path(), "run-1").unwrap();
        first.append_progress("from replay").unwrap();

        // scoring later reopens the same directory
        let second = RunDir::create(base.path(), "run-1").unwrap();
        second.append_progress("from scoring").unwrap();

        let content = fs::read_to_string(second.path().join("progress.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
