use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BenchError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub ground_truth: GroundTruthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            replay: ReplayConfig::default(),
            sink: SinkConfig::default(),
            status: StatusConfig::default(),
            ground_truth: GroundTruthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BenchError::Configuration(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            BenchError::Configuration(format!(
                "failed to parse config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/banbench/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("banbench/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("banbench.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BenchError::Configuration(format!("failed to render config: {}", e)))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject configurations under which a run cannot produce meaningful
    /// results. Checked once before any replay or scoring starts.
    pub fn validate(&self) -> Result<()> {
        if !(self.replay.speed_factor > 0.0) || !self.replay.speed_factor.is_finite() {
            return Err(BenchError::Configuration(format!(
                "speed_factor must be a positive number, got {}",
                self.replay.speed_factor
            )));
        }
        if self.replay.sleep_cap_secs < 0.0 || !self.replay.sleep_cap_secs.is_finite() {
            return Err(BenchError::Configuration(format!(
                "sleep_cap_secs must be non-negative, got {}",
                self.replay.sleep_cap_secs
            )));
        }
        self.ground_truth.offset()?;
        if self.sink.command.trim().is_empty() {
            return Err(BenchError::Configuration(
                "sink command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Captured source log to replay
    #[serde(default = "default_source_log")]
    pub source_log: String,

    /// JSON-lines action stream appended by the detector's ban/unban hook
    #[serde(default = "default_actions_log")]
    pub actions_log: String,

    /// Detector's own log, copied into the run directory for troubleshooting
    #[serde(default)]
    pub detector_log: Option<String>,

    /// Directory receiving per-run artifact directories
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Append-only cross-run history file
    #[serde(default = "default_history_file")]
    pub history_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Fixed run identifier; generated per invocation when unset
    #[serde(default)]
    pub run_id: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            source_log: default_source_log(),
            actions_log: default_actions_log(),
            detector_log: Some("/var/log/fail2ban.log".to_string()),
            output_dir: default_output_dir(),
            history_file: default_history_file(),
            log_level: default_log_level(),
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Compression ratio applied to recorded inter-event gaps
    /// (600 = 10 minutes of log per wall-clock second)
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,

    /// Maximum sleep per gap after the speed factor is applied; keeps
    /// multi-hour idle spans from stalling the replay
    #[serde(default = "default_sleep_cap")]
    pub sleep_cap_secs: f64,

    /// Query and persist detector status every N emitted records
    /// (0 disables interval snapshots; before/after snapshots always run)
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,

    /// Year hint for syslog timestamps, which carry none
    #[serde(default)]
    pub start_year: Option<i32>,

    /// Restrict replay to lines containing this substring (usually an IP)
    #[serde(default)]
    pub ip_filter: Option<String>,

    /// Emit at most this many records (smoke tests)
    #[serde(default)]
    pub max_lines: Option<u64>,

    /// Record that the detector runs under a virtual-clock wrapper whose
    /// epoch is the first replayed timestamp
    #[serde(default = "default_true")]
    pub clock_override: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed_factor: default_speed_factor(),
            sleep_cap_secs: default_sleep_cap(),
            status_interval: default_status_interval(),
            start_year: None,
            ip_filter: None,
            max_lines: None,
            clock_override: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Line-forwarding command, invoked once per record with the record on stdin
    #[serde(default = "default_sink_command")]
    pub command: String,

    /// Arguments for the command (priority, tag)
    #[serde(default = "default_sink_args")]
    pub args: Vec<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            command: default_sink_command(),
            args: default_sink_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Jail whose ban list the status probe queries
    #[serde(default = "default_jail")]
    pub jail: String,

    /// Detector client binary used for status queries
    #[serde(default = "default_client_command")]
    pub client_command: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            jail: default_jail(),
            client_command: default_client_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthConfig {
    /// Labeled dataset with ip, day and label columns
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Day-boundary convention of the dataset, as a fixed offset from UTC
    #[serde(default)]
    pub utc_offset_hours: i32,
}

impl Default for GroundTruthConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            utc_offset_hours: 0,
        }
    }
}

impl GroundTruthConfig {
    /// The configured day-boundary offset as a chrono offset
    pub fn offset(&self) -> Result<FixedOffset> {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                BenchError::Configuration(format!(
                    "utc_offset_hours out of range: {}",
                    self.utc_offset_hours
                ))
            })
    }
}

// Default value functions
fn default_source_log() -> String {
    "benchmark.log".to_string()
}

fn default_actions_log() -> String {
    "/var/log/f2b-actions.json".to_string()
}

fn default_output_dir() -> String {
    "results".to_string()
}

fn default_history_file() -> String {
    "results/history.jsonl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_speed_factor() -> f64 {
    600.0
}

fn default_sleep_cap() -> f64 {
    0.1
}

fn default_status_interval() -> u64 {
    5000
}

fn default_sink_command() -> String {
    "logger".to_string()
}

fn default_sink_args() -> Vec<String> {
    vec![
        "--priority".to_string(),
        "authpriv.info".to_string(),
        "--tag".to_string(),
        "replay".to_string(),
    ]
}

fn default_jail() -> String {
    "sshd".to_string()
}

fn default_client_command() -> String {
    "fail2ban-client".to_string()
}

fn default_dataset() -> String {
    "benchmark.csv".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.replay.speed_factor, 600.0);
        assert_eq!(config.replay.sleep_cap_secs, 0.1);
        assert_eq!(config.replay.status_interval, 5000);
        assert_eq!(config.status.jail, "sshd");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.replay.speed_factor, config.replay.speed_factor);
        assert_eq!(parsed.sink.args, config.sink.args);
    }

    #[test]
    fn test_validate_rejects_bad_speed_factor() {
        let mut config = Config::default();
        config.replay.speed_factor = 0.0;
        assert!(matches!(
            config.validate(),
            Err(BenchError::Configuration(_))
        ));

        config.replay.speed_factor = -5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ground_truth_offset() {
        let mut gt = GroundTruthConfig::default();
        assert_eq!(gt.offset().unwrap().local_minus_utc(), 0);

        gt.utc_offset_hours = 2;
        assert_eq!(gt.offset().unwrap().local_minus_utc(), 7200);

        gt.utc_offset_hours = 99;
        assert!(gt.offset().is_err());
    }
}
