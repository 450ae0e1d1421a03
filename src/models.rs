use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A single replayable line from the source log
///
/// Records are immutable once read and keep file order; `source_ip` is
/// `None` for daemon chatter that carries no client address (such lines
/// are still replayed but do not feed the per-IP observation index).
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source_ip: Option<IpAddr>,
    pub raw_line: String,
}

/// Ground truth label for an (ip, day) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Malicious,
    Benign,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Malicious => write!(f, "malicious"),
            Label::Benign => write!(f, "benign"),
        }
    }
}

/// Ban or unban, as reported by the detector's action hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Ban,
    Unban,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Ban => write!(f, "ban"),
            ActionKind::Unban => write!(f, "unban"),
        }
    }
}

/// One entry from the detector's action event stream
///
/// Arrival order is not guaranteed to match timestamp order; the trace is
/// sorted before correlation. The hook may emit the timestamp under either
/// `timestamp` or `ts`; extra payload fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(alias = "ts")]
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub ip: IpAddr,
    #[serde(default)]
    pub jail: String,
    #[serde(default)]
    pub reason: String,
}

/// Contiguous banned span for one IP, reconstructed from the action trace
///
/// `unban_time` is `None` for intervals still open when the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanInterval {
    pub ip: IpAddr,
    pub ban_time: DateTime<Utc>,
    pub unban_time: Option<DateTime<Utc>>,
    pub jail: String,
}

impl BanInterval {
    pub fn is_open(&self) -> bool {
        self.unban_time.is_none()
    }

    /// Blocking duration in seconds; `None` while the interval is open
    pub fn duration_secs(&self) -> Option<f64> {
        self.unban_time
            .map(|unban| (unban - self.ban_time).num_milliseconds() as f64 / 1000.0)
    }
}

/// One banned address from a detector status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannedIp {
    pub ip: IpAddr,
    pub ban_time: Option<DateTime<Utc>>,
}

/// Detector ban-list snapshot for a named jail at query time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JailStatus {
    pub queried_at: DateTime<Utc>,
    pub jail: String,
    pub banned: Vec<BannedIp>,
}

/// Summary statistics over a set of durations, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

impl DurationSummary {
    /// Summarize a sample set; `None` when empty so that "no data" stays
    /// distinguishable from a measured zero downstream.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let median = if len % 2 == 0 {
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
        } else {
            sorted[len / 2]
        };
        let p95_idx = ((len as f64 * 0.95) as usize).min(len - 1);

        Some(Self {
            count: len,
            mean: sum / len as f64,
            median,
            min: sorted[0],
            max: sorted[len - 1],
            p95: sorted[p95_idx],
        })
    }
}

/// Visible skip and anomaly counters for one run
///
/// Nothing is silently dropped: every skipped record increments one of
/// these, and the whole struct is persisted with the run's metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWarnings {
    /// Source log lines without a parseable timestamp
    pub skipped_lines: u64,
    /// Source log timestamps that went backwards
    pub non_monotonic_timestamps: u64,
    /// Ground truth rows with an unparsable ip or day
    pub malformed_rows: u64,
    /// Ground truth rows labeled unknown (excluded from denominators)
    pub unknown_labels: u64,
    /// Duplicate (ip, day) keys with conflicting labels (first wins)
    pub duplicate_labels: u64,
    /// Action stream records that failed to parse
    pub malformed_actions: u64,
    /// Unban events with no preceding open ban
    pub unmatched_unbans: u64,
}

impl RunWarnings {
    pub fn merge(&mut self, other: &RunWarnings) {
        self.skipped_lines += other.skipped_lines;
        self.non_monotonic_timestamps += other.non_monotonic_timestamps;
        self.malformed_rows += other.malformed_rows;
        self.unknown_labels += other.unknown_labels;
        self.duplicate_labels += other.duplicate_labels;
        self.malformed_actions += other.malformed_actions;
        self.unmatched_unbans += other.unmatched_unbans;
    }

    pub fn total(&self) -> u64 {
        self.skipped_lines
            + self.non_monotonic_timestamps
            + self.malformed_rows
            + self.unknown_labels
            + self.duplicate_labels
            + self.malformed_actions
            + self.unmatched_unbans
    }
}

/// IP population counts underlying the rate metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub malicious_observed: u64,
    pub benign_observed: u64,
    pub unknown_observed: u64,
    pub banned_ips: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
    pub ban_intervals: u64,
    /// Intervals still open at run end; censored, never averaged into
    /// blocking duration
    pub open_intervals: u64,
}

/// Quality metrics for one replay run
///
/// Rate metrics are `None` when their denominator is empty, never a
/// misleading 0/0 result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
    pub lines_ingested: u64,
    pub lines_skipped: u64,
    pub tpr: Option<f64>,
    pub fpr: Option<f64>,
    pub accuracy: Option<f64>,
    pub counts: RunCounts,
    pub detection_seconds: Option<DurationSummary>,
    pub blocking_seconds: Option<DurationSummary>,
    /// Seconds from first malicious evidence to first ban, per detected IP
    pub detection_by_ip: std::collections::BTreeMap<String, f64>,
    /// Closed-interval blocking durations per IP
    pub blocking_by_ip: std::collections::BTreeMap<String, Vec<f64>>,
    pub warnings: RunWarnings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_duration_summary_empty_is_none() {
        assert_eq!(DurationSummary::from_values(&[]), None);
    }

    #[test]
    fn test_duration_summary_values() {
        let summary = DurationSummary::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(summary.count, 4);
        assert!((summary.mean - 2.5).abs() < 1e-9);
        assert!((summary.median - 2.5).abs() < 1e-9);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.p95, 4.0);
    }

    #[test]
    fn test_ban_interval_duration() {
        let ban_time = Utc.with_ymd_and_hms(2024, 12, 17, 10, 0, 0).unwrap();
        let open = BanInterval {
            ip: "192.0.2.1".parse().unwrap(),
            ban_time,
            unban_time: None,
            jail: "sshd".to_string(),
        };
        assert!(open.is_open());
        assert_eq!(open.duration_secs(), None);

        let closed = BanInterval {
            unban_time: Some(ban_time + chrono::Duration::seconds(600)),
            ..open
        };
        assert_eq!(closed.duration_secs(), Some(600.0));
    }

    #[test]
    fn test_action_event_ts_alias() {
        let event: ActionEvent = serde_json::from_str(
            r#"{"ts":"2024-12-17T10:00:00Z","action":"ban","ip":"192.0.2.1","jail":"sshd","reason":"","extra":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(event.action, ActionKind::Ban);
        assert_eq!(event.ip.to_string(), "192.0.2.1");
    }

    #[test]
    fn test_warnings_merge_and_total() {
        let mut a = RunWarnings {
            skipped_lines: 1,
            ..Default::default()
        };
        let b = RunWarnings {
            unmatched_unbans: 2,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.skipped_lines, 1);
        assert_eq!(a.unmatched_unbans, 2);
        assert_eq!(a.total(), 3);
    }
}
