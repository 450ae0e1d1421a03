//! Correlation of ground truth, replay observations and the action trace
//! into per-run quality metrics
//!
//! The classification universe is the set of IPs with at least one replayed
//! record; labeled IPs that never appeared do not enter any denominator,
//! and observed IPs absent from the dataset are excluded as unknown rather
//! than counted benign.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{BenchError, Result};
use crate::ground_truth::GroundTruth;
use crate::models::{
    ActionEvent, ActionKind, BanInterval, DurationSummary, Label, RunCounts, RunMetrics,
    RunWarnings,
};
use crate::source::ObservationIndex;

/// Rebuild per-IP ban intervals from a timestamp-sorted action trace.
///
/// Each ban opens an interval; each unban closes that IP's oldest open one.
/// An unban with no open ban is a data anomaly: counted, no interval. Bans
/// still open when the trace ends yield open intervals. The result is a
/// pure function of the sorted input, so re-running it is idempotent.
pub fn build_intervals(events: &[ActionEvent]) -> (Vec<BanInterval>, u64) {
    let mut open: HashMap<IpAddr, VecDeque<(DateTime<Utc>, String)>> = HashMap::new();
    let mut intervals = Vec::new();
    let mut unmatched = 0u64;

    for event in events {
        match event.action {
            ActionKind::Ban => {
                open.entry(event.ip)
                    .or_default()
                    .push_back((event.timestamp, event.jail.clone()));
            }
            ActionKind::Unban => match open.get_mut(&event.ip).and_then(VecDeque::pop_front) {
                Some((ban_time, jail)) => intervals.push(BanInterval {
                    ip: event.ip,
                    ban_time,
                    unban_time: Some(event.timestamp),
                    jail,
                }),
                None => {
                    unmatched += 1;
                    debug!("unban for {} with no open ban at {}", event.ip, event.timestamp);
                }
            },
        }
    }

    for (ip, remaining) in open {
        for (ban_time, jail) in remaining {
            intervals.push(BanInterval {
                ip,
                ban_time,
                unban_time: None,
                jail,
            });
        }
    }

    intervals.sort_by(|a, b| a.ban_time.cmp(&b.ban_time).then(a.ip.cmp(&b.ip)));
    (intervals, unmatched)
}

/// Joins the three timestamped sources into [`RunMetrics`]
pub struct MetricsEngine<'a> {
    truth: &'a GroundTruth,
    observations: &'a ObservationIndex,
}

enum IpClass {
    Malicious { first_evidence: DateTime<Utc> },
    Benign,
    Unknown,
}

impl<'a> MetricsEngine<'a> {
    pub fn new(truth: &'a GroundTruth, observations: &'a ObservationIndex) -> Self {
        Self {
            truth,
            observations,
        }
    }

    /// Compute the metric set for one run.
    ///
    /// `warnings` carries the counters accumulated upstream (reader, ground
    /// truth load, action parsing); interval anomalies found here are added
    /// before the struct is persisted with the results.
    pub fn compute(
        &self,
        events: &[ActionEvent],
        run_id: &str,
        notes: &str,
        mut warnings: RunWarnings,
    ) -> Result<RunMetrics> {
        if self.truth.is_empty() {
            return Err(BenchError::Configuration(
                "ground truth dataset is empty; metrics are undefined without labels".to_string(),
            ));
        }

        let (intervals, unmatched) = build_intervals(events);
        warnings.unmatched_unbans += unmatched;

        let banned: HashSet<IpAddr> = intervals.iter().map(|interval| interval.ip).collect();

        let mut counts = RunCounts {
            ban_intervals: intervals.len() as u64,
            open_intervals: intervals.iter().filter(|i| i.is_open()).count() as u64,
            banned_ips: banned.len() as u64,
            ..Default::default()
        };

        let mut detection_by_ip: BTreeMap<String, f64> = BTreeMap::new();
        let mut detection_values = Vec::new();

        for ip in self.observations.ips() {
            let class = self.classify_ip(ip);
            let is_banned = banned.contains(&ip);
            match class {
                IpClass::Malicious { first_evidence } => {
                    counts.malicious_observed += 1;
                    if is_banned {
                        counts.true_positives += 1;
                        if let Some(first_ban) = intervals
                            .iter()
                            .filter(|interval| interval.ip == ip)
                            .map(|interval| interval.ban_time)
                            .min()
                        {
                            let seconds =
                                (first_ban - first_evidence).num_milliseconds() as f64 / 1000.0;
                            detection_by_ip.insert(ip.to_string(), seconds);
                            detection_values.push(seconds);
                        }
                    } else {
                        counts.false_negatives += 1;
                    }
                }
                IpClass::Benign => {
                    counts.benign_observed += 1;
                    if is_banned {
                        counts.false_positives += 1;
                    } else {
                        counts.true_negatives += 1;
                    }
                }
                IpClass::Unknown => {
                    counts.unknown_observed += 1;
                }
            }
        }

        let mut blocking_by_ip: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut blocking_values = Vec::new();
        for interval in &intervals {
            if let Some(seconds) = interval.duration_secs() {
                blocking_by_ip
                    .entry(interval.ip.to_string())
                    .or_default()
                    .push(seconds);
                blocking_values.push(seconds);
            }
        }

        let labeled = counts.malicious_observed + counts.benign_observed;
        let metrics = RunMetrics {
            run_id: run_id.to_string(),
            recorded_at: Utc::now(),
            notes: notes.to_string(),
            lines_ingested: self.observations.records_total(),
            lines_skipped: warnings.skipped_lines,
            tpr: ratio(counts.true_positives, counts.malicious_observed),
            fpr: ratio(counts.false_positives, counts.benign_observed),
            accuracy: ratio(counts.true_positives + counts.true_negatives, labeled),
            counts,
            detection_seconds: DurationSummary::from_values(&detection_values),
            blocking_seconds: DurationSummary::from_values(&blocking_values),
            detection_by_ip,
            blocking_by_ip,
            warnings,
        };

        info!(
            "run {}: tpr={} fpr={} accuracy={} ({} intervals, {} open)",
            run_id,
            display_opt(metrics.tpr),
            display_opt(metrics.fpr),
            display_opt(metrics.accuracy),
            metrics.counts.ban_intervals,
            metrics.counts.open_intervals,
        );

        Ok(metrics)
    }

    /// An observed IP is malicious if any of its observed days is labeled
    /// malicious (earliest such record is the detection baseline), benign
    /// if it has only benign-labeled days, and unknown otherwise.
    fn classify_ip(&self, ip: IpAddr) -> IpClass {
        let Some(days) = self.observations.days(ip) else {
            return IpClass::Unknown;
        };

        let mut first_malicious: Option<DateTime<Utc>> = None;
        let mut saw_benign = false;
        for (day, observation) in days {
            match self.truth.classify(ip, *day) {
                Some(Label::Malicious) => {
                    first_malicious = Some(match first_malicious {
                        Some(existing) => existing.min(observation.first_seen),
                        None => observation.first_seen,
                    });
                }
                Some(Label::Benign) => saw_benign = true,
                None => {}
            }
        }

        match (first_malicious, saw_benign) {
            (Some(first_evidence), _) => IpClass::Malicious { first_evidence },
            (None, true) => IpClass::Benign,
            (None, false) => IpClass::Unknown,
        }
    }
}

/// `None` when the denominator is empty; 0/0 must never read as zero
fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

fn display_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.3}", v),
        None => "undefined".to_string(),
    }
}
