//! Labeled ground truth for scoring detector decisions
//!
//! The dataset is a columnar CSV with at least `ip`, `day` and `label`
//! columns, located by header name in any order. Labels are normalized
//! (`ATTACK*` counts as malicious, `UNKNOWN` rows are excluded) so raw
//! benchmark exports load unchanged.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::models::{Label, RunWarnings};

/// In-memory (ip, day) -> label lookup, read-only after load
#[derive(Debug, Clone)]
pub struct GroundTruth {
    labels: HashMap<(IpAddr, NaiveDate), Label>,
    offset: FixedOffset,
    /// Row-level anomalies observed during load
    pub warnings: RunWarnings,
}

impl GroundTruth {
    /// Load the dataset. Missing required columns are fatal; individual bad
    /// rows are counted and skipped. Duplicate (ip, day) keys keep the
    /// first-seen label; a conflicting duplicate is a warning, not an error,
    /// since source exports carry duplicate rows by design.
    pub fn load<P: AsRef<Path>>(path: P, offset: FixedOffset) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            BenchError::DataFormat(format!("cannot open ground truth {}: {}", path.display(), e))
        })?;
        let mut lines = BufReader::new(file).lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => {
                return Err(BenchError::DataFormat(format!(
                    "ground truth {} is empty",
                    path.display()
                )))
            }
        };
        let columns = locate_columns(&header).ok_or_else(|| {
            BenchError::DataFormat(format!(
                "ground truth {} is missing one of the required columns ip, day, label",
                path.display()
            ))
        })?;

        let mut store = Self {
            labels: HashMap::new(),
            offset,
            warnings: RunWarnings::default(),
        };

        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();

            let ip_field = fields.get(columns.ip).map(|s| s.trim()).unwrap_or("");
            let day_field = fields.get(columns.day).map(|s| s.trim()).unwrap_or("");
            let label_field = fields.get(columns.label).map(|s| s.trim()).unwrap_or("");

            let ip: IpAddr = match ip_field.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    store.warnings.malformed_rows += 1;
                    debug!("skipping ground truth row with bad ip: {:?}", ip_field);
                    continue;
                }
            };
            let day = match parse_day(day_field) {
                Some(day) => day,
                None => {
                    store.warnings.malformed_rows += 1;
                    debug!("skipping ground truth row with bad day: {:?}", day_field);
                    continue;
                }
            };
            let label = match normalize_label(label_field) {
                Some(label) => label,
                None => {
                    store.warnings.unknown_labels += 1;
                    continue;
                }
            };

            match store.labels.get(&(ip, day)) {
                None => {
                    store.labels.insert((ip, day), label);
                }
                Some(existing) if *existing == label => {}
                Some(existing) => {
                    store.warnings.duplicate_labels += 1;
                    warn!(
                        "conflicting labels for ({}, {}): keeping {}, ignoring {}",
                        ip, day, existing, label
                    );
                }
            }
        }

        Ok(store)
    }

    /// Label for an (ip, day) key; `None` means the key is absent from the
    /// dataset and the IP is excluded from rate denominators for that day.
    pub fn classify(&self, ip: IpAddr, day: NaiveDate) -> Option<Label> {
        self.labels.get(&(ip, day)).copied()
    }

    /// Calendar day of a timestamp under the configured day-boundary offset
    pub fn day_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.offset).date_naive()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

struct ColumnIndexes {
    ip: usize,
    day: usize,
    label: usize,
}

fn locate_columns(header: &str) -> Option<ColumnIndexes> {
    let mut ip = None;
    let mut day = None;
    let mut label = None;
    for (idx, name) in header.split(',').enumerate() {
        match name.trim().to_ascii_lowercase().as_str() {
            "ip" | "src_ip" => ip = ip.or(Some(idx)),
            "day" => day = day.or(Some(idx)),
            "label" => label = label.or(Some(idx)),
            _ => {}
        }
    }
    Some(ColumnIndexes {
        ip: ip?,
        day: day?,
        label: label?,
    })
}

/// Accepted day encodings, tried in order
const DAY_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
const DAY_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M"];

fn parse_day(value: &str) -> Option<NaiveDate> {
    for fmt in DAY_FORMATS {
        if let Ok(day) = NaiveDate::parse_from_str(value, fmt) {
            return Some(day);
        }
    }
    for fmt in DAY_TIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Label normalization: `ATTACK*` exports count as malicious, `UNKNOWN`
/// rows carry no usable label, everything else is benign.
fn normalize_label(value: &str) -> Option<Label> {
    let upper = value.to_ascii_uppercase();
    if upper.contains("ATTACK") || upper == "MALICIOUS" {
        Some(Label::Malicious)
    } else if upper.contains("UNKNOWN") {
        None
    } else {
        Some(Label::Benign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn write_dataset(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_load_and_classify() {
        let file = write_dataset(
            "ip,day,label\n\
             192.0.2.1,2024-12-17,malicious\n\
             192.0.2.2,2024-12-17,benign\n",
        );
        let gt = GroundTruth::load(file.path(), utc()).unwrap();
        assert_eq!(gt.len(), 2);

        let day = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();
        assert_eq!(
            gt.classify("192.0.2.1".parse().unwrap(), day),
            Some(Label::Malicious)
        );
        assert_eq!(
            gt.classify("192.0.2.2".parse().unwrap(), day),
            Some(Label::Benign)
        );
        assert_eq!(gt.classify("192.0.2.3".parse().unwrap(), day), None);
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let file = write_dataset("ip,label\n192.0.2.1,malicious\n");
        assert!(matches!(
            GroundTruth::load(file.path(), utc()),
            Err(BenchError::DataFormat(_))
        ));
    }

    #[test]
    fn test_header_order_and_extra_columns() {
        let file = write_dataset(
            "label,confidence,day,src_ip\n\
             SSH-ATTACK,0.9,17/12/2024,192.0.2.1\n",
        );
        let gt = GroundTruth::load(file.path(), utc()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();
        assert_eq!(
            gt.classify("192.0.2.1".parse().unwrap(), day),
            Some(Label::Malicious)
        );
    }

    #[test]
    fn test_conflicting_duplicate_keeps_first() {
        let file = write_dataset(
            "ip,day,label\n\
             192.0.2.1,2024-12-17,malicious\n\
             192.0.2.1,2024-12-17,malicious\n\
             192.0.2.1,2024-12-17,benign\n",
        );
        let gt = GroundTruth::load(file.path(), utc()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();
        assert_eq!(
            gt.classify("192.0.2.1".parse().unwrap(), day),
            Some(Label::Malicious)
        );
        // identical duplicate is tolerated silently, only the conflict counts
        assert_eq!(gt.warnings.duplicate_labels, 1);
    }

    #[test]
    fn test_unknown_and_malformed_rows_counted() {
        let file = write_dataset(
            "ip,day,label\n\
             192.0.2.1,2024-12-17,UNKNOWN\n\
             not-an-ip,2024-12-17,benign\n\
             192.0.2.2,someday,benign\n",
        );
        let gt = GroundTruth::load(file.path(), utc()).unwrap();
        assert!(gt.is_empty());
        assert_eq!(gt.warnings.unknown_labels, 1);
        assert_eq!(gt.warnings.malformed_rows, 2);
    }

    #[test]
    fn test_day_boundary_offset() {
        let gt = GroundTruth {
            labels: HashMap::new(),
            offset: FixedOffset::east_opt(2 * 3600).unwrap(),
            warnings: RunWarnings::default(),
        };
        // 23:30 UTC is already the next day at UTC+2
        let ts = Utc.with_ymd_and_hms(2024, 12, 17, 23, 30, 0).unwrap();
        assert_eq!(gt.day_of(ts), NaiveDate::from_ymd_opt(2024, 12, 18).unwrap());

        let noon = Utc.with_ymd_and_hms(2024, 12, 17, 12, 0, 0).unwrap();
        assert_eq!(gt.day_of(noon), NaiveDate::from_ymd_opt(2024, 12, 17).unwrap());
    }
}
