//! Lazy, ordered reader for the captured source log
//!
//! Produces [`LogRecord`]s in file order, single pass; each replay opens a
//! fresh reader. Syslog-style timestamps carry no year, so the reader infers
//! one from a hint and carries it forward across a December wrap. Malformed
//! lines are skipped and counted, never fatal; non-monotonic timestamps are
//! counted but records are never reordered.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::models::LogRecord;

/// Per-replay reader knobs
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Year assumed for the first record; defaults to the current year
    pub start_year: Option<i32>,
    /// Restrict replay to lines containing this substring (usually an IP)
    pub ip_filter: Option<String>,
    /// Stop after this many records (smoke tests)
    pub max_lines: Option<u64>,
}

/// Streaming reader over one source log file
pub struct LogReader {
    lines: Lines<BufReader<File>>,
    timestamp_re: Regex,
    ip_re: Regex,
    opts: ReaderOptions,
    year_hint: i32,
    previous: Option<NaiveDateTime>,
    emitted: u64,
    /// Lines without a parseable timestamp, skipped
    pub skipped_lines: u64,
    /// Timestamps that went backwards relative to the previous record
    pub non_monotonic: u64,
}

impl LogReader {
    /// Open a fresh single-pass sequence over the log
    pub fn open<P: AsRef<Path>>(path: P, opts: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            BenchError::DataFormat(format!("cannot open source log {}: {}", path.display(), e))
        })?;

        let timestamp_re =
            Regex::new(r"^(?P<mon>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<hh>\d{2}):(?P<mm>\d{2}):(?P<ss>\d{2})")
                .map_err(|e| BenchError::DataFormat(format!("timestamp pattern: {}", e)))?;
        let ip_re = Regex::new(r"(?P<ip>(?:\d{1,3}\.){3}\d{1,3})")
            .map_err(|e| BenchError::DataFormat(format!("ip pattern: {}", e)))?;

        let year_hint = opts.start_year.unwrap_or_else(|| Utc::now().year());

        Ok(Self {
            lines: BufReader::new(file).lines(),
            timestamp_re,
            ip_re,
            opts,
            year_hint,
            previous: None,
            emitted: 0,
            skipped_lines: 0,
            non_monotonic: 0,
        })
    }

    /// Parse the syslog timestamp prefix, inferring the year: carry the
    /// hint forward, bump it across a December to January wrap, and never
    /// step a record back to an earlier year than its predecessor.
    fn parse_timestamp(&self, line: &str) -> Option<NaiveDateTime> {
        let captures = self.timestamp_re.captures(line)?;
        let month = month_number(captures.name("mon")?.as_str())?;
        let day: u32 = captures.name("day")?.as_str().parse().ok()?;
        let hour: u32 = captures.name("hh")?.as_str().parse().ok()?;
        let minute: u32 = captures.name("mm")?.as_str().parse().ok()?;
        let second: u32 = captures.name("ss")?.as_str().parse().ok()?;

        let mut candidate = NaiveDate::from_ymd_opt(self.year_hint, month, day)?
            .and_hms_opt(hour, minute, second)?;

        if let Some(previous) = self.previous {
            if candidate < previous && month == 1 && previous.month() == 12 {
                candidate = candidate.with_year(previous.year() + 1)?;
            } else if candidate.year() < previous.year() {
                candidate = candidate.with_year(previous.year())?;
            }
        }
        Some(candidate)
    }
}

impl Iterator for LogReader {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        if let Some(max) = self.opts.max_lines {
            if self.emitted >= max {
                return None;
            }
        }

        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!("read error in source log, stopping: {}", e);
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Some(filter) = &self.opts.ip_filter {
                if !line.contains(filter.as_str()) {
                    continue;
                }
            }

            let naive = match self.parse_timestamp(&line) {
                Some(ts) => ts,
                None => {
                    self.skipped_lines += 1;
                    let head: String = line.chars().take(48).collect();
                    debug!("skipping unparseable line: {:?}", head);
                    continue;
                }
            };

            if let Some(previous) = self.previous {
                if naive < previous {
                    self.non_monotonic += 1;
                    if self.non_monotonic == 1 {
                        warn!(
                            "non-monotonic timestamp in source log ({} after {}); keeping file order",
                            naive, previous
                        );
                    }
                }
            }
            self.previous = Some(naive);
            self.year_hint = naive.year();

            let source_ip = self
                .ip_re
                .captures(&line)
                .and_then(|c| c.name("ip"))
                .and_then(|m| m.as_str().parse::<IpAddr>().ok());

            self.emitted += 1;
            return Some(LogRecord {
                timestamp: Utc.from_utc_datetime(&naive),
                source_ip,
                raw_line: line,
            });
        }
    }
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}

/// Per-IP observation of one calendar day under the dataset's day convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayObservation {
    pub first_seen: DateTime<Utc>,
    pub count: u64,
}

/// First-seen timestamps and record counts per (ip, day)
///
/// This is the "observed in the run" side of the metric denominators and
/// the detection-time baseline. Only records carrying a source address are
/// indexed; the total record count covers every replayed line.
#[derive(Debug, Clone)]
pub struct ObservationIndex {
    offset: FixedOffset,
    by_ip: HashMap<IpAddr, BTreeMap<NaiveDate, DayObservation>>,
    records_total: u64,
}

impl ObservationIndex {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            by_ip: HashMap::new(),
            records_total: 0,
        }
    }

    pub fn observe(&mut self, record: &LogRecord) {
        self.records_total += 1;
        let Some(ip) = record.source_ip else {
            return;
        };
        let day = record.timestamp.with_timezone(&self.offset).date_naive();
        let days = self.by_ip.entry(ip).or_default();
        match days.get_mut(&day) {
            Some(observation) => {
                observation.count += 1;
                if record.timestamp < observation.first_seen {
                    observation.first_seen = record.timestamp;
                }
            }
            None => {
                days.insert(
                    day,
                    DayObservation {
                        first_seen: record.timestamp,
                        count: 1,
                    },
                );
            }
        }
    }

    /// Build an index by draining a reader (batch scoring path)
    pub fn ingest(&mut self, reader: &mut LogReader) {
        for record in reader.by_ref() {
            self.observe(&record);
        }
    }

    pub fn records_total(&self) -> u64 {
        self.records_total
    }

    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.by_ip.keys().copied()
    }

    pub fn days(&self, ip: IpAddr) -> Option<&BTreeMap<NaiveDate, DayObservation>> {
        self.by_ip.get(&ip)
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn opts_for(year: i32) -> ReaderOptions {
        ReaderOptions {
            start_year: Some(year),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_basic_line() {
        let file = write_log(
            "Dec 17 10:00:00 host sshd[1234]: Failed password for root from 192.0.2.1 port 22 ssh2\n",
        );
        let mut reader = LogReader::open(file.path(), opts_for(2024)).unwrap();
        let record = reader.next().unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 12, 17, 10, 0, 0).unwrap()
        );
        assert_eq!(record.source_ip, Some("192.0.2.1".parse().unwrap()));
        assert!(record.raw_line.contains("Failed password"));
        assert!(reader.next().is_none());
        assert_eq!(reader.skipped_lines, 0);
    }

    #[test]
    fn test_malformed_line_skipped_and_counted() {
        let file = write_log(
            "Dec 17 10:00:00 host sshd[1]: ok from 192.0.2.1\n\
             totally malformed line\n\
             Dec 17 10:00:05 host sshd[1]: ok from 192.0.2.1\n",
        );
        let mut reader = LogReader::open(file.path(), opts_for(2024)).unwrap();
        let records: Vec<_> = reader.by_ref().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.skipped_lines, 1);
    }

    #[test]
    fn test_year_rollover_december_to_january() {
        let file = write_log(
            "Dec 31 23:59:58 host sshd[1]: a from 192.0.2.1\n\
             Jan  1 00:00:03 host sshd[1]: b from 192.0.2.1\n",
        );
        let mut reader = LogReader::open(file.path(), opts_for(2024)).unwrap();
        let a = reader.next().unwrap();
        let b = reader.next().unwrap();
        assert_eq!(a.timestamp.year(), 2024);
        assert_eq!(b.timestamp.year(), 2025);
        assert!(b.timestamp > a.timestamp);
        assert_eq!(reader.non_monotonic, 0);
    }

    #[test]
    fn test_non_monotonic_counted_not_reordered() {
        let file = write_log(
            "Dec 17 10:00:05 host sshd[1]: a from 192.0.2.1\n\
             Dec 17 10:00:01 host sshd[1]: b from 192.0.2.2\n",
        );
        let mut reader = LogReader::open(file.path(), opts_for(2024)).unwrap();
        let records: Vec<_> = reader.by_ref().collect();
        assert_eq!(records.len(), 2);
        // file order kept
        assert!(records[0].timestamp > records[1].timestamp);
        assert_eq!(reader.non_monotonic, 1);
    }

    #[test]
    fn test_ip_filter_and_max_lines() {
        let file = write_log(
            "Dec 17 10:00:00 host sshd[1]: a from 192.0.2.1\n\
             Dec 17 10:00:01 host sshd[1]: b from 198.51.100.9\n\
             Dec 17 10:00:02 host sshd[1]: c from 192.0.2.1\n\
             Dec 17 10:00:03 host sshd[1]: d from 192.0.2.1\n",
        );
        let opts = ReaderOptions {
            start_year: Some(2024),
            ip_filter: Some("192.0.2.1".to_string()),
            max_lines: Some(2),
        };
        let reader = LogReader::open(file.path(), opts).unwrap();
        let records: Vec<_> = reader.collect();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.source_ip == Some("192.0.2.1".parse().unwrap())));
    }

    #[test]
    fn test_line_without_ip_still_replays() {
        let file = write_log("Dec 17 10:00:00 host sshd[1]: Server listening on port 22\n");
        let mut reader = LogReader::open(file.path(), opts_for(2024)).unwrap();
        let record = reader.next().unwrap();
        assert_eq!(record.source_ip, None);
    }

    #[test]
    fn test_observation_index_day_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut index = ObservationIndex::new(offset);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        // 23:30 UTC lands on the next calendar day at UTC+2
        let late = LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 12, 17, 23, 30, 0).unwrap(),
            source_ip: Some(ip),
            raw_line: String::new(),
        };
        index.observe(&late);

        let days = index.days(ip).unwrap();
        assert!(days.contains_key(&NaiveDate::from_ymd_opt(2024, 12, 18).unwrap()));
        assert_eq!(index.records_total(), 1);
    }

    #[test]
    fn test_observation_index_first_seen_and_counts() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let mut index = ObservationIndex::new(offset);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();

        for second in [30u32, 10, 50] {
            index.observe(&LogRecord {
                timestamp: Utc.with_ymd_and_hms(2024, 12, 17, 10, 0, second).unwrap(),
                source_ip: Some(ip),
                raw_line: String::new(),
            });
        }

        let observation = index.days(ip).unwrap().get(&day).unwrap();
        assert_eq!(observation.count, 3);
        assert_eq!(
            observation.first_seen,
            Utc.with_ymd_and_hms(2024, 12, 17, 10, 0, 10).unwrap()
        );
    }
}
