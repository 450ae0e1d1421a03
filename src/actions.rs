//! Parser for the detector's ban/unban action stream
//!
//! The stream is a JSON-lines file appended by the detector's action hook
//! while the replay runs. Because the hook appends live, the final record
//! may be partial; because several jails can interleave writes, arrival
//! order does not match timestamp order. Both are handled here: malformed
//! records are counted and skipped, and the trace is re-sorted by timestamp
//! before correlation.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::models::ActionEvent;

/// Load and timestamp-sort the action trace.
///
/// Returns the sorted events and the count of malformed records skipped.
/// A missing file is a data-format error (the hook writes the file on the
/// first action; scoring a run with no action stream is a setup problem),
/// but malformed individual records never abort.
pub fn load_actions<P: AsRef<Path>>(path: P) -> Result<(Vec<ActionEvent>, u64)> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        BenchError::DataFormat(format!("cannot read action stream {}: {}", path.display(), e))
    })?;

    let lines: Vec<&str> = content.lines().collect();
    let mut events = Vec::new();
    let mut malformed = 0u64;

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ActionEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                malformed += 1;
                if index + 1 == lines.len() {
                    // live-appended file; a torn final record is expected
                    debug!("partial trailing action record skipped: {}", e);
                } else {
                    warn!("malformed action record at line {}: {}", index + 1, e);
                }
            }
        }
    }

    // stable sort keeps arrival order among equal timestamps
    events.sort_by_key(|event| event.timestamp);

    Ok((events, malformed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionKind;
    use std::io::Write;

    fn write_stream(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sorts_by_timestamp() {
        let file = write_stream(concat!(
            r#"{"timestamp":"2024-12-17T10:05:00Z","action":"unban","ip":"192.0.2.1","jail":"sshd","reason":""}"#,
            "\n",
            r#"{"timestamp":"2024-12-17T10:00:00Z","action":"ban","ip":"192.0.2.1","jail":"sshd","reason":"5 failures"}"#,
            "\n",
        ));
        let (events, malformed) = load_actions(file.path()).unwrap();
        assert_eq!(malformed, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, ActionKind::Ban);
        assert_eq!(events[1].action, ActionKind::Unban);
        assert!(events[0].timestamp < events[1].timestamp);
    }

    #[test]
    fn test_partial_trailing_record_tolerated() {
        let file = write_stream(concat!(
            r#"{"timestamp":"2024-12-17T10:00:00Z","action":"ban","ip":"192.0.2.1","jail":"sshd"}"#,
            "\n",
            r#"{"timestamp":"2024-12-17T10:05:00Z","action":"un"#,
        ));
        let (events, malformed) = load_actions(file.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn test_malformed_record_mid_stream_skipped() {
        let file = write_stream(concat!(
            r#"{"timestamp":"2024-12-17T10:00:00Z","action":"ban","ip":"192.0.2.1"}"#,
            "\n",
            "not json at all\n",
            r#"{"timestamp":"2024-12-17T10:01:00Z","action":"ban","ip":"192.0.2.2"}"#,
            "\n",
        ));
        let (events, malformed) = load_actions(file.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let file = write_stream(concat!(
            "\n",
            r#"{"timestamp":"2024-12-17T10:00:00Z","action":"ban","ip":"192.0.2.1"}"#,
            "\n\n",
        ));
        let (events, malformed) = load_actions(file.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(malformed, 0);
    }

    #[test]
    fn test_missing_file_is_data_format_error() {
        let result = load_actions("/nonexistent/f2b-actions.json");
        assert!(matches!(result, Err(BenchError::DataFormat(_))));
    }
}
