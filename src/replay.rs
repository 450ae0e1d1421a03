//! Timed log replay against a live detector
//!
//! A single cooperative task paces records into an external line sink at
//! `min(gap / speed_factor, sleep_cap)` per recorded gap; the capped sleeps
//! and the synchronous status queries are its only suspension points, so no
//! two emissions ever overlap and no partial record is ever written. The
//! detector reacts on its own schedule; the scheduler only observes it
//! through periodic ban-list snapshots.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::artifacts::RunDir;
use crate::config::{SinkConfig, StatusConfig};
use crate::error::{BenchError, Result};
use crate::models::{BannedIp, JailStatus};
use crate::source::{LogReader, ObservationIndex};

/// Line-forwarding target for replayed records, one call per record.
/// A write failure is fatal to the run: later events would be silently
/// lost by the detector otherwise.
#[async_trait]
pub trait LogSink: Send {
    async fn emit(&mut self, line: &str) -> Result<()>;
}

/// Synchronous detector status query for a named jail
#[async_trait]
pub trait StatusProbe: Send {
    async fn query(&mut self, jail: &str) -> Result<JailStatus>;
}

/// Pipes each record into a configured `logger`-style command
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl LogSink for CommandSink {
    async fn emit(&mut self, line: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BenchError::SinkWrite(format!("spawn {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BenchError::SinkWrite("sink stdin unavailable".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BenchError::SinkWrite(format!("write to {}: {}", self.program, e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| BenchError::SinkWrite(format!("write to {}: {}", self.program, e)))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| BenchError::SinkWrite(format!("wait for {}: {}", self.program, e)))?;
        if !status.success() {
            return Err(BenchError::SinkWrite(format!(
                "{} exited with {}",
                self.program, status
            )));
        }
        Ok(())
    }
}

/// Dry-run sink: prints planned emissions instead of forwarding them
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl LogSink for StdoutSink {
    async fn emit(&mut self, line: &str) -> Result<()> {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}", line).map_err(|e| BenchError::SinkWrite(e.to_string()))
    }
}

/// In-memory sink for tests and plumbing checks
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|guard| guard.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for VecSink {
    async fn emit(&mut self, line: &str) -> Result<()> {
        self.lines
            .lock()
            .map_err(|_| BenchError::SinkWrite("sink mutex poisoned".to_string()))?
            .push(line.to_string());
        Ok(())
    }
}

/// Probe that reports an empty ban list; used for dry runs where no
/// detector is attached
#[derive(Debug, Default)]
pub struct NullProbe;

#[async_trait]
impl StatusProbe for NullProbe {
    async fn query(&mut self, jail: &str) -> Result<JailStatus> {
        Ok(JailStatus {
            queried_at: Utc::now(),
            jail: jail.to_string(),
            banned: Vec::new(),
        })
    }
}

/// Queries the detector's client binary for the jail's ban list
pub struct Fail2banClient {
    program: String,
}

impl Fail2banClient {
    pub fn new(config: &StatusConfig) -> Self {
        Self {
            program: config.client_command.clone(),
        }
    }
}

#[async_trait]
impl StatusProbe for Fail2banClient {
    async fn query(&mut self, jail: &str) -> Result<JailStatus> {
        let output = Command::new(&self.program)
            .args(["get", jail, "banip", "--with-time"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(BenchError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} exited with {}", self.program, output.status),
            )));
        }
        Ok(parse_banip_with_time(
            &String::from_utf8_lossy(&output.stdout),
            jail,
        ))
    }
}

/// Parse `fail2ban-client get <jail> banip --with-time` output.
///
/// Lenient on purpose: builds differ in this format, and snapshots are
/// observability data rather than metrics input. The first token of a line
/// must be an IP; a following `YYYY-MM-DD HH:MM:SS` pair becomes the ban
/// time when present.
pub fn parse_banip_with_time(output: &str, jail: &str) -> JailStatus {
    let mut banned = Vec::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { continue };
        let Ok(ip) = first.parse::<IpAddr>() else { continue };

        let rest: Vec<&str> = parts.collect();
        let ban_time = if rest.len() >= 2 {
            NaiveDateTime::parse_from_str(
                &format!("{} {}", rest[0], rest[1]),
                "%Y-%m-%d %H:%M:%S",
            )
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
        } else {
            None
        };
        banned.push(BannedIp { ip, ban_time });
    }
    JailStatus {
        queried_at: Utc::now(),
        jail: jail.to_string(),
        banned,
    }
}

/// Scheduler knobs, resolved from the validated configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub speed_factor: f64,
    pub sleep_cap: Duration,
    pub status_interval: u64,
    pub jail: String,
}

/// What a replay did, whether it ran to completion or was cancelled
#[derive(Debug)]
pub struct ReplayOutcome {
    pub emitted: u64,
    pub skipped_lines: u64,
    pub non_monotonic: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub wall_elapsed: Duration,
    pub cancelled: bool,
    pub snapshots: u64,
    pub status_failures: u64,
    pub observations: ObservationIndex,
}

pub struct ReplayScheduler<S, P> {
    config: SchedulerConfig,
    sink: S,
    probe: P,
}

impl<S: LogSink, P: StatusProbe> ReplayScheduler<S, P> {
    pub fn new(config: SchedulerConfig, sink: S, probe: P) -> Self {
        Self {
            config,
            sink,
            probe,
        }
    }

    /// Drive one replay pass.
    ///
    /// Cancellation via the shutdown channel takes effect between records:
    /// the current record is either fully emitted or not emitted at all,
    /// and the final status snapshot is still taken so the partial run
    /// stays usable.
    pub async fn run(
        &mut self,
        mut reader: LogReader,
        run_dir: &RunDir,
        mut observations: ObservationIndex,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReplayOutcome> {
        let started = Instant::now();
        let mut emitted = 0u64;
        let mut cancelled = false;
        let mut snapshots = 0u64;
        let mut status_failures = 0u64;
        let mut first_timestamp: Option<DateTime<Utc>> = None;
        let mut last_timestamp: Option<DateTime<Utc>> = None;

        self.snapshot(run_dir, "before", &mut snapshots, &mut status_failures)
            .await;
        self.progress(
            run_dir,
            &format!(
                "replay start speed_factor={} sleep_cap={:.3}s status_interval={}",
                self.config.speed_factor,
                self.config.sleep_cap.as_secs_f64(),
                self.config.status_interval
            ),
        );

        'replay: while let Some(record) = reader.next() {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }

            if let Some(previous) = last_timestamp {
                // negative or zero gap (out-of-order or duplicate
                // timestamps) emits immediately
                let gap = (record.timestamp - previous)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let nap = gap.div_f64(self.config.speed_factor).min(self.config.sleep_cap);
                if !nap.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                cancelled = true;
                                break 'replay;
                            }
                        }
                    }
                }
            }

            if let Err(e) = self.sink.emit(&record.raw_line).await {
                self.progress(run_dir, &format!("aborted after {} records: {}", emitted, e));
                return Err(e);
            }
            emitted += 1;
            observations.observe(&record);
            first_timestamp.get_or_insert(record.timestamp);
            last_timestamp = Some(record.timestamp);

            if self.config.status_interval > 0 && emitted % self.config.status_interval == 0 {
                let label = format!("at_{:08}", emitted);
                self.snapshot(run_dir, &label, &mut snapshots, &mut status_failures)
                    .await;
                self.progress(
                    run_dir,
                    &format!(
                        "emitted={} last_ts={} elapsed={:.1}s",
                        emitted,
                        record.timestamp,
                        started.elapsed().as_secs_f64()
                    ),
                );
            }
        }

        self.snapshot(run_dir, "after", &mut snapshots, &mut status_failures)
            .await;
        self.progress(
            run_dir,
            &format!(
                "finished emitted={} skipped={} cancelled={} elapsed={:.1}s",
                emitted,
                reader.skipped_lines,
                cancelled,
                started.elapsed().as_secs_f64()
            ),
        );
        info!(
            "replay {}: emitted {} records in {:.1}s ({} skipped)",
            if cancelled { "cancelled" } else { "complete" },
            emitted,
            started.elapsed().as_secs_f64(),
            reader.skipped_lines
        );

        Ok(ReplayOutcome {
            emitted,
            skipped_lines: reader.skipped_lines,
            non_monotonic: reader.non_monotonic,
            first_timestamp,
            last_timestamp,
            wall_elapsed: started.elapsed(),
            cancelled,
            snapshots,
            status_failures,
            observations,
        })
    }

    /// Status snapshots observe the detector; they must not kill a replay.
    /// Failures are counted and logged, emission continues.
    async fn snapshot(
        &mut self,
        run_dir: &RunDir,
        label: &str,
        snapshots: &mut u64,
        failures: &mut u64,
    ) {
        match self.probe.query(&self.config.jail).await {
            Ok(status) => match run_dir.write_snapshot(label, &status) {
                Ok(_) => *snapshots += 1,
                Err(e) => {
                    *failures += 1;
                    warn!("failed to persist status snapshot {}: {}", label, e);
                }
            },
            Err(e) => {
                *failures += 1;
                warn!("status query {} failed: {}", label, e);
            }
        }
    }

    fn progress(&self, run_dir: &RunDir, line: &str) {
        if let Err(e) = run_dir.append_progress(line) {
            warn!("failed to append progress line: {}", e);
        }
    }
}
