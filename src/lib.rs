pub mod actions;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod ground_truth;
pub mod history;
pub mod metrics;
pub mod models;
pub mod repeatability;
pub mod replay;
pub mod source;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use artifacts::{RunDir, RunManifest};
use config::Config;
use error::Result;
use ground_truth::GroundTruth;
use history::HistoryStore;
use metrics::MetricsEngine;
use models::{RunMetrics, RunWarnings};
use replay::{
    CommandSink, Fail2banClient, NullProbe, ReplayOutcome, ReplayScheduler, SchedulerConfig,
    StdoutSink,
};
use source::{LogReader, ObservationIndex, ReaderOptions};

/// Core benchmark harness
///
/// Owns the validated configuration and wires the components together:
/// reader into scheduler for the replay pass, ground truth plus action
/// trace into the metrics engine for scoring, and history into the
/// repeatability analysis.
pub struct Harness {
    config: Config,
}

impl Harness {
    /// Create a harness; configuration problems are rejected here, before
    /// any replay or scoring starts
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            start_year: self.config.replay.start_year,
            ip_filter: self.config.replay.ip_filter.clone(),
            max_lines: self.config.replay.max_lines,
        }
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            speed_factor: self.config.replay.speed_factor,
            sleep_cap: Duration::from_secs_f64(self.config.replay.sleep_cap_secs),
            status_interval: self.config.replay.status_interval,
            jail: self.config.status.jail.clone(),
        }
    }

    /// Replay the source log into the detector's log pipeline.
    ///
    /// `dry_run` prints planned emissions instead of forwarding them and
    /// queries no detector. Cancellation through the shutdown channel still
    /// produces usable partial artifacts.
    pub async fn replay(
        &self,
        run_id: &str,
        dry_run: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ReplayOutcome> {
        let offset = self.config.ground_truth.offset()?;
        let opts = self.reader_options();
        let source_log = &self.config.general.source_log;

        // the source is restartable: a throwaway pass recovers the virtual
        // clock epoch before the replay pass opens its own sequence
        let virtual_epoch = LogReader::open(source_log, opts.clone())?
            .next()
            .map(|record| record.timestamp);

        let run_dir = RunDir::create(&self.config.general.output_dir, run_id)?;
        run_dir.write_manifest(&RunManifest {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            source_log: source_log.clone(),
            dataset: self.config.ground_truth.dataset.clone(),
            jail: self.config.status.jail.clone(),
            speed_factor: self.config.replay.speed_factor,
            sleep_cap_secs: self.config.replay.sleep_cap_secs,
            status_interval: self.config.replay.status_interval,
            clock_override: self.config.replay.clock_override,
            virtual_epoch: if self.config.replay.clock_override {
                virtual_epoch
            } else {
                None
            },
        })?;

        let reader = LogReader::open(source_log, opts)?;
        let observations = ObservationIndex::new(offset);

        let outcome = if dry_run {
            info!("dry run: printing emissions for run {}", run_id);
            let mut scheduler =
                ReplayScheduler::new(self.scheduler_config(), StdoutSink, NullProbe);
            scheduler.run(reader, &run_dir, observations, shutdown).await?
        } else {
            let sink = CommandSink::new(&self.config.sink);
            let probe = Fail2banClient::new(&self.config.status);
            let mut scheduler = ReplayScheduler::new(self.scheduler_config(), sink, probe);
            scheduler.run(reader, &run_dir, observations, shutdown).await?
        };

        Ok(outcome)
    }

    /// Score a run: correlate ground truth, replay observations and the
    /// detector's action trace, persist `metrics.json` and extend the
    /// cross-run history.
    pub fn score(&self, run_id: &str, notes: &str) -> Result<RunMetrics> {
        let offset = self.config.ground_truth.offset()?;
        let truth = GroundTruth::load(&self.config.ground_truth.dataset, offset)?;

        let (events, malformed_actions) = actions::load_actions(&self.config.general.actions_log)?;

        let mut reader = LogReader::open(&self.config.general.source_log, self.reader_options())?;
        let mut observations = ObservationIndex::new(offset);
        observations.ingest(&mut reader);

        let mut warnings = RunWarnings {
            skipped_lines: reader.skipped_lines,
            non_monotonic_timestamps: reader.non_monotonic,
            malformed_actions,
            ..Default::default()
        };
        warnings.merge(&truth.warnings);

        let engine = MetricsEngine::new(&truth, &observations);
        let metrics = engine.compute(&events, run_id, notes, warnings)?;

        let run_dir = RunDir::create(&self.config.general.output_dir, run_id)?;
        run_dir.write_metrics(&metrics)?;
        if let Some(detector_log) = &self.config.general.detector_log {
            run_dir.copy_detector_log(detector_log)?;
        }

        HistoryStore::new(&self.config.general.history_file).append(&metrics)?;
        info!("scored run {} -> {}", run_id, run_dir.path().display());
        Ok(metrics)
    }

    /// Cross-run dispersion of the named metrics over the history store
    pub fn analyze(
        &self,
        metric_names: &[&str],
        window: Option<usize>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        let history = HistoryStore::new(&self.config.general.history_file).read_all()?;
        if history.is_empty() {
            warn!(
                "history {} is empty; nothing to analyze",
                self.config.general.history_file
            );
        }
        Ok(repeatability::analyze(&history, metric_names, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchError;

    #[test]
    fn test_harness_rejects_invalid_config() {
        let mut config = Config::default();
        config.replay.speed_factor = -1.0;
        assert!(matches!(
            Harness::new(config),
            Err(BenchError::Configuration(_))
        ));
    }

    #[test]
    fn test_harness_accepts_defaults() {
        assert!(Harness::new(Config::default()).is_ok());
    }
}
