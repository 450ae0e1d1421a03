use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use banbench::config::Config;
use banbench::models::RunMetrics;
use banbench::repeatability::DEFAULT_METRICS;
use banbench::Harness;

#[derive(Parser)]
#[command(name = "banbench")]
#[command(author, version, about = "Replay benchmark harness for fail2ban-style detectors")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay the source log into the detector's log pipeline
    Replay {
        /// Run identifier (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Print planned emissions instead of forwarding them
        #[arg(long)]
        dry_run: bool,

        /// Emit at most this many records
        #[arg(long)]
        max_lines: Option<u64>,

        /// Restrict replay to lines containing this substring
        #[arg(long)]
        filter_ip: Option<String>,
    },

    /// Score a finished run against the ground truth dataset
    Score {
        /// Run identifier to score
        #[arg(long)]
        run_id: String,

        /// Optional annotation stored with the run
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Cross-run repeatability of metrics in the history file
    Analyze {
        /// Only consider the most recent N runs
        #[arg(short, long)]
        window: Option<usize>,

        /// Metric names to analyze (default: all known metrics)
        #[arg(short, long)]
        metric: Vec<String>,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn display_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.4}", v),
        None => "undefined".to_string(),
    }
}

fn load_config(cli_config: &Option<PathBuf>) -> Result<Config> {
    match cli_config {
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::load_or_default()?),
    }
}

fn print_score(metrics: &RunMetrics) {
    println!("{}", format!("Run {}", metrics.run_id).bold());

    let rows = vec![
        MetricRow {
            name: "TPR".to_string(),
            value: display_metric(metrics.tpr),
        },
        MetricRow {
            name: "FPR".to_string(),
            value: display_metric(metrics.fpr),
        },
        MetricRow {
            name: "Accuracy".to_string(),
            value: display_metric(metrics.accuracy),
        },
        MetricRow {
            name: "Detection mean (s)".to_string(),
            value: display_metric(metrics.detection_seconds.as_ref().map(|s| s.mean)),
        },
        MetricRow {
            name: "Blocking mean (s)".to_string(),
            value: display_metric(metrics.blocking_seconds.as_ref().map(|s| s.mean)),
        },
        MetricRow {
            name: "Open intervals".to_string(),
            value: metrics.counts.open_intervals.to_string(),
        },
        MetricRow {
            name: "Lines ingested".to_string(),
            value: metrics.lines_ingested.to_string(),
        },
    ];
    println!("{}", Table::new(rows));

    let warning_total = metrics.warnings.total();
    if warning_total > 0 {
        println!(
            "{} {} warnings (skipped lines: {}, unmatched unbans: {}, malformed actions: {})",
            "!".yellow().bold(),
            warning_total,
            metrics.warnings.skipped_lines,
            metrics.warnings.unmatched_unbans,
            metrics.warnings.malformed_actions,
        );
    }
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Replay {
            run_id,
            dry_run,
            max_lines,
            filter_ip,
        } => {
            let mut config = config;
            if max_lines.is_some() {
                config.replay.max_lines = max_lines;
            }
            if filter_ip.is_some() {
                config.replay.ip_filter = filter_ip;
            }

            let run_id = run_id
                .or_else(|| config.general.run_id.clone())
                .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));

            let harness = Harness::new(config)?;

            // operator interrupt cancels the replay cleanly between records
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing current record");
                    let _ = shutdown_tx.send(true);
                }
            });

            let outcome = harness
                .replay(&run_id, dry_run, shutdown_rx)
                .await
                .with_context(|| format!("replay of run {} failed", run_id))?;

            let state = if outcome.cancelled {
                "cancelled".yellow()
            } else {
                "complete".green()
            };
            println!(
                "Replay {} for run {}: {} records in {:.1}s ({} skipped, {} snapshots)",
                state,
                run_id.bold(),
                outcome.emitted,
                outcome.wall_elapsed.as_secs_f64(),
                outcome.skipped_lines,
                outcome.snapshots,
            );
            println!("Next: banbench score --run-id {}", run_id);
        }

        Commands::Score { run_id, notes } => {
            let harness = Harness::new(config)?;
            let metrics = harness
                .score(&run_id, &notes)
                .with_context(|| format!("scoring run {} failed", run_id))?;
            print_score(&metrics);
        }

        Commands::Analyze { window, metric } => {
            let harness = Harness::new(config)?;
            let names: Vec<&str> = if metric.is_empty() {
                DEFAULT_METRICS.to_vec()
            } else {
                metric.iter().map(String::as_str).collect()
            };

            let dispersion = harness.analyze(&names, window)?;
            let rows: Vec<MetricRow> = dispersion
                .into_iter()
                .map(|(name, std)| MetricRow {
                    name,
                    value: display_metric(std),
                })
                .collect();

            println!("{}", "Per-metric dispersion (population std dev)".bold());
            println!("{}", Table::new(rows));
        }

        Commands::GenConfig { output } => {
            let config = Config::default();
            match output {
                Some(path) => {
                    config.save(&path)?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => {
                    let content = toml::to_string_pretty(&config)
                        .context("failed to render default config")?;
                    print!("{}", content);
                }
            }
        }
    }

    Ok(())
}
