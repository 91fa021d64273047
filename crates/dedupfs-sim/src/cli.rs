use crate::config::SimConfig;
use crate::workload::{run_workload, WorkloadReport};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dedupfs_core::{render_prometheus, DigestType};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dedupfs-sim")]
#[command(about = "dedupfs dedupe index simulator", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "DEDUPFS_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a synthetic write workload and print a report.
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        blocks: Option<u64>,
        #[arg(short, long)]
        threads: Option<u32>,
        #[arg(long)]
        duplicate_ratio: Option<f64>,
        #[arg(long)]
        pending_head_ratio: Option<f64>,
        #[arg(long)]
        free_ratio: Option<f64>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        block_size: Option<u64>,
        #[arg(long, value_parser = parse_digest)]
        digest: Option<DigestType>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Validate a config file and print the normalized dedupe settings.
    CheckConfig { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Prometheus,
}

fn parse_digest(s: &str) -> std::result::Result<DigestType, String> {
    DigestType::ALL
        .into_iter()
        .find(|d| d.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown digest '{}'", s))
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Run {
                ref config,
                blocks,
                threads,
                duplicate_ratio,
                pending_head_ratio,
                free_ratio,
                limit,
                block_size,
                digest,
                seed,
                format,
            } => {
                let mut sim = match config {
                    Some(path) => SimConfig::from_file(path)?,
                    None => SimConfig::default(),
                };
                let w = &mut sim.workload;
                if let Some(v) = blocks {
                    w.blocks = v;
                }
                if let Some(v) = threads {
                    w.threads = v;
                }
                if let Some(v) = duplicate_ratio {
                    w.duplicate_ratio = v;
                }
                if let Some(v) = pending_head_ratio {
                    w.pending_head_ratio = v;
                }
                if let Some(v) = free_ratio {
                    w.free_ratio = v;
                }
                if let Some(v) = seed {
                    w.seed = v;
                }
                if let Some(v) = limit {
                    sim.dedup.limit = v;
                }
                if let Some(v) = block_size {
                    sim.dedup.block_size = v;
                }
                if let Some(v) = digest {
                    sim.dedup.digest = v;
                }
                let report = run_workload(&sim)?;
                println!("{}", render_report(&report, format)?);
                Ok(())
            }
            Command::CheckConfig { ref path } => {
                let sim = SimConfig::from_file(path)?;
                let dedup = sim.validate()?;
                println!("{}", serde_json::to_string_pretty(&dedup)?);
                Ok(())
            }
        }
    }
}

/// Format a report for stdout.
pub fn render_report(report: &WorkloadReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Prometheus => {
            let metrics = report.status.metrics.collect(report.status.entries as u64);
            Ok(render_prometheus(&metrics))
        }
    }
}
