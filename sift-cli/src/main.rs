//! sift CLI
//!
//! Normalize, deduplicate and filter threat indicators from feed dumps.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sift_core::{normalize, IndicatorType, PatternKind};
use sift_store::{
    load_rule_file, parse_indicator_reports, IndicatorQuery, IngestReport, SiftConfig, Snapshot,
    ThreatIntelService,
};

#[derive(Parser)]
#[command(name = "sift")]
#[command(author, version, about = "sift: threat indicator normalization, deduplication and exclusion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,

    /// TOML configuration file (or set SIFT_CONFIG env var)
    #[arg(short, long, env = "SIFT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical form of each value
    Normalize {
        /// Indicator type (ip, domain, url, hash, email, cve, ...)
        #[arg(short = 't', long = "type")]
        indicator_type: IndicatorType,

        values: Vec<String>,
    },

    /// Collapse duplicates in a snapshot
    Dedup {
        /// Snapshot to read (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the deduplicated snapshot (default: overwrite input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ingest feed reports and print the served indicators
    Ingest {
        /// Feed files, each a JSON array of reports
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Existing snapshot to merge into
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Exclusion rules to apply (JSON or CSV)
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Serve excluded indicators too
        #[arg(long)]
        include_excluded: bool,

        /// Collapse duplicates after ingesting
        #[arg(long)]
        dedup: bool,

        /// Where to write the resulting snapshot (default: snapshot_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check whether a value is excluded by a rule file
    Check {
        #[arg(short = 't', long = "type")]
        indicator_type: IndicatorType,

        value: String,

        /// Exclusion rules (JSON or CSV)
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Preview which stored indicators a pattern would exclude
    TestPattern {
        pattern: String,

        /// Pattern kind (exact, regex, wildcard)
        #[arg(short, long, default_value = "exact")]
        kind: PatternKind,

        /// Only consider indicators of this type
        #[arg(short = 't', long = "type")]
        indicator_type: Option<IndicatorType>,

        /// Snapshot to test against
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    /// Match an observed value against known indicators
    Compare {
        value: String,

        /// Snapshot to compare against
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Exclusion rules to apply before matching
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Show store and rule statistics for a snapshot
    Stats {
        #[arg(short, long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => SiftConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SiftConfig::default(),
    };

    match cli.command {
        Commands::Normalize {
            indicator_type,
            values,
        } => {
            for value in values {
                println!("{}", normalize(&indicator_type, &value));
            }
        }
        Commands::Dedup { input, output } => {
            let service = open_service(config, Some(&input), None)?;
            let report = service.deduplicate();
            println!("{}", serde_json::to_string_pretty(&report)?);
            save_snapshot(&service, output.as_deref().unwrap_or(&input))?;
        }
        Commands::Ingest {
            files,
            snapshot,
            rules,
            include_excluded,
            dedup,
            output,
        } => {
            let service = Arc::new(open_service(config, snapshot.as_deref(), rules.as_deref())?);
            run_ingest(&service, files).await?;

            if dedup {
                let report = service.deduplicate();
                if !report.is_complete() {
                    warn!("{} planned duplicates could not be applied", report.failed);
                }
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
            }

            let served = service.query(&IndicatorQuery {
                include_excluded,
                limit: Some(service.config().query.max_limit),
                ..Default::default()
            });
            println!("{}", serde_json::to_string_pretty(&served)?);

            let output_path = output.unwrap_or_else(|| {
                let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
                PathBuf::from(format!("snapshot_{}.json", timestamp))
            });
            save_snapshot(&service, &output_path)?;
        }
        Commands::Check {
            indicator_type,
            value,
            rules,
        } => {
            let service = open_service(config, None, Some(&rules))?;
            if service.is_excluded(&indicator_type, &value) {
                println!("excluded");
            } else {
                println!("not excluded");
            }
        }
        Commands::TestPattern {
            pattern,
            kind,
            indicator_type,
            snapshot,
        } => {
            let service = open_service(config, Some(&snapshot), None)?;
            let preview = service.test_rule_pattern(&pattern, kind, indicator_type.as_ref());
            if let Some(reason) = &preview.result.invalid {
                warn!("Pattern {:?} is invalid and would never match: {}", pattern, reason);
            }
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::Compare {
            value,
            snapshot,
            rules,
        } => {
            let service = open_service(config, Some(&snapshot), rules.as_deref())?;
            let summary = service.compare(&value);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Stats { snapshot } => {
            let service = open_service(config, Some(&snapshot), None)?;
            println!("{}", serde_json::to_string_pretty(&service.summary())?);
            println!("{}", serde_json::to_string_pretty(&service.rules().stats())?);
        }
    }

    Ok(())
}

/// Build a service from an optional snapshot and an optional rule file
fn open_service(
    config: SiftConfig,
    snapshot: Option<&Path>,
    rules: Option<&Path>,
) -> Result<ThreatIntelService> {
    let service = ThreatIntelService::new(config);

    if let Some(path) = snapshot {
        let snapshot = Snapshot::load(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let indicators = service.store().import(snapshot.indicators).len();
        let links = service.store().import_links(snapshot.links);
        let restored = service.rules().restore(snapshot.rules);
        info!(
            "Loaded {} indicators, {} links and {} rules from {}",
            indicators,
            links,
            restored,
            path.display()
        );
    }

    if let Some(path) = rules {
        let drafts = load_rule_file(path)
            .with_context(|| format!("failed to read rules {}", path.display()))?;
        service.rules().bulk_create(drafts)?;
    }

    Ok(service)
}

/// Read and ingest feed files concurrently into one shared service
async fn run_ingest(service: &Arc<ThreatIntelService>, files: Vec<PathBuf>) -> Result<IngestReport> {
    let tasks = files.into_iter().map(|path| {
        let service = Arc::clone(service);
        tokio::spawn(async move {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let reports = parse_indicator_reports(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!("Ingesting {} reports from {}", reports.len(), path.display());
            Ok::<_, anyhow::Error>(service.ingest_batch(reports))
        })
    });

    let mut total = IngestReport::default();
    for result in join_all(tasks).await {
        let report = result??;
        total.received += report.received;
        total.inserted += report.inserted;
        total.merged += report.merged;
        total.ids.extend(report.ids);
    }

    info!(
        "Ingested {} reports in total: {} new, {} merged",
        total.received, total.inserted, total.merged
    );
    Ok(total)
}

fn save_snapshot(service: &ThreatIntelService, path: &Path) -> Result<()> {
    let snapshot = Snapshot {
        indicators: service.store().snapshot(),
        links: service.store().links(),
        rules: service.rules().snapshot(),
    };
    fs::write(path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    info!("Snapshot saved to {}", path.display());
    Ok(())
}
