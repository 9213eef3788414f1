use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxheap::{ContextEngine, RetentionProfile, StoreSettings};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ctxheap")]
#[command(about = "Maintenance tool for ctxheap context stores", long_about = None)]
struct Args {
    /// Data directory holding one subdirectory per project
    #[arg(long, env = "CTXHEAP_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Number of archive shards per project
    #[arg(long, env = "CTXHEAP_SHARD_COUNT", default_value = "64")]
    shard_count: u32,

    /// Working-set capacity per (project, task) scope
    #[arg(long, env = "CTXHEAP_CAPACITY", default_value = "10000")]
    capacity: usize,

    /// Retention profile (aggressive, balanced, conservative)
    #[arg(long, env = "CTXHEAP_PROFILE", default_value = "balanced")]
    profile: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print per-project statistics
    Stats {
        /// Only this project; all projects when omitted
        #[arg(long)]
        project: Option<String>,
    },
    /// Keyword search over archived segments
    Search {
        query: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show GC candidates and, with a target, a reclamation plan
    Analyze {
        project: String,
        #[arg(long)]
        task: Option<String>,
        /// Tokens to reclaim
        #[arg(long)]
        target: Option<u64>,
    },
    /// Rebuild a project's inverted index from its archive
    RebuildIndex { project: String },
    /// Persist working sets, indexes and markers for every project
    Checkpoint,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let profile = match args.profile.to_lowercase().as_str() {
        "aggressive" => RetentionProfile::Aggressive,
        "balanced" => RetentionProfile::Balanced,
        "conservative" => RetentionProfile::Conservative,
        _ => {
            warn!("Unknown profile '{}', using 'balanced'", args.profile);
            RetentionProfile::Balanced
        }
    };

    let settings = StoreSettings::new(&args.data_dir)
        .with_profile(profile)
        .with_capacity(args.capacity)
        .with_shard_count(args.shard_count);

    info!(
        "ctxheap v{} using {}",
        ctxheap::VERSION,
        args.data_dir.display()
    );
    let engine = ContextEngine::new(settings).context("failed to open data directory")?;

    match args.command {
        Command::Stats { project } => {
            let projects = match project {
                Some(p) => vec![p],
                None => {
                    engine.open_existing()?;
                    engine
                        .list_projects()
                        .into_iter()
                        .map(|id| id.0)
                        .collect()
                }
            };
            let mut all = serde_json::Map::new();
            for p in projects {
                let stats = engine.stats(&p)?;
                all.insert(p, serde_json::to_value(stats)?);
            }
            print_json(&all)?;
        }
        Command::Search {
            query,
            project,
            limit,
        } => {
            if project.is_none() {
                engine.open_existing()?;
            }
            let response = engine.search(project.as_deref(), Some(&query), None, limit)?;
            print_json(&response)?;
        }
        Command::Analyze {
            project,
            task,
            target,
        } => {
            let analysis = engine.gc_analyze(&project, task.as_deref(), target)?;
            print_json(&analysis)?;
        }
        Command::RebuildIndex { project } => {
            let indexed = engine.rebuild_index(&project)?;
            info!(project = %project, indexed, "index rebuilt");
        }
        Command::Checkpoint => {
            engine.open_existing()?;
            let count = engine.checkpoint_all()?;
            info!(projects = count, "checkpoint complete");
        }
    }

    Ok(())
}
