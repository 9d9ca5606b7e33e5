use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use proc_doctor::{
    analysis::{GcSummary, StatSummary, classify},
    collector::{CollectOptions, Collector},
    encoder::StatReader,
    logging,
    models::{GcKind, IssuePresence, MemoryIssues},
};


#[derive(Parser, Debug)]
#[command(author, version, about = "Sample a process and classify its bottleneck")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a probe-enabled program and summarise what it emitted
    Collect {
        /// Sampling interval in milliseconds, passed to the target
        #[arg(long)]
        sample_interval: Option<u64>,

        /// Base directory for the per-process data directory
        #[arg(long, default_value = ".")]
        data_path: PathBuf,

        /// How long to wait for the target's probe to become ready
        #[arg(long, default_value_t = 10_000)]
        ready_timeout_ms: u64,

        /// Program to run, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        program: Vec<String>,
    },

    /// Summarise a processstat file
    Analyze {
        path: PathBuf,
    },

    /// Print the category for a set of detected issues
    Classify(IssueFlags),
}

#[derive(Args, Debug)]
struct IssueFlags {
    #[arg(long)]
    memory_external: bool,
    #[arg(long)]
    memory_rss: bool,
    #[arg(long)]
    memory_heap_total: bool,
    #[arg(long)]
    memory_heap_used: bool,
    #[arg(long)]
    cpu: bool,
    #[arg(long)]
    handles: bool,
    #[arg(long)]
    delay: bool,
}

impl From<IssueFlags> for IssuePresence {
    fn from(flags: IssueFlags) -> Self {
        IssuePresence {
            memory: MemoryIssues {
                external: flags.memory_external,
                rss: flags.memory_rss,
                heap_total: flags.memory_heap_total,
                heap_used: flags.memory_heap_used,
            },
            cpu: flags.cpu,
            handles: flags.handles,
            delay: flags.delay,
        }
    }
}

#[derive(Serialize)]
struct CollectReport {
    pid: u32,
    data_dir: PathBuf,
    exit_code: Option<i32>,
    source_warning: bool,
    stats: StatSummary,
    gc: GcSummary,
    scavenges: u64,
    full_collections: u64,
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init("info");

    let cli = Cli::parse();

    match cli.command {
        Command::Collect { sample_interval, data_path, ready_timeout_ms, program } => {
            collect(sample_interval, data_path, Duration::from_millis(ready_timeout_ms), program).await
        }
        Command::Analyze { path } => analyze(path).await,
        Command::Classify(flags) => {
            let issues = IssuePresence::from(flags);
            println!("{}", classify(&issues));
            Ok(())
        }
    }
}

async fn collect(
    sample_interval: Option<u64>,
    data_path: PathBuf,
    ready_timeout: Duration,
    program: Vec<String>,
) -> anyhow::Result<()> {
    let mut parts = program.into_iter();
    let executable = parts.next().context("no program given")?;

    let mut options = CollectOptions::new(executable.clone())
        .args(parts)
        .data_path(data_path)
        .ready_timeout(ready_timeout);
    if let Some(ms) = sample_interval {
        options = options.sample_interval_ms(ms);
    }

    let collected = Collector::launch(options)
        .await
        .with_context(|| format!("Failed to collect from {executable}"))?;
    let pid = collected.pid;
    let data_dir = collected.data_dir.root().to_path_buf();

    let collection = collected.drain().await.context("Target did not finish cleanly")?;
    let gc = GcSummary::from_events(&collection.gc_events);

    let report = CollectReport {
        pid,
        data_dir,
        exit_code: collection.status.code(),
        source_warning: collection.source_warning,
        stats: StatSummary::from_snapshots(&collection.process_stats),
        scavenges: gc.count(GcKind::Scavenge),
        full_collections: gc.cycles(GcKind::MarkSweepCompact),
        gc,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn analyze(path: PathBuf) -> anyhow::Result<()> {
    let reader = StatReader::open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let summary = StatSummary::from_reader(reader)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    tracing::info!("Loaded {} stat records from {}", summary.samples, path.display());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
