use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use arbiter_kernel::audit::{simulate_table, ObservedTableState};
use arbiter_kernel::config::{ArbiterConfig, BackendKind};
use arbiter_kernel::invariants::{PolicyTrace, SessionRegistry};
use arbiter_kernel::log::LogBackend;
use arbiter_kernel::{
    DryRunOutcome, MetadataLog, MutationCoordinator, MutationProposal, ReplayEngine, ReplayPoint,
    Sequence, TableId, Timestamp,
};

/// Arbiter: table mutation control plane
#[derive(Parser, Debug)]
#[command(name = "arbiter")]
#[command(about = "Arbitrates metadata mutations on shared tables", long_about = None)]
struct Cli {
    /// Path to the arbiter config (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log directory; overrides the config and selects the file backend
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a mutation proposal read from a JSON file
    Propose {
        #[arg(long)]
        file: PathBuf,
    },
    /// Decide a proposal without appending, with every policy's verdict
    Check {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the current state of a table
    State {
        #[arg(long)]
        table: String,
    },
    /// Rebuild a table's state at a point in its history
    Reconstruct {
        #[arg(long)]
        table: String,
        #[arg(long, conflicts_with = "timestamp")]
        sequence: Option<Sequence>,
        #[arg(long)]
        timestamp: Option<Timestamp>,
    },
    /// List a table's log entries
    History {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = 1)]
        from: Sequence,
        #[arg(long)]
        to: Option<Sequence>,
    },
    /// Replay every table and report any that fail to fold
    Verify,
    /// Compare replayed state with an observed catalog state (dry-run)
    Simulate {
        #[arg(long)]
        table: String,
        /// JSON file holding the observed table state
        #[arg(long)]
        observed: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    outcome: DryRunOutcome,
    trace: Vec<PolicyTrace>,
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    recovered: Vec<TableId>,
    failed: Vec<FailedTable>,
}

#[derive(Debug, Serialize)]
struct FailedTable {
    table_id: TableId,
    error: String,
}

type Log = MetadataLog<Box<dyn LogBackend>>;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ArbiterConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ArbiterConfig::default(),
    };
    if let Some(dir) = cli.log_dir {
        config.log.backend = BackendKind::File;
        config.log.dir = dir;
    }

    init_tracing(cli.log_level.as_deref().unwrap_or(&config.telemetry.log_level));
    debug!(?config, "loaded config");

    let log = Arc::new(config.open_log().with_context(|| {
        format!("failed to open metadata log in {}", config.log.dir.display())
    })?);

    match cli.command {
        Command::Propose { file } => {
            let proposal = read_json::<MutationProposal>(&file)?;
            let coordinator = open_coordinator(&config, log)?;
            let outcome = coordinator
                .propose(proposal)
                .context("proposal failed")?;
            print_json(&outcome)?;
            coordinator.shutdown();
        }
        Command::Check { file } => {
            let proposal = read_json::<MutationProposal>(&file)?;
            let coordinator = open_coordinator(&config, log)?;
            let outcome = coordinator.dry_run(&proposal).context("dry run failed")?;
            let trace = coordinator.explain(&proposal)?;
            print_json(&CheckOutput { outcome, trace })?;
        }
        Command::State { table } => {
            let coordinator = open_coordinator(&config, log)?;
            let state = coordinator.get_state(&TableId::new(table))?;
            print_json(&state)?;
        }
        Command::Reconstruct {
            table,
            sequence,
            timestamp,
        } => {
            let point = match (sequence, timestamp) {
                (Some(n), _) => ReplayPoint::Sequence(n),
                (None, Some(t)) => ReplayPoint::Timestamp(t),
                (None, None) => ReplayPoint::Latest,
            };
            let state = ReplayEngine::new(&*log)
                .reconstruct(&TableId::new(table), point)
                .context("replay failed")?;
            print_json(&state)?;
        }
        Command::History { table, from, to } => {
            let replay = ReplayEngine::new(&*log);
            let table_id = TableId::new(table);
            let entries = match to {
                Some(to) => replay.history(&table_id, from..=to)?,
                None => replay.history(&table_id, from..)?,
            };
            print_json(&entries)?;
        }
        Command::Verify => {
            let report = ReplayEngine::new(&*log)
                .recover_all()
                .context("failed to list tables")?;
            let output = VerifyOutput {
                recovered: report.recovered.iter().map(|s| s.table_id.clone()).collect(),
                failed: report
                    .failed
                    .iter()
                    .map(|(table_id, err)| FailedTable {
                        table_id: table_id.clone(),
                        error: err.to_string(),
                    })
                    .collect(),
            };
            print_json(&output)?;
            if !output.failed.is_empty() {
                bail!("{} table(s) failed to replay", output.failed.len());
            }
        }
        Command::Simulate { table, observed } => {
            let observed = read_json::<ObservedTableState>(&observed)?;
            let result = simulate_table(
                &ReplayEngine::new(&*log),
                &TableId::new(table),
                &observed,
                &config.drift,
            )?;
            print_json(&result)?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn open_coordinator(
    config: &ArbiterConfig,
    log: Arc<Log>,
) -> Result<MutationCoordinator<Box<dyn LogBackend>>> {
    let invariants = config.build_invariants()?;
    MutationCoordinator::open(log, invariants, Arc::new(SessionRegistry::default()))
        .context("failed to open mutation coordinator")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
