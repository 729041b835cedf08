use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use benchmon::benchmark::{BenchmarkBuilder, RunOutcome};
use benchmon::config::Config;
use benchmon::driver::DriverRegistry;
use benchmon::pipeline::handlers::PrintHandler;
use benchmon::sink::{LogSink, RecordSink};

/// Benchmark execution and performance-counter monitoring agent.
#[derive(Parser)]
#[command(name = "benchmon", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log every pipeline message.
    #[arg(long)]
    print: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("benchmon {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_deref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)?;

    // The command line wins over the configured level.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        benchmarks = cfg.benchmarks.len(),
        "starting benchmon",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, cli.print))
}

async fn run(cfg: Config, print: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        signal_cancel.cancel();
    });

    let registry = DriverRegistry::new();
    let sink: Arc<dyn RecordSink> = Arc::new(LogSink);

    let mut benchmarks = Vec::with_capacity(cfg.benchmarks.len());
    for bench_cfg in &cfg.benchmarks {
        let mut builder =
            BenchmarkBuilder::from_config(&cfg, bench_cfg, &registry, Arc::clone(&sink))
                .with_context(|| format!("setting up benchmark {}", bench_cfg.identifier))?;
        if print {
            builder = builder.add_handler(Box::new(PrintHandler));
        }
        benchmarks.push(builder.finalize()?);
    }

    let results = futures::future::join_all(
        benchmarks
            .iter()
            .map(|bench| bench.run(cancel.child_token())),
    )
    .await;

    let mut failed = 0usize;
    for (bench, result) in benchmarks.iter().zip(results) {
        let id = bench.info().identifier();
        match result {
            Ok(RunOutcome::Exited(status)) if status.success() => {
                tracing::info!(benchmark = id, "benchmark completed");
            }
            Ok(RunOutcome::Exited(status)) => {
                tracing::warn!(benchmark = id, %status, "workload exited unsuccessfully");
            }
            Ok(RunOutcome::Cancelled) => {
                tracing::info!(benchmark = id, "benchmark cancelled");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(benchmark = id, error = ?e, "benchmark failed");
            }
        }
    }

    tracing::info!("benchmon stopped");

    if failed > 0 {
        anyhow::bail!("{failed} benchmark(s) failed");
    }

    Ok(())
}
