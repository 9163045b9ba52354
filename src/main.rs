/*!
 * Pacekeeper CLI
 *
 * Runs the governor against the built-in synthetic upstream and manages
 * configuration files.
 */

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use pacekeeper::{
    cli_style::{
        self, batch_summary_table, print_error, print_info, print_success, print_warning,
        recommendations_table, section_header, status_table, BatchSummary, Icons, Theme,
    },
    config::{GovernorConfig, LogLevel},
    error::{GovernorError, Result, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    orchestrator::{Governor, GovernorStatus},
    pool::{ExpiredItem, PoolStats},
    simulate::{serial_items, SimulatedUpstream, SimulatedUpstreamConfig, SimulationStats},
};
use pacekeeper_core_resilience::{DeadLetterEntry, DeadLetterStats};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pacekeeper")]
#[command(version, about = "Adaptive pacing, circuit breaking and concurrency for rate-limited upstreams", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to a file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch against a synthetic rate-limited upstream
    Simulate(SimulateArgs),

    /// Manage configuration files
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of items in the batch
    #[arg(short = 'n', long, default_value = "60")]
    items: usize,

    /// Requests per minute the upstream accepts before returning 429
    #[arg(long, default_value = "90")]
    hidden_limit: u32,

    /// Fraction of calls failing with a 503
    #[arg(long, default_value = "0.05")]
    error_rate: f64,

    /// Fraction of calls failing with a 401
    #[arg(long, default_value = "0.005")]
    auth_error_rate: f64,

    /// Have the upstream send X-RateLimit-* headers
    #[arg(long)]
    headers: bool,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Preset used when no config file is given
    #[arg(long, value_enum, default_value = "default")]
    preset: PresetArg,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a configuration file
    Init {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "default")]
        preset: PresetArg,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show {
        #[arg(long, value_enum, default_value = "default")]
        preset: PresetArg,
    },

    /// Check a configuration file
    Validate { path: PathBuf },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    Default,
    Conservative,
    Aggressive,
}

impl PresetArg {
    fn config(self) -> GovernorConfig {
        match self {
            PresetArg::Default => GovernorConfig::default(),
            PresetArg::Conservative => GovernorConfig::conservative_preset(),
            PresetArg::Aggressive => GovernorConfig::aggressive_preset(),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

/// Machine-readable simulation output
#[derive(Serialize)]
struct SimulationReport {
    stats: PoolStats,
    upstream: SimulationStats,
    expired: Vec<ExpiredItem>,
    dead_letters: Vec<DeadLetterEntry>,
    dead_letter_stats: DeadLetterStats,
    status: GovernorStatus,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            print_error(&e.to_string(), hint_for(&e));
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn hint_for(err: &GovernorError) -> Option<&'static str> {
    match err {
        GovernorError::Config(_) => Some("run `pacekeeper config validate <file>` for details"),
        GovernorError::Io(_) => Some("check the path and its permissions"),
        _ => None,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut config = match (&cli.config, &cli.command) {
        (Some(path), _) => GovernorConfig::from_file(path)?,
        (None, Commands::Simulate(args)) => args.preset.config(),
        (None, Commands::Config(ConfigCommand::Show { preset })) => preset.config(),
        (None, _) => GovernorConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    config.logging.verbose |= cli.verbose;
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }
    if let Err(e) = logging::init_logging(&config.logging) {
        cli_style::print_warning(&format!("Failed to initialize logging: {}", e));
    }

    match cli.command {
        Commands::Simulate(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(simulate(config, args))
        }
        Commands::Config(command) => handle_config(command, config),
    }
}

fn handle_config(command: ConfigCommand, effective: GovernorConfig) -> Result<i32> {
    match command {
        ConfigCommand::Init {
            path,
            preset,
            force,
        } => {
            if path.exists() && !force {
                return Err(GovernorError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            preset.config().to_file(&path)?;
            print_success(&format!("Wrote {}", path.display()));
            Ok(EXIT_SUCCESS)
        }
        ConfigCommand::Show { .. } => {
            effective.validate()?;
            let rendered = toml::to_string_pretty(&effective)?;
            println!("{}", rendered);
            Ok(EXIT_SUCCESS)
        }
        ConfigCommand::Validate { path } => {
            let config = GovernorConfig::from_file(&path)?;
            match config.validate() {
                Ok(()) => {
                    print_success(&format!("{} is valid", path.display()));
                    Ok(EXIT_SUCCESS)
                }
                Err(GovernorError::Config(problems)) => {
                    for problem in problems.split("; ") {
                        println!("  {} {}", Theme::error(Icons::ERROR), problem);
                    }
                    Ok(EXIT_FATAL)
                }
                Err(e) => Err(e),
            }
        }
    }
}

async fn simulate(config: GovernorConfig, args: SimulateArgs) -> Result<i32> {
    let upstream = Arc::new(SimulatedUpstream::new(SimulatedUpstreamConfig {
        hidden_per_minute: args.hidden_limit.max(1),
        server_error_rate: args.error_rate.clamp(0.0, 1.0),
        auth_error_rate: args.auth_error_rate.clamp(0.0, 1.0),
        send_headers: args.headers,
        seed: args.seed,
        ..Default::default()
    }));

    let governor = Governor::new(config)?;
    governor.start();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let total = args.items;
    if !args.json {
        cli_style::print_banner();
        print_info(&format!(
            "{} Processing {} items against an upstream limited to {} req/min",
            Icons::SHIELD,
            total,
            args.hidden_limit
        ));
    }

    let bar = if args.json {
        None
    } else {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg} ({elapsed_precise})")
                .map_err(|e| GovernorError::Other(format!("progress template: {}", e)))?
                .progress_chars("#>-"),
        );
        Some(pb)
    };

    let watcher_stop = CancellationToken::new();
    let watcher = bar.clone().map(|pb| {
        let controller = governor.controller().clone();
        let stop = watcher_stop.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = controller.snapshot();
                let pending = snapshot.queue_depth + snapshot.in_flight;
                pb.set_position(total.saturating_sub(pending) as u64);
                pb.set_message(format!(
                    "{} {} in flight, limit {}",
                    Icons::LIGHTNING,
                    snapshot.in_flight,
                    snapshot.current
                ));
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        })
    });

    let report = governor
        .process_items(serial_items(total), upstream.clone(), cancel)
        .await;

    watcher_stop.cancel();
    if let Some(handle) = watcher {
        let _ = handle.await;
    }
    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }

    // Close the last window so the report covers the whole run
    governor.aggregate_now();
    governor.recommend_now();
    let status = governor.status().await;
    governor.shutdown().await;

    let stats = report.stats.clone();
    let code = if stats.failed > 0 || stats.expired > 0 || stats.unprocessed > 0 {
        EXIT_PARTIAL
    } else {
        EXIT_SUCCESS
    };

    if args.json {
        let output = SimulationReport {
            stats,
            upstream: upstream.stats(),
            expired: report.expired,
            dead_letters: report.dead_letters,
            dead_letter_stats: report.dead_letter_stats,
            status,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(code);
    }

    section_header("Results");
    let summary = BatchSummary {
        total: stats.total_items,
        succeeded: stats.succeeded,
        failed: stats.failed,
        expired: stats.expired,
        unprocessed: stats.unprocessed,
        requeues: stats.requeues,
        dead_letters: report.dead_letters.len(),
        peak_concurrency: stats.peak_concurrency,
        final_concurrency: stats.final_concurrency,
        elapsed_secs: stats.elapsed_ms as f64 / 1000.0,
    };
    println!("{}", batch_summary_table(&summary));

    section_header("Governor");
    println!("{}", status_table(&status));

    let upstream_stats = upstream.stats();
    print_info(&format!(
        "Upstream saw {} calls: {} rate limited, {} server errors, {} timeouts, {} auth errors",
        upstream_stats.calls,
        upstream_stats.rate_limited,
        upstream_stats.server_errors,
        upstream_stats.timeouts,
        upstream_stats.auth_errors
    ));

    if !status.recommendations.is_empty() {
        section_header("Recommendations");
        println!("{}", recommendations_table(&status.recommendations));
    }

    if report.dead_letter_stats.total_dropped > 0 {
        print_warning(&format!(
            "Dead-letter queue overflowed: {} of {} entries dropped",
            report.dead_letter_stats.total_dropped, report.dead_letter_stats.total_received
        ));
    }
    for entry in report.dead_letters.iter().take(10) {
        println!(
            "  {} {} {} {}",
            Theme::error(Icons::ERROR),
            entry.item_key,
            Theme::muted(Icons::ARROW_RIGHT),
            entry.failure_reason
        );
    }

    Ok(code)
}
