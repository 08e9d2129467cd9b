//! progvis - report job progress to a progvis collector
//!
//! Subcommands:
//! - `status`: show the resolved reporter configuration
//! - `demo`: run a simulated job and report its progress
//! - `pipe`: report one step per line read from stdin
//!
//! Uses XDG Base Directory specification for file locations:
//! - Logs: $XDG_STATE_HOME/progvis/progvis.log (~/.local/state/progvis/progvis.log)
//! - Config: $XDG_CONFIG_HOME/progvis/config.toml (~/.config/progvis/config.toml)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use progvis_core::logging::{self, LoggingGuard};
use progvis_core::{Config, DeliveryStats, Reporter, ReporterConfig, Snapshot};
use rand::Rng;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "progvis")]
#[command(about = "Report job progress to a progvis collector")]
#[command(version)]
struct Args {
    /// Log to stderr at debug level instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Client token (overrides PV_TOKEN and the config file)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Collector URL (overrides PV_API and the config file)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Send the command line and host name along with progress
    #[arg(long, global = true)]
    collect_context: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved reporter configuration
    Status,

    /// Run a simulated job that processes random items
    Demo {
        /// Number of items to process
        #[arg(short, long, default_value = "40")]
        items: usize,

        /// Job name shown by the collector
        #[arg(short, long, default_value = "progvis-demo")]
        name: String,

        /// Maximum simulated work per item in milliseconds
        #[arg(long, default_value = "200")]
        delay_ms: u64,

        /// Finish in the error state
        #[arg(long)]
        fail: bool,
    },

    /// Report one step and one log message per stdin line
    Pipe {
        /// Job name shown by the collector
        #[arg(short, long)]
        name: Option<String>,

        /// Expected number of lines
        #[arg(short, long)]
        expected: Option<i64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = init_logging(&args, &config)?;
    let reporter_config = resolve_reporter_config(&args, config.reporter);

    tracing::info!("progvis starting");

    match args.command {
        Commands::Status => cmd_status(&reporter_config),
        Commands::Demo {
            items,
            name,
            delay_ms,
            fail,
        } => cmd_demo(&reporter_config, items, &name, delay_ms, fail),
        Commands::Pipe { name, expected } => {
            cmd_pipe(&reporter_config, name.as_deref(), expected)
        }
    }
}

fn init_logging(args: &Args, config: &Config) -> Result<LoggingGuard> {
    if args.verbose {
        return Ok(logging::init_stderr("debug"));
    }
    logging::init(&config.logging).context("failed to initialize logging")
}

/// Layer environment and command-line overrides onto the config file
fn resolve_reporter_config(args: &Args, config: ReporterConfig) -> ReporterConfig {
    let mut config = config.apply_env(|key| std::env::var(key).ok());

    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    if let Some(url) = &args.server_url {
        config.server_url = url.clone();
    }
    if args.collect_context {
        config.collect_context = true;
    }

    config
}

fn cmd_status(config: &ReporterConfig) -> Result<()> {
    println!("Reporter Configuration");
    println!("======================");
    println!();
    println!(
        "Token:           {}",
        if config.has_token() { "<set>" } else { "<not set>" }
    );
    println!("Server URL:      {}", config.server_url);
    println!("Collect context: {}", config.collect_context);
    println!("Capture panics:  {}", config.capture_panics);
    println!("Timeout:         {}ms", config.timeout_ms);
    println!(
        "Flush window:    {}ms (max {}ms)",
        config.flush_wait_ms, config.flush_max_wait_ms
    );
    println!(
        "Settle window:   {}ms (max {}ms)",
        config.settle_ms, config.settle_max_ms
    );
    println!("Give up after:   {} failures", config.max_consecutive_failures);
    println!();
    println!("Config file: {}", Config::config_path().display());
    println!("Log file:    {}", logging::log_file_path().display());

    if let Err(e) = config.validate() {
        println!();
        println!("Configuration is invalid: {}", e);
    }

    Ok(())
}

fn cmd_demo(
    config: &ReporterConfig,
    items: usize,
    name: &str,
    delay_ms: u64,
    fail: bool,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let work: Vec<u32> = (0..items).map(|_| rng.gen_range(1..=1000)).collect();

    let reporter = Reporter::start(Some(name), Some(items as i64), config);
    println!("Session: {}", reporter.id());

    for item in work {
        let result = process(item, delay_ms, &mut rng);
        reporter.step();
        reporter.log(&serde_json::json!({ "item": item, "result": result }));
    }

    if fail {
        reporter.error();
    } else {
        reporter.done();
    }

    let snapshot = reporter.snapshot();
    let stats = reporter.close();
    print_summary(&snapshot, &stats);
    Ok(())
}

/// Simulated unit of work
fn process(item: u32, max_delay_ms: u64, rng: &mut impl Rng) -> u64 {
    if max_delay_ms > 0 {
        thread::sleep(Duration::from_millis(rng.gen_range(0..=max_delay_ms)));
    }
    u64::from(item) * u64::from(item)
}

fn cmd_pipe(config: &ReporterConfig, name: Option<&str>, expected: Option<i64>) -> Result<()> {
    let reporter = Reporter::start(name, expected, config);
    tracing::info!(session = %reporter.id(), "Reading stdin");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                reporter.error();
                reporter.close();
                return Err(e).context("failed to read stdin");
            }
        };
        reporter.step();
        reporter.log(&serde_json::json!({ "line": line }));
    }

    reporter.done();
    let snapshot = reporter.snapshot();
    let stats = reporter.close();
    print_summary(&snapshot, &stats);
    Ok(())
}

fn print_summary(snapshot: &Snapshot, stats: &DeliveryStats) {
    println!();
    println!("Session {} finished: {}", snapshot.id, snapshot.state);
    match snapshot.expected_total {
        Some(expected) => println!("  Steps:     {}/{}", snapshot.current_total, expected),
        None => println!("  Steps:     {}", snapshot.current_total),
    }
    println!(
        "  Uploads:   {} attempted, {} succeeded, {} failed",
        stats.attempts, stats.successes, stats.failures
    );
    if let Some(reason) = &stats.halted {
        println!("  Uploads stopped: {:?}", reason);
    }
}
