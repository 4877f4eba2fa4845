#![forbid(unsafe_code)]

mod output;

use std::env;
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use output::PrintLines;
use tailwatch_core::{StartPosition, Tail, TailConfig, load_config};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tailwatch: follow files and remember where you left off",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// TOML config file; flags override its values.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where read positions are stored.
    #[arg(long, value_name = "FILE")]
    sincedb_path: Option<PathBuf>,

    /// Where to start files seen for the first time at startup.
    #[arg(long, value_name = "beginning|end")]
    start_at: Option<StartPosition>,

    /// Glob of paths to skip; matched against the file name. Repeatable.
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Seconds between polls.
    #[arg(long, value_name = "SECS")]
    stat_interval: Option<f64>,

    /// Upper bound on simultaneously open files.
    #[arg(long, value_name = "N")]
    max_open_files: Option<usize>,

    /// Close files idle for this many seconds.
    #[arg(long, value_name = "SECS")]
    close_older: Option<f64>,

    /// Skip files last modified more than this many seconds ago.
    #[arg(long, value_name = "SECS")]
    ignore_older: Option<f64>,

    /// Stop after this many polls instead of running until interrupted.
    #[arg(long, value_name = "N")]
    ticks: Option<u64>,

    /// Prefix each line with the path it came from.
    #[arg(long)]
    with_path: bool,

    /// Glob patterns of files to follow.
    #[arg(required = true, value_name = "GLOB")]
    paths: Vec<String>,
}

impl Cli {
    /// Layer the flags over `config`.
    fn apply(&self, config: &mut TailConfig) {
        if let Some(path) = &self.sincedb_path {
            config.sincedb_path = Some(path.clone());
        }
        if let Some(start) = self.start_at {
            config.start_new_files_at = start;
        }
        config.exclude.extend(self.exclude.iter().cloned());
        if let Some(secs) = self.stat_interval {
            config.stat_interval = secs;
        }
        if self.max_open_files.is_some() {
            config.max_open_files = self.max_open_files;
        }
        if self.close_older.is_some() {
            config.close_older = self.close_older;
        }
        if self.ignore_older.is_some() {
            config.ignore_older = self.ignore_older;
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TAILWATCH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "tailwatch_core=debug,tailwatch=debug,info"
        } else {
            "warn"
        })
    });

    let format = env::var("TAILWATCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TailConfig::default(),
    };
    cli.apply(&mut config);

    let mut tail = Tail::new(&config).context("Failed to start tailing")?;

    let quit = tail.quit_handle();
    let handler_quit = quit.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down");
        handler_quit.quit();
    })
    .context("Failed to install Ctrl+C handler")?;

    for pattern in &cli.paths {
        let found = tail
            .tail(pattern)
            .with_context(|| format!("Failed to watch {pattern}"))?;
        if found == 0 {
            warn!(%pattern, "no files match yet");
        }
        debug!(%pattern, found, "watching");
    }

    let mut printer = PrintLines::new(io::stdout().lock(), cli.with_path, quit);
    match cli.ticks {
        Some(ticks) => {
            tail.run_ticks(ticks, &mut printer)?;
        }
        None => tail.subscribe(&mut printer)?,
    }

    printer.finish().context("Failed to write output")?;
    Ok(())
}
