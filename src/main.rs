//! Umbra - Desktop controller for tunneling/proxy cores
//!
//! Toggles the monitoring engine, routes connection profiles to the right core
//! binary and guarantees the core's process tree is reaped on stop or exit.

mod console;
mod core;
mod platform;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{
    filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::core::{
    ConfigRouter, CoreRequest, EngineLog, EngineSupervisor, ProfileKind, Settings,
};

/// Application name constant
pub const APP_NAME: &str = "Umbra";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Umbra - supervise sing-box and friends
#[derive(Parser, Debug)]
#[command(name = "umbra")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Working root holding cores/, configs/ and logs/
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the engine and an interactive console
    Run {
        /// Config file to start a core with
        #[arg(long)]
        config: Option<PathBuf>,

        /// Index of a saved profile in settings.json
        #[arg(long, conflicts_with = "config")]
        saved: Option<usize>,

        /// Core to use instead of the detected one
        #[arg(long)]
        core: Option<String>,
    },

    /// Detect the protocol of a config file
    Detect { file: PathBuf },

    /// Show which core and binary an identifier routes to
    Resolve { core: String },

    /// List listening TCP ports
    Ports {
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.root);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    match cli.command {
        Commands::Run {
            config,
            saved,
            core,
        } => run(&cli.root, config, saved, core),
        Commands::Detect { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let kind = ProfileKind::detect(&raw);
            println!("type: {}\ncore: {}", kind.label(), kind.suggested_core());
            Ok(())
        }
        Commands::Resolve { core } => {
            let settings = Settings::load_or_default(&cli.root);
            let router = ConfigRouter::new(&cli.root, settings.core_updates.paths);
            println!("{}", serde_json::to_string_pretty(&router.resolve(&core))?);
            Ok(())
        }
        Commands::Ports { limit } => {
            for port in platform::listening_ports(limit) {
                println!("{:>5}  {:>7}  {}", port.port, port.pid, port.name);
            }
            Ok(())
        }
    }
}

fn run(
    root: &Path,
    config: Option<PathBuf>,
    saved: Option<usize>,
    core: Option<String>,
) -> Result<()> {
    // Active config files are shared, so only one controller may run
    let instance = SingleInstance::new(APP_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to create single instance lock: {}", e))?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        eprintln!("{} is already running!", APP_NAME);
        return Ok(());
    }

    let settings = Settings::load_or_default(root);
    let request = match (config, saved) {
        (Some(path), _) => Some(console::request_from_file(&path, core)?),
        (None, Some(idx)) => {
            let saved = settings
                .configs
                .get(idx)
                .with_context(|| format!("No saved profile at index {}", idx))?;
            let mut req = CoreRequest::from(saved);
            if core.is_some() {
                req.core = core;
            }
            Some(req)
        }
        (None, None) => settings.active().map(CoreRequest::from),
    };

    let engine = Arc::new(EngineSupervisor::new(root, &settings, EngineLog::new()));
    engine.set_log_callback(Some(Arc::new(|line: &str| println!("{}", line))));

    // The core leads its own session, so terminal signals no longer reach it
    let handler_engine = Arc::clone(&engine);
    if let Err(e) = ctrlc::set_handler(move || {
        std::process::exit(shutdown_on_signal(&handler_engine));
    }) {
        warn!("Exit signals will not stop the core: {}", e);
    }

    engine.start_engine();
    if let Some(req) = request {
        engine.start_core_with_config(&req);
    }

    let stdin = io::stdin();
    let outcome = console::run(&engine, stdin.lock(), io::stdout());

    engine.shutdown();
    info!("{} shutting down", APP_NAME);
    outcome
}

/// Stop the engine and core after SIGINT, SIGTERM, SIGHUP or console close.
/// Returns the exit code to leave with.
fn shutdown_on_signal(engine: &EngineSupervisor) -> i32 {
    info!("Exit signal received; stopping {}", APP_NAME);
    engine.shutdown();
    130
}

/// Initialize the logging system
///
/// Engine lines are mirrored to stdout by the console callback, so the stderr
/// layer skips them; the log file receives everything.
fn init_logging(root: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("umbra=info"));

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter_fn(|meta| meta.target() != "umbra::engine"));

    let file = open_log_file(root).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
}

fn open_log_file(root: &Path) -> Option<std::fs::File> {
    let path = root.join("logs").join("umbra.log");
    let open = || -> io::Result<std::fs::File> {
        std::fs::create_dir_all(root.join("logs"))?;
        OpenOptions::new().create(true).append(true).open(&path)
    };
    match open() {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Logging to {} disabled: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn signal_shutdown_turns_engine_off() {
        let dir = tempdir().unwrap();
        let engine = EngineSupervisor::new(dir.path(), &Settings::default(), EngineLog::new());
        engine.start_engine();

        assert_eq!(shutdown_on_signal(&engine), 130);
        assert!(!engine.status().running);
        assert!(!engine.status().core_process_alive);
    }

    #[test]
    fn run_flags_are_exclusive() {
        let cli = Cli::try_parse_from(["umbra", "run", "--config", "a.json", "--core", "singbox"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { config: Some(_), saved: None, core: Some(_) }
        ));
        assert!(Cli::try_parse_from(["umbra", "run", "--config", "a.json", "--saved", "0"]).is_err());
    }
}
