//! NextGCore NAS Daemon
//!
//! Hosts the MME NAS core on a single-threaded runtime. Events arrive on a
//! channel; the task clock follows the wall clock on every tick.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use nextgcore_nasd::config::DEFAULT_CONFIG_PATH;
use nextgcore_nasd::{NasConfig, NasCore, NasEvent};

/// Depth of the inbound event channel
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Timer resolution of the task clock
const TICK: Duration = Duration::from_millis(100);

/// NextGCore NAS - MME NAS layer (EMM/ESM)
#[derive(Parser, Debug)]
#[command(name = "nextgcore-nasd")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MME NAS layer: EMM/ESM procedures and contexts")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

/// NAS application state
pub struct NasApp {
    /// Running flag
    running: Arc<AtomicBool>,
    /// NAS core, created by `init`
    core: Option<NasCore>,
    /// Handed to the transports feeding the core
    event_tx: mpsc::Sender<NasEvent>,
    event_rx: mpsc::Receiver<NasEvent>,
}

impl NasApp {
    /// Create a new NAS application
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            running: Arc::new(AtomicBool::new(true)),
            core: None,
            event_tx,
            event_rx,
        }
    }

    /// Load the configuration and create the core
    pub fn init(&mut self, config_path: &str) -> Result<()> {
        log::info!("Initializing NAS core...");

        let config = if Path::new(config_path).exists() {
            NasConfig::load(config_path).with_context(|| format!("failed to load {config_path}"))?
        } else {
            log::warn!("Configuration {} not found, using defaults", config_path);
            NasConfig::default()
        };
        log::debug!("GUMMEI {:?}, default APN {}", config.gummei, config.default_apn);

        self.core = Some(NasCore::new(config).context("invalid NAS configuration")?);
        log::info!("NAS core initialized successfully");
        Ok(())
    }

    /// Run the event loop until the running flag drops
    pub async fn run(&mut self) -> Result<()> {
        let core = self.core.as_mut().context("NAS core not initialized")?;
        log::info!("NAS core running...");

        let mut interval = tokio::time::interval(TICK);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => core.enqueue(event),
                    None => break,
                },
                _ = interval.tick() => {}
            }

            core.run_pending();
            core.advance_to(Instant::now());
            for primitive in core.take_outbound() {
                log::info!("Outbound {}", primitive);
            }
        }

        log::info!("NAS core main loop exited");
        Ok(())
    }

    /// Drop every context and timer
    pub fn shutdown(&mut self) {
        log::info!("Shutting down NAS core...");
        if let Some(core) = self.core.as_mut() {
            core.shutdown();
        }
        self.core = None;
        log::info!("NAS core shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Sender for the transports feeding the core
    pub fn event_sender(&self) -> mpsc::Sender<NasEvent> {
        self.event_tx.clone()
    }
}

impl Default for NasApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging based on command line arguments
fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    log::info!("NextGCore NAS v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    if args.daemon {
        log::debug!("Daemon mode requested");
    }

    let mut app = NasApp::new();

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    app.init(&args.config)?;
    app.run().await?;
    app.shutdown();

    log::info!("NextGCore NAS terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::parse_from(["nextgcore-nasd"]);
        assert_eq!(args.config, DEFAULT_CONFIG_PATH);
        assert_eq!(args.log_level, "info");
        assert!(!args.no_color);
        assert!(!args.daemon);
    }

    #[test]
    fn test_app_stop() {
        let app = NasApp::new();
        let flag = app.running_flag();
        assert!(flag.load(Ordering::SeqCst));
        app.stop();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_init_without_config_file_uses_defaults() {
        let mut app = NasApp::new();
        app.init("/nonexistent/nasd.yaml").unwrap();
        assert_eq!(app.core.as_ref().unwrap().config().default_apn, "internet");
        app.shutdown();
        assert!(app.core.is_none());
    }
}
