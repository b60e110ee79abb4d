//! pcapsock CLI - listen for a pcapd producer and print packet events.
//!
//! This is the main binary entry point. See the `pcapsock` library for the
//! listener itself.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use pcapsock::constants::SHUTDOWN_CHECK_INTERVAL;
use pcapsock::sink::{EventBuffer, LogSink};
use pcapsock::{EventSink, ListenerConfig, PacketListener};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "pcapsock")]
#[command(version)]
#[command(about = "Receive pcapd packet metadata over a Unix socket")]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for a producer and print events until interrupted
    Listen {
        /// Socket path (overrides config and PCAPSOCK_SOCKET)
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Print events as JSON lines on stdout instead of log lines
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = ListenerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Listen { socket, json } => {
            let mut config = config;
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            run_listener(&config, json)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Log to stderr, or to `PCAPSOCK_LOG_FILE` when set.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("PCAPSOCK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

/// Print buffered events as JSON lines on stdout or as log lines.
fn print_events(buffer: &EventBuffer, json: bool) -> Result<()> {
    let events = buffer.drain();
    if events.is_empty() {
        return Ok(());
    }
    if json {
        let mut out = std::io::stdout().lock();
        for event in &events {
            let line = serde_json::to_string(event)?;
            writeln!(out, "{line}").context("Failed to write event")?;
        }
        out.flush().context("Failed to flush stdout")?;
    } else {
        for event in &events {
            LogSink.on_packet(event)?;
        }
    }
    Ok(())
}

/// Run until a shutdown signal, re-arming the listener whenever the
/// producer disconnects.
///
/// The reader thread only pushes into the bounded buffer. This loop drains
/// and prints it every tick.
fn run_listener(config: &ListenerConfig, json: bool) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    config.ensure_socket_dir()?;

    let buffer = Arc::new(config.event_buffer());
    let listener = PacketListener::from_config(Arc::clone(&buffer) as Arc<dyn EventSink>, config);

    log::info!(
        "pcapsock v{} listening on {} (buffer {})",
        env!("CARGO_PKG_VERSION"),
        config.socket_path.display(),
        buffer.capacity()
    );

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        if !listener.is_running() {
            listener
                .start(&config.socket_path)
                .with_context(|| format!("Failed to listen on {}", config.socket_path.display()))?;
        }
        print_events(&buffer, json)?;
        std::thread::sleep(SHUTDOWN_CHECK_INTERVAL);
    }

    log::info!("Shutting down...");
    listener.teardown();
    print_events(&buffer, json)?;
    if buffer.evicted() > 0 {
        log::warn!("{} event(s) dropped while the buffer was full", buffer.evicted());
    }

    let stats = listener.stats();
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
