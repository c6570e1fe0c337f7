//! The Weave WebSocket server CLI.
//!
//! Provides the `weaved` command with the following subcommands:
//!
//! - `weaved serve` - Run an echo or broadcast WebSocket server
//! - `weaved check-config <path>` - Validate a TOML configuration file
//!
//! While serving, lines read from stdin control the process: `status`
//! logs the number of open connections, `quit` (or end of input) stops the
//! server. SIGINT and SIGTERM stop it too, closing every connection with
//! status 1001 before the process exits.

use std::fs::OpenOptions;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weave_rt::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "weaved", version, about = "The Weave WebSocket server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WebSocket server
    Serve {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Listen port, 0 for an ephemeral port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Worker threads for actor handlers, 0 = available cores
        #[arg(long)]
        workers: Option<usize>,

        /// What to do with incoming messages
        #[arg(long, value_enum, default_value_t = Mode::Echo)]
        mode: Mode,

        /// Ignore stdin and run until SIGINT or SIGTERM
        #[arg(long = "no-stdin")]
        no_stdin: bool,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to the TOML configuration file
        path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Send each message back to its sender
    Echo,
    /// Send each message to every connected client
    Broadcast,
}

/// Why `serve` is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal,
    Console,
}

struct ServeOptions {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
    mode: Mode,
    no_stdin: bool,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            workers,
            mode,
            no_stdin,
        } => serve(ServeOptions {
            config,
            host,
            port,
            workers,
            mode,
            no_stdin,
        }),
        Commands::CheckConfig { path } => check_config(&path),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn resolve_config(opts: &ServeOptions) -> Result<ServerConfig, String> {
    let mut config = match &opts.config {
        Some(path) => ServerConfig::load(path).map_err(|e| e.to_string())?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &opts.host {
        config.host = host.clone();
    }
    if let Some(port) = opts.port {
        config.port = port;
    }
    if let Some(workers) = opts.workers {
        config.workers = workers;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the
/// configured level.
fn init_logging(config: &ServerConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {}", path.display(), e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn install_handlers(server: &Server, mode: Mode) {
    server.on_open(|id| {
        info!(conn = %id, "client connected");
        0
    });
    server.on_close(|id| {
        info!(conn = %id, "client disconnected");
        0
    });

    let handle = server.downgrade();
    server.on_text(move |id, text| {
        let Some(server) = handle.upgrade() else { return 0 };
        match mode {
            Mode::Echo => server.send_text(id, text),
            Mode::Broadcast => server.send_all_text(text),
        }
        0
    });
    let handle = server.downgrade();
    server.on_binary(move |id, data| {
        let Some(server) = handle.upgrade() else { return 0 };
        match mode {
            Mode::Echo => server.send_binary(id, data),
            Mode::Broadcast => server.send_all_binary(data),
        }
        0
    });
}

fn serve(opts: ServeOptions) -> Result<(), String> {
    let config = resolve_config(&opts)?;
    init_logging(&config)?;

    let server = Server::bind(config).map_err(|e| format!("failed to bind: {}", e))?;
    install_handlers(&server, opts.mode);
    server
        .start()
        .map_err(|e| format!("failed to start server: {}", e))?;
    info!(
        addr = %server.local_addr(),
        mode = ?opts.mode,
        "weaved ready"
    );

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let signal_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(StopReason::Signal);
    })
    .map_err(|e| format!("failed to install signal handler: {}", e))?;

    if !opts.no_stdin {
        let console = server.clone();
        thread::Builder::new()
            .name("weaved-console".to_string())
            .spawn(move || {
                run_console(&console);
                let _ = stop_tx.try_send(StopReason::Console);
            })
            .map_err(|e| format!("failed to start console: {}", e))?;
    }

    // The signal handler keeps a sender alive, so this only returns on a
    // stop request.
    if let Ok(reason) = stop_rx.recv() {
        info!(reason = ?reason, "shutting down");
    }
    server.stop();
    drain(&server, Duration::from_secs(5));
    Ok(())
}

/// Wait for the connections closed by `stop` to finish closing, so their
/// close frames go out before the process exits.
fn drain(server: &Server, limit: Duration) {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        match server.connections().recv_timeout(Duration::from_millis(500)) {
            Ok(ids) if ids.is_empty() => return,
            Ok(_) => thread::sleep(Duration::from_millis(20)),
            Err(_) => {
                warn!("server did not answer drain query");
                return;
            }
        }
    }
    warn!("connections still open at exit");
}

fn run_console(server: &Server) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "quit" => break,
            "status" => match server.connections().recv_timeout(Duration::from_secs(5)) {
                Ok(ids) => info!(connections = ids.len(), "status"),
                Err(_) => warn!("server did not answer status query"),
            },
            "" => {}
            other => warn!(command = %other, "unknown console command"),
        }
    }
}

fn check_config(path: &Path) -> Result<(), String> {
    let config = ServerConfig::load(path).map_err(|e| e.to_string())?;
    let rendered = toml::to_string_pretty(&config).map_err(|e| e.to_string())?;
    println!("{}: ok", path.display());
    print!("{}", rendered);
    Ok(())
}
