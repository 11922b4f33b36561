use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use callguard::limiter::Admission;
use callguard::server::{set_not_serving, Bootstrap, DirectoryServiceImpl, ServerConfig};
use callguard::session::{MemoryCredentialStore, MemorySessionStore, SessionManager};
use callguard::telemetry::{self, CallMetrics};
use clap::Parser;
use crossterm::execute;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use rand_core::{OsRng, RngCore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::{signal, time};
use tonic_health::server::HealthReporter;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "callguard gRPC server", long_about = None)]
#[command(version)]
struct Args {
    /// Host to bind to (overrides configuration)
    #[arg(short = 'H', long, env = "CALLGUARD_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides configuration)
    #[arg(short, long, env = "CALLGUARD_PORT")]
    port: Option<u16>,

    /// Enable the Prometheus metrics endpoint
    #[arg(long, env = "CALLGUARD_METRICS")]
    metrics: bool,

    /// Metrics port (overrides configuration)
    #[arg(long, env = "CALLGUARD_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CALLGUARD_LOG_JSON")]
    log_json: bool,

    /// Disable the interactive operator console
    #[arg(long)]
    no_repl: bool,
}

enum Command {
    Status,
    Users,
    Sessions,
    Cleanup,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(input: &str) -> Self {
        let input = input.trim();

        if input.is_empty() {
            return Command::Unknown(String::new());
        }

        if !input.starts_with('/') {
            return Command::Unknown(
                "Commands must start with '/'. Type /help for available commands.".to_string(),
            );
        }

        let cmd = input.split_whitespace().next().unwrap_or("").to_lowercase();

        match cmd.as_str() {
            "/status" | "/st" => Command::Status,
            "/users" | "/u" => Command::Users,
            "/sessions" | "/s" => Command::Sessions,
            "/cleanup" | "/gc" => Command::Cleanup,
            "/help" | "/h" | "/?" => Command::Help,
            "/quit" | "/exit" | "/q" => Command::Quit,
            _ => Command::Unknown(format!(
                "Unknown command: {cmd}. Type /help for available commands."
            )),
        }
    }
}

fn print_colored(color: Color, text: &str) {
    let mut stdout = io::stdout();
    execute!(stdout, SetForegroundColor(color), Print(text), ResetColor).ok();
    stdout.flush().ok();
}

fn println_colored(color: Color, text: &str) {
    print_colored(color, text);
    println!();
}

fn display_banner() {
    println!();
    println_colored(
        Color::Cyan,
        "+---------------------------------------------------------+",
    );
    println_colored(
        Color::Cyan,
        "|                  callguard gRPC server                  |",
    );
    println_colored(
        Color::Cyan,
        "+---------------------------------------------------------+",
    );
    println!();
}

fn display_help() {
    println!();
    println_colored(Color::Yellow, "Available Commands:");
    println!();
    println!("  /status              - Show server status and configuration");
    println!("  /users               - Show registered users count");
    println!("  /sessions            - Show live sessions count");
    println!("  /cleanup             - Purge expired sessions and idle limiter buckets");
    println!("  /help                - Show this help message");
    println!("  /quit or /exit       - Initiate graceful shutdown");
    println!();
}

fn display_prompt(addr: &str) {
    print_colored(Color::Green, &format!("callguard@{addr}"));
    print_colored(Color::White, "> ");
    io::stdout().flush().ok();
}

/// State the operator console and the cleanup task act on.
#[derive(Clone)]
struct Operations {
    sessions: SessionManager,
    store: MemorySessionStore,
    admission: Arc<dyn Admission>,
}

impl Operations {
    async fn cleanup(&self) -> usize {
        let purged = self.store.purge_expired().await;
        self.admission.prune_idle().await;
        purged
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_tracing("info", args.log_json)?;
    telemetry::install_panic_hook();

    if !args.no_repl {
        display_banner();
    }

    let mut config = ServerConfig::from_env().unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        info!("Using default configuration");
        ServerConfig::default()
    });

    if let Some(host) = args.host {
        config.host = host.clone();
        config.metrics.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.metrics {
        config.metrics.enabled = true;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }

    if config.token.secret.is_empty() {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        config.token.secret = hex::encode(secret);
        warn!(
            "No token secret configured; generated an ephemeral one \
             (credentials will not survive a restart)"
        );
    }

    if let Err(e) = config.validate() {
        println_colored(Color::Red, &format!("Configuration validation failed: {e}"));
        return Err(format!("Invalid configuration: {e}").into());
    }

    let store = MemorySessionStore::new();
    let sessions = SessionManager::new(
        Arc::new(store.clone()),
        Arc::new(MemoryCredentialStore::new()),
        config.session.ttl(),
    );
    let admission = config.rate_limit.build_admission();

    let metrics = if config.metrics.enabled {
        Arc::new(CallMetrics::with_exporter(config.metrics.addr()?)?)
    } else {
        Arc::new(CallMetrics::new()?)
    };

    let ops = Operations {
        sessions: sessions.clone(),
        store,
        admission: admission.clone(),
    };

    let cleanup_ops = ops.clone();
    let cleanup_interval = config.session.cleanup_interval();
    tokio::spawn(async move {
        loop {
            let ops = cleanup_ops.clone();
            let cleanup_handle = tokio::spawn(async move {
                let mut interval = time::interval(cleanup_interval);
                loop {
                    interval.tick().await;
                    let purged = ops.cleanup().await;
                    if purged > 0 {
                        info!(purged, "expired sessions purged");
                    }
                }
            });

            match cleanup_handle.await {
                Ok(()) => {
                    error!("Cleanup task terminated unexpectedly, restarting...");
                }
                Err(e) => {
                    error!("Cleanup task panicked: {:?}, restarting...", e);
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    let bootstrap = Bootstrap::bind(
        &config,
        sessions,
        admission,
        metrics,
        DirectoryServiceImpl::default(),
    )
    .await?;

    let addr = bootstrap.local_addr();
    let addr_str = addr.to_string();

    println_colored(Color::Green, &format!("Server starting on {addr}"));
    println_colored(
        Color::White,
        &format!(
            "  Rate limit: capacity {}, refill {}/s ({:?})",
            config.rate_limit.capacity, config.rate_limit.refill_per_second, config.rate_limit.scope
        ),
    );
    println_colored(
        Color::White,
        &format!(
            "  Metrics: {}",
            if config.metrics.enabled { "enabled" } else { "disabled" }
        ),
    );
    println_colored(Color::White, "  Health check: enabled");
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_reporter = bootstrap.health();

    let server_handle = tokio::spawn(async move {
        bootstrap
            .serve_with_shutdown(shutdown_signal(shutdown_reporter, shutdown_rx))
            .await
    });

    if !args.no_repl {
        println_colored(
            Color::Yellow,
            "Type /help for available commands or /quit to exit",
        );
        println!();

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            display_prompt(&addr_str);

            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    println_colored(Color::Red, &format!("Error reading input: {e}"));
                    continue;
                }
            }

            match Command::parse(&line) {
                Command::Status => {
                    let user_count = ops.sessions.user_count().await.unwrap_or(0);
                    let session_count = ops.store.len().await;

                    println!();
                    println_colored(Color::Cyan, "Server Status:");
                    println_colored(Color::White, &format!("  Address: {addr}"));
                    println_colored(
                        Color::White,
                        &format!("  Environment: {}", config.environment),
                    );
                    println_colored(
                        Color::White,
                        &format!(
                            "  Rate limit: capacity {}, refill {}/s",
                            config.rate_limit.capacity, config.rate_limit.refill_per_second
                        ),
                    );
                    println_colored(
                        Color::White,
                        &format!("  Session TTL: {}s", ops.sessions.ttl().as_secs()),
                    );
                    println_colored(
                        Color::White,
                        &format!("  Admins configured: {}", config.admins.len()),
                    );
                    println!();
                    println_colored(Color::Cyan, "State:");
                    println_colored(Color::White, &format!("  Registered users: {user_count}"));
                    println_colored(Color::White, &format!("  Live sessions: {session_count}"));
                    println!();
                }
                Command::Users => {
                    let count = ops.sessions.user_count().await.unwrap_or(0);
                    println_colored(Color::Cyan, &format!("Registered users: {count}"));
                }
                Command::Sessions => {
                    let count = ops.store.len().await;
                    println_colored(Color::Cyan, &format!("Live sessions: {count}"));
                }
                Command::Cleanup => {
                    println_colored(Color::White, "Running cleanup...");
                    let purged = ops.cleanup().await;
                    println_colored(
                        Color::Green,
                        &format!("Cleanup complete ({purged} expired sessions purged)"),
                    );
                }
                Command::Help => {
                    display_help();
                }
                Command::Quit => {
                    println!();
                    println_colored(Color::Yellow, "Initiating graceful shutdown...");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                Command::Unknown(msg) => {
                    if !msg.is_empty() {
                        println_colored(Color::Red, &msg);
                    }
                }
            }
        }
    }

    match server_handle.await {
        Ok(Ok(())) => {
            println_colored(Color::Green, "Server shutdown complete. Goodbye!");
        }
        Ok(Err(e)) => {
            println_colored(Color::Red, &format!("Server error: {e}"));
        }
        Err(e) => {
            println_colored(Color::Red, &format!("Server task panicked: {e}"));
        }
    }

    println!();
    Ok(())
}

async fn shutdown_signal(
    mut health_reporter: HealthReporter,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let repl_quit = async {
        while shutdown_rx.changed().await.is_ok() {
            if *shutdown_rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
        _ = repl_quit => {
            info!("Shutdown requested via REPL");
        },
    }

    set_not_serving(&mut health_reporter).await;

    info!("Initiating graceful shutdown (allowing in-flight requests to complete)");

    tokio::time::sleep(Duration::from_secs(2)).await;
}
