//! kubeterm - terminal and log-tail client for a Kubernetes dashboard backend.
//!
//! `kubeterm exec` opens (or re-attaches to) a remote shell in a pod
//! container; `kubeterm logs` tails a filtered multi-pod log feed and keeps
//! reconnecting with bounded linear backoff.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubeterm::config::{Config, ConfigError};
use kubeterm::logstream::{CloseReason, LogEvent, LogFilter, LogStreamClient};
use kubeterm::portal::ContainerId;
use kubeterm::registry::SessionRegistry;
use kubeterm::session::{ExecTarget, SessionError, SessionId, SessionState};
use kubeterm::terminal::{self, StdoutSurfaceFactory};
use kubeterm::transport::WsConnector;
use kubeterm::MuxError;

/// Detach key (Ctrl-]), as in telnet.
const DETACH_BYTE: u8 = 0x1d;

/// kubeterm - shells and log tails for Kubernetes pods
#[derive(ClapParser, Debug)]
#[command(name = "kubeterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (defaults to ~/.config/kubeterm/config.toml)
    #[arg(long, env = "KUBETERM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// WebSocket base URL of the dashboard backend
    #[arg(long, env = "KUBETERM_URL", global = true)]
    url: Option<String>,

    /// Bearer token for the dashboard backend
    #[arg(long, env = "KUBETERM_TOKEN", global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open an interactive shell in a container
    Exec {
        #[arg(short, long)]
        pod: String,

        /// Cluster (kubeconfig context)
        #[arg(long)]
        context: String,

        #[arg(short, long, default_value = "default")]
        namespace: String,

        #[arg(short = 'C', long)]
        container: String,

        /// Session id (defaults to context/namespace/pod/container)
        #[arg(long)]
        id: Option<String>,
    },

    /// Tail logs from one or more pods
    Logs {
        #[arg(long = "cluster")]
        clusters: Vec<String>,

        #[arg(short, long = "namespace")]
        namespaces: Vec<String>,

        #[arg(short, long = "pod")]
        pods: Vec<String>,

        #[arg(short = 'C', long = "container")]
        containers: Vec<String>,

        /// Severity filter (e.g. error, warn)
        #[arg(short, long = "level")]
        levels: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("{0}")]
    Mux(#[from] MuxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Commands::Exec {
                pod,
                context,
                namespace,
                container,
                id,
            } => {
                let target = ExecTarget::new(context, namespace, pod, container);
                run_exec(config, target, id).await
            }
            Commands::Logs {
                clusters,
                namespaces,
                pods,
                containers,
                levels,
            } => {
                let filter = LogFilter::default()
                    .clusters(clusters)
                    .namespaces(namespaces)
                    .pods(pods)
                    .containers(containers)
                    .levels(levels);
                run_logs(config, filter).await
            }
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("kubeterm: {}", e);
        std::process::exit(1);
    }
}

/// Tracing goes to stderr; stdout belongs to the remote terminal.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kubeterm=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = match cli.config.clone().or_else(Config::default_path) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if let Some(ref url) = cli.url {
        config.endpoint.base_url = url.clone();
    }
    if cli.token.is_some() {
        config.endpoint.token = cli.token.clone();
    }
    config.validate()?;
    Ok(config)
}

fn connector(config: &Config) -> WsConnector {
    WsConnector::new(config.endpoint.token.clone())
        .with_handshake_timeout(config.handshake_timeout())
        .with_ping_interval(config.ping_interval())
}

async fn run_exec(config: Config, target: ExecTarget, id: Option<String>) -> Result<(), CliError> {
    let registry = SessionRegistry::new(
        Arc::new(connector(&config)),
        Arc::new(StdoutSurfaceFactory),
        config.registry_options(),
    );
    let id = id
        .map(SessionId::from)
        .unwrap_or_else(|| SessionId::for_target(&target));
    let session = registry
        .get_or_create(id.clone(), target)
        .map_err(MuxError::from)?;

    let stdout = ContainerId::from("stdout");
    registry.portal().mount_container(stdout.clone());

    let raw_guard = terminal::RawModeGuard::new()?;
    let result = exec_loop(&registry, &id, &stdout).await;
    drop(raw_guard);

    let final_state = session.state();
    registry.shutdown();
    result?;
    if let SessionState::Error(reason) = final_state {
        eprintln!("kubeterm: session ended: {}", reason);
    }
    Ok(())
}

async fn exec_loop(
    registry: &SessionRegistry,
    id: &SessionId,
    container: &ContainerId,
) -> Result<(), CliError> {
    let session = registry
        .get(id)
        .ok_or_else(|| MuxError::UnknownSession(id.clone()))?;
    let mut state_rx = session.subscribe_state();
    registry.attach(id, container).map_err(MuxError::from)?;
    registry.focus(id).map_err(MuxError::from)?;

    let mut stdin_rx = terminal::spawn_input_reader(std::io::stdin())?;

    let mut sigwinch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    loop {
        tokio::select! {
            data = stdin_rx.recv() => {
                let Some(data) = data else { break };
                if data.contains(&DETACH_BYTE) {
                    break;
                }
                match session.write(data) {
                    Ok(()) => {}
                    Err(SessionError::NotConnected(_)) => {
                        tracing::debug!(session = %id, "dropping input while not connected");
                    }
                    Err(e) => return Err(MuxError::from(e).into()),
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                tracing::debug!(session = %id, %state, "session state changed");
                if matches!(state, SessionState::Error(_) | SessionState::Closed) {
                    break;
                }
            }
            _ = sigwinch.recv() => {
                registry.refit(id).map_err(MuxError::from)?;
            }
        }
    }

    registry.detach_from(id, container).map_err(MuxError::from)?;
    Ok(())
}

async fn run_logs(config: Config, filter: LogFilter) -> Result<(), CliError> {
    let client = LogStreamClient::new(
        Arc::new(connector(&config)),
        config.endpoint.base_url.clone(),
        config.reconnect_policy(),
    );
    let (subscription, mut events) = client.subscribe(filter);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    LogEvent::Line(line) => println!("{}", line),
                    LogEvent::Info(text) => eprintln!("kubeterm: {}", text),
                    LogEvent::Error(text) => eprintln!("kubeterm: stream error: {}", text),
                    LogEvent::Connected => tracing::info!(url = %subscription.url(), "log stream connected"),
                    LogEvent::Reconnecting { attempt, delay } => {
                        eprintln!("kubeterm: connection lost, reconnecting in {:?} (attempt {})", delay, attempt);
                    }
                    LogEvent::Closed(reason) => {
                        if let Some(e) = reason.as_error() {
                            return Err(e.into());
                        }
                        if reason == CloseReason::Completed {
                            eprintln!("kubeterm: log stream ended");
                        }
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                subscription.unsubscribe();
            }
        }
    }

    subscription.join().await;
    Ok(())
}
