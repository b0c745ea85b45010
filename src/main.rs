use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctrlc_relay::process::signal::StopListener;
use ctrlc_relay::process::{is_process_alive, SessionStatus};
use ctrlc_relay::{CommandSpec, RelayClient, RelayConfig, RelayServer, RelaySession, SessionRegistry};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SERVER_REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "ctrlc-relay")]
#[command(about = "Relay a console interrupt to a process group over a loopback connection", long_about = None)]
struct Args {
    /// Config file to use instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start COMMAND, then interrupt its process group when asked to on PORT
    Serve {
        /// Quoted command line of the target process
        command: String,

        /// Loopback port to accept the control connection on
        port: u16,

        /// Milliseconds to wait before exiting when the server itself is interrupted
        #[arg(long)]
        grace_ms: Option<u64>,
    },

    /// Run a command through a relay and interrupt it when the launcher is stopped
    Launch {
        /// Control port (default: from config, 0 picks a free port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds to wait for the target after requesting termination
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,

        /// Target executable and arguments
        #[arg(required = true, last = true)]
        argv: Vec<String>,
    },

    /// List live relay sessions
    List,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:?}");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Cmd::Serve {
            command,
            port,
            grace_ms,
        } => {
            let grace = grace_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.grace_period());
            serve(&command, port, grace).await
        }
        Cmd::Launch {
            port,
            wait_secs,
            argv,
        } => report(launch(config, port, Duration::from_secs(wait_secs), argv).await),
        Cmd::List => report(list(&config)),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(RelayConfig::load()),
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(command: &str, port: u16, grace: Duration) -> ExitCode {
    let result = match CommandSpec::parse(command) {
        Ok(command) => {
            let mut server = RelayServer::new(command, port, grace);
            server.run().await
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(outcome) => {
            info!(?outcome, "relay server finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("relay server failed: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}

async fn launch(
    mut config: RelayConfig,
    port: Option<u16>,
    wait: Duration,
    argv: Vec<String>,
) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    let command = CommandSpec::new(argv)?;

    // Installed first so a stop request during startup is not lost
    let mut stop = StopListener::install().context("Failed to install signal handlers")?;

    let spawn_config = config.clone();
    let spawn_command = command.clone();
    let mut client =
        tokio::task::spawn_blocking(move || RelayClient::spawn(&spawn_command, &spawn_config))
            .await?
            .context("Failed to start relay")?;

    let target_pid = client.target_pid();
    let mut registry = SessionRegistry::load_from(config.registry_path())?;
    let session = RelaySession::new(
        client.port(),
        client.server_pid(),
        target_pid,
        command.to_command_line(),
    );
    let session_id = session.session_id;
    registry.register(session)?;
    info!(%session_id, port = client.port(), target_pid, "relay session started");

    let mut poll = tokio::time::interval(TARGET_POLL_INTERVAL);
    let stop_requested = loop {
        tokio::select! {
            _ = stop.recv() => break true,
            _ = poll.tick() => {
                if !is_process_alive(target_pid) {
                    break false;
                }
            }
        }
    };

    let mut client = if stop_requested {
        registry.update_status(session_id, SessionStatus::Terminating)?;
        tokio::task::spawn_blocking(move || -> Result<RelayClient> {
            client.request_termination()?;
            if client.wait_for_target_exit(wait) {
                info!(target_pid, "target exited");
            } else {
                warn!(
                    target_pid,
                    wait_secs = wait.as_secs(),
                    "target still running after termination request"
                );
            }
            Ok(client)
        })
        .await??
    } else {
        info!(target_pid, "target exited on its own");
        client.close();
        client
    };

    let status = tokio::task::spawn_blocking(move || client.wait_for_server(SERVER_REAP_TIMEOUT))
        .await??;
    match status {
        Some(status) => info!(%status, "relay server exited"),
        None => warn!("relay server still running"),
    }

    registry.unregister(session_id)?;
    Ok(())
}

fn list(config: &RelayConfig) -> Result<()> {
    let mut registry = SessionRegistry::load_from(config.registry_path())?;
    for dead in registry.cleanup_dead()? {
        info!(session_id = %dead.session_id, port = dead.port, "removed stale session");
    }

    let sessions = registry.sessions();
    if sessions.is_empty() {
        println!("No relay sessions");
        return Ok(());
    }

    println!(
        "{:<36}  {:>5}  {:>8}  {:>8}  {:<11}  {:<19}  COMMAND",
        "SESSION", "PORT", "SERVER", "TARGET", "STATUS", "STARTED"
    );
    for s in sessions {
        println!(
            "{:<36}  {:>5}  {:>8}  {:>8}  {:<11}  {:<19}  {}",
            s.session_id.to_string(),
            s.port,
            s.server_pid,
            s.target_pid,
            s.status.to_string(),
            s.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            s.command
        );
    }

    Ok(())
}
