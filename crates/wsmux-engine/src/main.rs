//! wsmux binary entry point.
//!
//! Bridges the current terminal to a registry-managed session: setup
//! commands run first, then a tab or runner is created, attached, and
//! wired to raw-mode stdio until either side hangs up.

use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use wsmux_core::error::{Error, Result};
use wsmux_core::session::{RunnerMeta, SessionId, SessionState};
use wsmux_engine::cli::Cli;
use wsmux_engine::registry::{RegistryHandle, RunnerConfig, SessionEvent, SessionRegistry};
use wsmux_engine::terminal::{self, RawModeGuard, StdinReader, StdoutWriter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    let log_format = cli.log_format.into();
    if let Err(e) = wsmux_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "wsmux starting");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // The error path may be reached with the terminal still raw
            terminal::restore_terminal();
            error!(error = %e, "wsmux failed");
            eprintln!("wsmux: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let registry = SessionRegistry::spawn();
    let mut events = registry.subscribe();
    let (cols, rows) = terminal::terminal_size();

    // Setup commands run to completion, in order, before the main session
    if !cli.setup.is_empty() {
        let setups = registry
            .create_setup_sessions(
                cli.workspace.clone(),
                cli.working_dir.clone(),
                cli.setup.clone(),
            )
            .await?;
        for info in setups {
            info!(session = %info.id, command = %info.title, "running setup command");
            let mut output_rx = registry.attach(&info.id, cols, rows).await?;
            let mut stdout = StdoutWriter::new();
            while let Some(chunk) = output_rx.recv().await {
                stdout.write(&chunk).await?;
            }
            let state = wait_for_exit(&registry, &mut events, &info.id).await?;
            if state != SessionState::Succeeded {
                registry.shutdown().await?;
                eprintln!("wsmux: setup command failed: {}", info.title);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let info = if let Some(command) = cli.command.clone() {
        registry
            .create_runner(
                cli.workspace.clone(),
                RunnerConfig {
                    name: cli.runner_name().to_string(),
                    title: cli.runner_name().to_string(),
                    working_dir: cli.working_dir.clone(),
                    initial_command: command,
                    defer: false,
                    meta: RunnerMeta::default(),
                },
            )
            .await?
    } else {
        registry
            .create_tab(cli.workspace.clone(), cli.working_dir.clone(), None)
            .await?
    };
    let id = info.id.clone();
    info!(session = %id, "attaching");

    let mut output_rx = registry.attach(&id, cols, rows).await?;

    // Runners get their listening ports logged as the scanner finds them
    if cli.is_runner() {
        let mut epoch_rx = registry.port_epoch();
        let port_registry = registry.clone();
        let port_id = id.clone();
        tokio::spawn(async move {
            while epoch_rx.changed().await.is_ok() {
                if let Ok(Some(info)) = port_registry.session(&port_id).await {
                    info!(session = %port_id, ports = ?info.ports, "listening ports");
                }
            }
        });
    }

    // Raw mode lets every byte through to the session; without a tty
    // (piped stdio) run cooked and carry on
    let raw_guard = match RawModeGuard::enter() {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(error = %e, "raw mode unavailable, continuing without it");
            None
        }
    };

    let mut stdin = StdinReader::new();
    let mut stdout = StdoutWriter::new();
    let mut winch = signal(SignalKind::window_change()).map_err(Error::Io)?;
    let mut session_ended = false;

    loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Some(data) => stdout.write(&data).await?,
                None => {
                    session_ended = true;
                    break;
                }
            },
            data = stdin.read() => match data {
                Some(bytes) => registry.write(&id, Bytes::from(bytes)).await?,
                None => break,
            },
            _ = winch.recv() => {
                let (cols, rows) = terminal::terminal_size();
                let _ = registry.resize(&id, cols, rows).await;
            }
        }
    }

    drop(raw_guard);

    let state = if session_ended {
        Some(wait_for_exit(&registry, &mut events, &id).await?)
    } else {
        // Detached by stdin EOF while the session keeps running
        registry.session(&id).await?.map(|info| info.state)
    };
    registry.shutdown().await?;
    info!(state = ?state, "wsmux exiting");

    Ok(match state {
        Some(SessionState::Failed) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Wait until the session reaches a terminal state, following the event
/// stream but re-querying around any gaps.
async fn wait_for_exit(
    registry: &RegistryHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    id: &SessionId,
) -> Result<SessionState> {
    loop {
        match registry.session(id).await? {
            Some(info) if info.state.is_terminal() => return Ok(info.state),
            Some(_) => {}
            None => return Err(Error::SessionNotFound(id.clone())),
        }
        match events.recv().await {
            Ok(SessionEvent::StateChanged { id: changed, state })
                if changed == *id && state.is_terminal() =>
            {
                return Ok(state);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Channel {
                    message: "registry event stream closed".to_string(),
                });
            }
        }
    }
}
