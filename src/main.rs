//! Harbormaster - local process supervisor
//!
//! Launches components in dependency order, probes them with startup,
//! liveness and readiness checks, and restarts the unhealthy ones with
//! exponential backoff until a restart ceiling trips.

mod bridge;
mod cli;
mod component;
mod control;
mod error;
mod logbook;
mod manifest;
mod roster;
mod sickbay;
mod warden;

#[cfg(test)]
mod test_support;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Commands};
use control::{ControlClient, Method, Reply};
use error::{Error, Result};
use sickbay::ComponentStatus;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }

        Commands::Init { force } => {
            if cli.config.exists() && !force {
                eprintln!(
                    "Error: {} already exists. Use -y/--force to overwrite.",
                    cli.config.display()
                );
                std::process::exit(1);
            }
            std::fs::write(&cli.config, manifest::STARTER_MANIFEST)?;
            println!("Created {}", cli.config.display());
            Ok(())
        }

        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            let bridge = offline_bridge(&config, system_launcher(&config))?;
            println!("Configuration is valid.");
            println!("  Components: {}", config.components.len());
            println!("  Start order: {}", bridge.start_order()?.join(" -> "));
            println!("  Data dir: {}", config.daemon.data_dir.display());
            Ok(())
        }

        Commands::Daemon => {
            init_logging(cli.verbose, cli.log_file.as_deref())?;
            let config = manifest::load(&cli.config)?;
            runtime()?.block_on(daemon(config))
        }

        Commands::Status { json } => {
            let config = manifest::load(&cli.config)?;
            let reply = runtime()?.block_on(call(&config, Method::Status))?;
            let Reply::Status(status) = reply else {
                return Err(unexpected("status", &reply));
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }

        Commands::Stop { component } => {
            let config = manifest::load(&cli.config)?;
            let reply = runtime()?.block_on(call(&config, Method::Stop { component }))?;
            match reply {
                Reply::Stopped { component, outcome } => {
                    match outcome {
                        bridge::StopOutcome::AlreadyStopped => {
                            println!("{} was already stopped", component)
                        }
                        bridge::StopOutcome::Failed => println!("{}", failed_hint(&component)),
                        bridge::StopOutcome::Stopped => println!("Stopped {}", component),
                    }
                    Ok(())
                }
                other => Err(unexpected("stop", &other)),
            }
        }

        Commands::Restart { component } => {
            let config = manifest::load(&cli.config)?;
            let reply = runtime()?.block_on(call(&config, Method::Restart { component }))?;
            match reply {
                Reply::Restarted { component, state } => {
                    println!("Restarted {} ({})", component, state);
                    Ok(())
                }
                other => Err(unexpected("restart", &other)),
            }
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            })?;
        let file_layer = fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false);
        subscriber.with(file_layer).init();
    } else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose);
        subscriber.with(stderr_layer).init();
    }
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)
}

fn system_launcher(config: &manifest::HarbormasterConfig) -> component::SystemLauncher {
    component::SystemLauncher::new(config.daemon.log_dir(), config.daemon.stop_grace())
}

/// Bridge with every component registered and nothing launched
fn offline_bridge(
    config: &manifest::HarbormasterConfig,
    launcher: component::SystemLauncher,
) -> Result<bridge::Bridge> {
    let bridge = bridge::Bridge::new(
        Arc::new(roster::Roster::new()),
        Arc::new(launcher),
        logbook::Logbook::new(&config.daemon.data_dir),
    );
    for spec in config.specs() {
        bridge.register_component(spec)?;
    }
    Ok(bridge)
}

async fn daemon(config: manifest::HarbormasterConfig) -> Result<()> {
    let launcher = system_launcher(&config);
    let children = launcher.children();
    let bridge = Arc::new(offline_bridge(&config, launcher)?);
    let socket = config.daemon.socket_path();
    if ControlClient::new(&socket).call(Method::Ping).await.is_ok() {
        return Err(Error::Control(format!(
            "a daemon is already running on {}",
            socket.display()
        )));
    }

    info!(
        components = bridge.roster().count(),
        data_dir = %config.daemon.data_dir.display(),
        "harbormaster starting"
    );
    bridge.launch_all().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let warden = warden::Warden::new(
        Arc::clone(bridge.roster()),
        Arc::new(sickbay::SystemProber::tracking(children)),
        bridge.launcher(),
        bridge.logbook().clone(),
        config.daemon.timing(),
    );
    let warden_task = tokio::spawn(warden.run(shutdown_rx.clone()));

    let control_task = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { control::serve(&socket, bridge, shutdown_rx).await })
    };

    wait_for_signal().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    if let Err(e) = warden_task.await {
        error!(error = %e, "watchdog task panicked");
    }
    match control_task.await {
        Ok(Err(e)) => warn!(error = %e, "control socket exited with error"),
        Err(e) => error!(error = %e, "control socket task panicked"),
        Ok(Ok(())) => {}
    }

    bridge.stop_all().await;
    info!("harbormaster stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn call(config: &manifest::HarbormasterConfig, method: Method) -> Result<Reply> {
    ControlClient::new(config.daemon.socket_path()).call(method).await
}

fn unexpected(command: &str, reply: &Reply) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        message: format!("unexpected reply from daemon: {:?}", reply),
    }
}

fn print_status(status: &[ComponentStatus]) {
    if status.is_empty() {
        println!("No components configured");
        return;
    }

    println!(
        "{:<20} {:<15} {:<12} {:<14} {:>8} {:>9} {:<6} LAST ERROR",
        "ID", "KIND", "STATE", "HANDLE", "UPTIME", "RESTARTS", "READY"
    );
    for s in status {
        println!(
            "{:<20} {:<15} {:<12} {:<14} {:>8} {:>9} {:<6} {}",
            s.id,
            s.kind.to_string(),
            s.state.to_string(),
            s.handle.as_deref().unwrap_or("-"),
            s.uptime_secs.map(format_uptime).unwrap_or_else(|| "-".to_string()),
            format!("{}/{}", s.restarts_in_window, s.restart_count),
            if s.ready { "yes" } else { "no" },
            s.last_error.as_deref().unwrap_or("-"),
        );
    }

    for s in status {
        if let Some(action) = &s.action {
            println!();
            println!("{}: {}", s.id, action);
        }
    }
}

fn failed_hint(component: &str) -> String {
    format!(
        "{} is failed; run `harbormaster restart {}` to start it again",
        component, component
    )
}

fn format_uptime(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}
