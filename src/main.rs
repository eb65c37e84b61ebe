use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

mod api;
mod cli;
mod config;
mod error;
mod metrics;
mod models;
mod policy;
mod services;
mod state;
mod supervisor;
#[cfg(test)]
mod testing;

use cli::{commands, Command, CommandArgs};
use config::{load_config, GuardianConfig};
use error::GuardianError;
use services::lock::running_instance;
use services::{CommandTransport, Dispatcher, OsLauncher, SysinfoSource};
use state::new_board;
use supervisor::Mode;

/// Supervising modes log to `supervisor.log_file` when set; clients and
/// everything else log to stderr.
fn init_logger(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = CommandArgs::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let supervising = matches!(args.command, Command::Up | Command::Start);
    init_logger(config.settings.log_file.as_deref().filter(|_| supervising))?;
    log::info!(
        "Loaded {} process(es) from {}",
        config.processes.len(),
        args.config.display()
    );

    match args.command {
        Command::Up => serve(config, Mode::Up).await,
        Command::Start => serve(config, Mode::Start).await,
        Command::Down => commands::shutdown(&config, "down").await,
        Command::Stop => commands::shutdown(&config, "stop").await,
        Command::Restart { id } => commands::restart(&config, id.as_deref()).await,
        Command::Logs { id, follow, lines } => commands::logs(&config, id.as_deref(), follow, lines).await,
        Command::Status { json } => commands::status(&config, json).await,
    }
}

/// Resolves on SIGINT, SIGTERM or SIGQUIT.
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Flip the shutdown channel once `signal` resolves.
///
/// If the handlers cannot be installed the sender is held forever: a closed
/// channel would end supervision at once.
async fn forward_shutdown<F>(signal: F, shutdown_tx: watch::Sender<bool>)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            log::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        Err(e) => {
            log::error!("Failed to install signal handlers: {}", e);
            let _keep = shutdown_tx;
            std::future::pending::<()>().await;
        }
    }
}

async fn serve(config: GuardianConfig, mode: Mode) -> anyhow::Result<()> {
    // 先检查锁，避免端口冲突掩盖真正的原因
    if let Some(record) = running_instance(&config.settings.lock_file) {
        return Err(GuardianError::StartupBlocked {
            pid: record.pid,
            since: record.created_at.to_rfc3339(),
        }
        .into());
    }

    let board = new_board(mode.as_str());
    let (control_tx, control_rx) = mpsc::channel(8);
    board
        .lock()
        .map_err(|_| anyhow!("status board poisoned"))?
        .control = Some(control_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    actix_rt::spawn(forward_shutdown(wait_for_shutdown_signal(), shutdown_tx));

    let app_board = board.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_board.clone()))
            .configure(api::configure)
    })
    .disable_signals()
    .workers(1)
    .bind(&config.settings.api_address)
    .with_context(|| format!("binding {}", config.settings.api_address))?
    .run();
    let server_handle = server.handle();
    actix_rt::spawn(server);

    print_banner(&config, mode);

    let notifier = Arc::new(Dispatcher::new(&config.notifications, Arc::new(CommandTransport)));
    let result = supervisor::run(
        config,
        mode,
        Box::new(SysinfoSource::new()),
        Box::new(OsLauncher::new()),
        notifier,
        board,
        shutdown_rx,
        control_rx,
    )
    .await;

    server_handle.stop(true).await;
    result?;
    log::info!("Guardian exited cleanly");
    Ok(())
}

fn print_banner(config: &GuardianConfig, mode: Mode) {
    let managed = config.processes.iter().filter(|p| p.is_managed()).count();
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Stack Guardian v{:<37}║", env!("CARGO_PKG_VERSION"));
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Mode: {} ({} managed, {} observed)", mode, managed, config.processes.len() - managed);
    println!("🔒 Lock: {}", config.settings.lock_file.display());
    if let Some(log_file) = &config.settings.log_file {
        println!("📝 Log:  {}", log_file.display());
    }
    println!();
    println!("📋 Available endpoints on http://{}:", config.settings.api_address);
    println!("  GET    /status                 - Process status");
    println!("  POST   /restart                - Restart all managed processes");
    println!("  POST   /restart/{{id}}           - Restart a managed process");
    println!("  GET    /metrics                - Prometheus metrics");
    println!("  GET    /health                 - Health check");
    println!("═══════════════════════════════════════════════════════════");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_flips_the_shutdown_channel() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok(()) }, tx));

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failed_signal_setup_keeps_the_channel_open() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signals")) },
            tx,
        ));

        // A closed channel would resolve `changed()` with an error right away
        let waited = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
        assert!(waited.is_err());
        assert!(!*rx.borrow());
    }
}
