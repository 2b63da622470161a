use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;

use volute_gateway::{app, bootstrap};

#[derive(Parser)]
#[command(name = "voluted", about = "Local orchestration daemon for minds")]
struct Cli {
    /// Home directory override (default: $VOLUTE_HOME or ~/.volute).
    #[arg(long, global = true)]
    home: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volute=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.home.as_deref()).await,
    }
}

async fn serve(home_override: Option<&str>) -> anyhow::Result<()> {
    let home = VoluteHome::resolve(home_override);
    let config = DaemonConfig::load(&home.daemon_config())?;
    let state = bootstrap::build_state(home.clone(), config)?;

    std::fs::write(home.daemon_pid(), format!("{}\n", std::process::id()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    bootstrap::spawn_background_loops(state.clone(), shutdown_rx.clone());
    bootstrap::reconcile_running_minds(&state);

    let addr: SocketAddr =
        format!("{}:{}", state.config.hostname, state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "volute daemon listening");

    let router = app::build_router(state.clone());
    let mut shutdown_signal_rx = shutdown_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_signal_rx.changed().await;
    });

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;
    bootstrap::shutdown(&state).await;
    Ok(())
}

async fn wait_for_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
