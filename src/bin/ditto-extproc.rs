use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use ditto_extproc::logging::init_tracing;
use ditto_extproc::runtime::{ConfigHandle, RuntimeConfig};
use ditto_extproc::server::{ExtProcServer, health_router};

#[derive(Parser)]
#[command(name = "ditto-extproc")]
struct Cli {
    /// Interceptor config (YAML, TOML or JSON).
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:1063")]
    listen: String,
    #[arg(long, default_value = "127.0.0.1:1064")]
    health_listen: String,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.json_logs) {
        eprintln!("ditto-extproc: failed to init logging: {err}");
        std::process::exit(1);
    }
    if let Err(err) = run(cli).await {
        eprintln!("ditto-extproc failed: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let shutdown = CancellationToken::new();
    let runtime = RuntimeConfig::load(&cli.config, &shutdown).await?;
    let config = Arc::new(ConfigHandle::new(runtime));
    let server = ExtProcServer::new(Arc::clone(&config), shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    let health_listener = tokio::net::TcpListener::bind(&cli.health_listen).await?;
    tracing::info!(
        listen = %cli.listen,
        health_listen = %cli.health_listen,
        "ditto-extproc listening"
    );

    let health = health_router(server.metrics());
    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        axum::serve(health_listener, health)
            .with_graceful_shutdown(async move { health_shutdown.cancelled().await })
            .await
    });

    #[cfg(unix)]
    spawn_reload_on_sighup(cli.config.clone(), Arc::clone(&config), shutdown.clone())?;

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        ctrl_c_shutdown.cancel();
    });

    server.serve(listener).await?;
    health_task.await??;
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_sighup(
    path: PathBuf,
    config: Arc<ConfigHandle>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            match config.reload(&path, &shutdown).await {
                Ok(()) => tracing::info!(path = %path.display(), "config reloaded"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "config reload failed; keeping current config")
                }
            }
        }
    });
    Ok(())
}
