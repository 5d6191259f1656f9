//! Secretary Gateway server
//!
//! Loads every active task from storage, brings the backends online and
//! serves the aggregated tool namespace over SSE (default) or stdio
//! (`--stdio` / `GATEWAY_STDIO_MODE=true`).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secretary_gateway::{
    logging, startup, Config, ProxyServer, SseProxyServer, StdioProxyServer,
    UserSecretaryRegistry,
};
use secretary_shared::FileStorage;

/// How long the serving loop may take to wind down once shutdown returns
const RUN_EXIT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present; real environment wins
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config.with_args(std::env::args()),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.log_format);

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Gateway failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage_dir = %config.storage_dir.display(),
        stdio_mode = config.stdio_mode,
        "Starting secretary gateway"
    );

    let storage = FileStorage::new(config.storage_dir.clone());
    let tasks = startup::load_active_tasks(&storage)
        .await
        .context("Failed to load tasks from storage")?;

    let users = Arc::new(UserSecretaryRegistry::new());
    let server: Arc<dyn ProxyServer> = if config.stdio_mode {
        Arc::new(StdioProxyServer::new(
            users,
            config.stdio_user_id.clone(),
            config.health_interval,
        ))
    } else {
        Arc::new(SseProxyServer::new(
            users,
            config.sse_server(),
            config.health_interval,
        ))
    };

    for task in tasks {
        server.core().register_task(task).await;
    }

    server
        .initialize()
        .await
        .context("Failed to initialize proxy server")?;

    let runner = Arc::clone(&server);
    let mut run = tokio::spawn(async move { runner.run().await });

    let finished = tokio::select! {
        joined = &mut run => Some(joined),
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            None
        }
    };

    // Stops intake, drains in-flight calls, then closes backends
    server.shutdown(config.shutdown_timeout).await;

    let joined = match finished {
        Some(joined) => joined,
        None => match tokio::time::timeout(RUN_EXIT_GRACE, &mut run).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Serving loop did not stop after shutdown; aborting it");
                run.abort();
                return Ok(());
            }
        },
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Proxy server stopped with error"),
        Err(e) => tracing::error!(error = %e, "Proxy server task failed"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
