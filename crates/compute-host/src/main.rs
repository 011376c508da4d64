mod host;

use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use compute_core::services::config_loader::{self, CONFIG_FILENAME};
use compute_core::services::orchestrator::Orchestrator;
use compute_core::services::process_manager::HOST_CONTAINER_FLAG;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().collect();
    let debug = args.iter().any(|a| a == "--debug");
    let log_file = flag_value(&args, "--log-file").map(PathBuf::from);

    let _guard = setup_logging(debug, log_file.as_deref());

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    if args.iter().any(|a| a == HOST_CONTAINER_FLAG) {
        let port: u16 = flag_value(&args, "--port")
            .ok_or_else(|| eyre!("{HOST_CONTAINER_FLAG} requires --port"))?
            .parse()
            .wrap_err("--port must be a port number")?;
        let staging = flag_value(&args, "--staging")
            .map(PathBuf::from)
            .ok_or_else(|| eyre!("{HOST_CONTAINER_FLAG} requires --staging"))?;
        host::run_host(port, staging, shutdown).await
    } else {
        let config_path = flag_value(&args, "--config")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));
        run_orchestrator(&config_path, shutdown).await
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

async fn run_orchestrator(config_path: &Path, shutdown: CancellationToken) -> color_eyre::Result<()> {
    let config = config_loader::load(config_path)
        .wrap_err_with(|| format!("loading {}", config_path.display()))?;
    tracing::info!(
        config = %config_path.display(),
        instances = config.instance_count,
        package_folder = %config.package_folder.display(),
        "starting compute node"
    );

    let mut orchestrator = Orchestrator::new(config);
    orchestrator.run(shutdown).await?;
    Ok(())
}

/// Logs go to stderr, or to `log_file` when given.
/// The returned guard must be held for the duration of the program.
fn setup_logging(
    debug: bool,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
    });

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "compute-host.log".into());
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            None
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
