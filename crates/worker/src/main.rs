use std::process::ExitCode;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genjob_core::output::JobOutput;
use genjob_worker::config::WorkerConfig;
use genjob_worker::handler::{handle_job, JobRequest};

/// Reads a job document (`{"id": ..., "input": {...}}`) from the file
/// named by the first argument, or from stdin, and prints the result
/// JSON on stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        comfy_host = %config.comfy_host,
        refresh_worker = config.refresh_worker,
        "Loaded worker configuration",
    );

    // --- Job ---
    let request = match read_job(std::env::args().nth(1)).await {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "Could not read job document");
            emit(&JobOutput::failure(format!("Invalid job document: {e}")));
            return ExitCode::FAILURE;
        }
    };

    // --- Cancellation ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let job_id = request.id.clone().unwrap_or_else(|| "local".to_string());
    let span = tracing::info_span!("job", job_id = %job_id);
    let output = handle_job(&config, &request.input, &cancel)
        .instrument(span)
        .await;

    emit(&output);
    ExitCode::SUCCESS
}

/// Load the job document from `path`, or stdin when absent.
async fn read_job(path: Option<String>) -> std::io::Result<JobRequest> {
    let raw = match path {
        Some(path) => tokio::fs::read_to_string(&path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    serde_json::from_str(&raw).map_err(std::io::Error::from)
}

/// Print the result as one JSON line.
fn emit(output: &JobOutput) {
    match serde_json::to_string(output) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize job output"),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), cancelling job");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, cancelling job");
        }
    }
}
