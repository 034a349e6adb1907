use std::{future::IntoFuture, process};

use cachegate::{
    application::{Coordinator, broadcast_to_nodes, error::AppError},
    config,
    infra::{error::InfraError, telemetry},
};
use cachegate_api_types::PurgeRequest;
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => {
            run_broadcast(&settings, PurgeRequest::exact(args.path), args.retry).await
        }
        config::Command::Ban(args) => {
            run_broadcast(&settings, PurgeRequest::ban(args.pattern), args.retry).await
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let coordinator = Coordinator::from_settings(&settings)?;

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        node = coordinator.node().id(),
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "Listening"
    );

    let background = coordinator.spawn_background();
    coordinator.run_startup_ban().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let public_server = axum::serve(
        public_listener,
        coordinator.public_router().into_make_service(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(
        admin_listener,
        coordinator.admin_router().into_make_service(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    let servers = async {
        try_join!(public_server.into_future(), admin_server.into_future())
            .map_err(|err| AppError::unexpected(format!("server error: {err}")))
    };
    tokio::pin!(servers);

    let finished = tokio::select! {
        result = &mut servers => Some(result),
        () = shutdown_signal() => None,
    };

    let result = match finished {
        Some(result) => result.map(|_| ()),
        None => {
            info!("Shutdown requested; draining connections");
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut servers).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => {
                    warn!(
                        timeout_secs = settings.server.graceful_shutdown.as_secs(),
                        "Graceful shutdown timed out"
                    );
                    Ok(())
                }
            }
        }
    };

    background.shutdown().await;
    result
}

async fn run_broadcast(
    settings: &config::Settings,
    request: PurgeRequest,
    retry: bool,
) -> Result<(), AppError> {
    let report = broadcast_to_nodes(settings, request, retry).await?;
    let failed: Vec<String> = report
        .failed_nodes()
        .into_iter()
        .map(str::to_string)
        .collect();

    let body = serde_json::to_string_pretty(&report.into_body())
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{body}");

    if failed.is_empty() {
        Ok(())
    } else {
        Err(AppError::NotConverged { failed })
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
