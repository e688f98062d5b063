//! Gridline gateway: routes chat-platform interactions to backend services in the cluster.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use gridline_core::dispatcher::forward_client;
use gridline_core::{
    run_feed, version, CommandIndex, ConfigError, Dispatcher, DiscordClient, Exit, FatalError,
    GatewayConfig, KubeClient, LeaderElector, Lifecycle, Reconciler, ServiceResolver,
};
use gridline_gateway::gateway_router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();
    info!(version = version::string(), "starting gridline");

    match run().await {
        Ok(exit) => {
            info!(code = exit.code(), "gridline stopped");
            ExitCode::from(exit.code())
        }
        Err(err) => {
            error!(error = %err, "startup failed");
            ExitCode::from(1)
        }
    }
}

/// `RUST_LOG` filter; `GRIDLINE_LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("GRIDLINE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn run() -> Result<Exit, StartupError> {
    let config = GatewayConfig::load()?;
    let lifecycle = Lifecycle::new();
    let shutdown = lifecycle.shutdown_token();

    let kube = KubeClient::from_config(&config)?;
    info!(namespace = kube.namespace(), "watching cluster resources");
    let commands = CommandIndex::new();
    let services = ServiceResolver::new();
    lifecycle.spawn(
        "command-feed",
        run_feed(Arc::new(kube.commands()), commands.feed(), shutdown.clone()),
    );
    lifecycle.spawn(
        "service-feed",
        run_feed(Arc::new(kube.services()), services.feed(), shutdown.clone()),
    );

    let discord = Arc::new(DiscordClient::from_config(&config)?);
    let reconciler = Reconciler::new(discord.clone(), commands.clone(), config.reconcile_interval);
    let elector = LeaderElector::new(
        Arc::new(kube.lease_lock(&config.deployment_name, &config.hostname)),
        config.election,
    );
    lifecycle.spawn(
        "leader-election",
        elector.run(lifecycle.clone(), move |leading| reconciler.run(leading)),
    );

    // Serve only once both indices hold a full listing.
    tokio::select! {
        _ = async { tokio::join!(commands.wait_ready(), services.wait_ready()) } => {
            info!("command and service indices synced");
        }
        _ = shutdown_signal() => {
            lifecycle.shutdown();
            return Ok(lifecycle.drain(config.shutdown_timeout).await);
        }
        _ = shutdown.cancelled() => {
            return Ok(lifecycle.drain(config.shutdown_timeout).await);
        }
    }

    let dispatcher = Dispatcher::new(
        config.public_key,
        Arc::new(commands),
        Arc::new(services),
        discord,
        forward_client(config.forward_timeout)?,
        lifecycle.clone(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.listen_addr,
            source,
        })?;
    info!(addr = %config.listen_addr, "listening for interactions");

    let server = axum::serve(
        listener,
        gateway_router(dispatcher).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let watcher = lifecycle.clone();
    lifecycle.spawn("http-listener", async move {
        let result = server.await;
        if !watcher.is_shutting_down() {
            let reason = match result {
                Ok(()) => "listener exited".to_string(),
                Err(err) => err.to_string(),
            };
            watcher.fail(FatalError::ListenerDied(reason));
        }
    });

    tokio::select! {
        _ = shutdown_signal() => lifecycle.shutdown(),
        _ = shutdown.cancelled() => {}
    }
    Ok(lifecycle.drain(config.shutdown_timeout).await)
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
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
