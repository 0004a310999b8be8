use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use olaf_server::{load_config, serve, spawn_neighbour_links, ServerState};

/// Command-line arguments for the server daemon.
struct Args {
    config_path: Option<String>,
    listen: Option<String>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut listen = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--listen" => listen = args.next(),
            _ => {}
        }
    }

    Args {
        config_path,
        listen,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();

    let mut config = load_config(args.config_path.as_deref()).context("failed to load config")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        config = ?args.config_path,
        neighbours = config.federation.neighbours.len(),
        "olaf-server starting"
    );

    let state = Arc::new(ServerState::new(&config).context("failed to initialize server state")?);
    tracing::info!(
        address = %state.address,
        public_key = %state.identity.public_key_hex(),
        "server identity"
    );

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    let links = spawn_neighbour_links(&state);

    tokio::select! {
        () = serve(listener, Arc::clone(&state)) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("olaf-server shutting down");
        }
    }

    for link in links {
        link.abort();
    }

    tracing::info!(clients = state.registry.len(), "olaf-server stopped");
    Ok(())
}
