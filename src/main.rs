//! msgswitch - service host
//!
//! Serves one broker queue, answering each request with the output of an
//! external program (or echoing it back when no program is configured).

use msgswitch_client::BrokerTransport;
use msgswitch_server::{Config, EchoHandler, Handler, ProgramHandler, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MSGSWITCH_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("MSGSWITCH_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting msgswitch service host");
    tracing::info!("  Broker: {}", config.broker.endpoint);
    tracing::info!("  Queue: {}", config.service.queue);
    tracing::info!(
        "  Mode: {}",
        if config.service.parallel {
            "parallel"
        } else {
            "sequential"
        }
    );

    let handler: Arc<dyn Handler> = match &config.service.program {
        Some(program) => {
            tracing::info!("  Program: {}", program.display());
            Arc::new(
                ProgramHandler::new(program)
                    .with_args(config.service.args.clone())
                    .with_timeout(config.service.program_timeout()),
            )
        }
        None => {
            tracing::info!("  Program: none (echoing requests)");
            Arc::new(EchoHandler)
        }
    };

    let server = Arc::new(Server::new(
        Arc::new(BrokerTransport::new()),
        config.server_config(),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown().await;
    });

    // Serve (blocks until shutdown)
    let queue = &config.service.queue;
    if config.service.parallel {
        server.listen_p(handler, queue).await?;
    } else {
        server.listen(handler, queue).await?;
    }

    Ok(())
}
