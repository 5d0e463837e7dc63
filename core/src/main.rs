/// ChatLink session daemon - main entry point
use chatlink_core::directory::ChatApiClient;
use chatlink_core::messenger_api::{start_bridge_api, Bridge};
use chatlink_core::transport::WebSocketConnector;
use chatlink_core::{Config, Messenger};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let options = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let config = options.config;

    // The token is owned by the auth collaborator; we only read it
    let token = env::var("CHATLINK_TOKEN").ok();
    let bridge_addr = config.bridge_addr();
    let api_base_url = config.api_base_url.clone();

    info!("🚀 Starting ChatLink session");
    info!("   User:   {}", options.username);
    info!("   Broker: {}", config.broker_url);
    info!("   API:    {}", api_base_url);

    let messenger = Messenger::initialize(
        config,
        Arc::new(WebSocketConnector::default()),
        &options.username,
        token.as_deref(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;
    info!("   Connection: {:?}", messenger.connection_status());

    let directory = ChatApiClient::new(&api_base_url, token.as_deref().unwrap_or_default());
    let bridge = Arc::new(Bridge::new(messenger.clone(), directory));

    tokio::select! {
        result = start_bridge_api(bridge, bridge_addr) => {
            if let Err(e) = result {
                error!("Bridge API stopped: {}", e);
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping session...");
        }
    }

    messenger.shutdown();
    info!("Session stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
