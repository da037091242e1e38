use actionkit::config::{apply_env_overrides, load_config, EngineConfig};
use actionkit::credentials::TokenVault;
use anyhow::{Context, Result};
use destination_runtime::api::{create_router, ApiState};
use destination_runtime::{AudienceLifecycle, AuthSessionStore, DestinationRegistry, Dispatcher};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "destination_runtime=info,actionkit=info".into()),
        )
        .init();

    info!("Destination runtime starting...");

    // File config (optional), then environment overrides
    let config_path = std::env::var("ACTIONKIT_CONFIG").ok();
    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    apply_env_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        config_path = config_path.as_deref().unwrap_or("<defaults>"),
        max_attempts = config.dispatch.max_attempts,
        request_timeout_ms = config.dispatch.request_timeout_ms,
        default_batch_size = config.batching.default_batch_size,
        vault = config.auth.vault_path.is_some(),
        port = config.server.port,
        "Configuration loaded"
    );

    // Auth sessions, backed by the token vault when one is configured
    let mut sessions = AuthSessionStore::new(config.auth.refresh_skew_secs);
    if let Some(vault_path) = &config.auth.vault_path {
        let key = std::env::var("ACTIONKIT_VAULT_KEY")
            .context("ACTIONKIT_VAULT_KEY is required when a vault path is set (base64-encoded 32-byte key)")?;
        let vault = TokenVault::open(vault_path, &key).context("Failed to initialize token vault")?;
        sessions = sessions.with_vault(Arc::new(vault));
        info!(vault_path = %vault_path, "Token vault initialized");
    }

    let registry = DestinationRegistry::builtin().context("Failed to load destinations")?;
    info!(destinations = registry.len(), "Destinations registered");

    let dispatcher = Arc::new(Dispatcher::new(&config, Arc::new(sessions)));
    let audiences = Arc::new(AudienceLifecycle::new(Arc::clone(&dispatcher)));

    // Start HTTP API server
    let api_state = ApiState {
        registry: Arc::new(registry),
        dispatcher,
        audiences,
    };
    let router = create_router(api_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind destination API port")?;
    info!(port = config.server.port, "Destination API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Destination API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Destination runtime stopped");

    Ok(())
}
