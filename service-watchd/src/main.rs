use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use service_watchd::api;
use service_watchd::backend::mdns::MdnsChainFactory;
use service_watchd::config::Config;
use service_watchd::{BrowserEvent, Discovery};

/// Logs every event of one browser until its channel closes or shutdown.
async fn log_events(
    service_type: String,
    mut events: mpsc::UnboundedReceiver<BrowserEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            BrowserEvent::ServiceAdded(record) => {
                tracing::info!(service_type = %service_type, "Service added: {}", record);
            }
            BrowserEvent::ServiceRemoved(record) => {
                tracing::info!(service_type = %service_type, "Service removed: {}", record.full_name);
            }
            BrowserEvent::ServiceChanged { old: Some(old), new: Some(new) } => {
                tracing::info!(service_type = %service_type, "Service changed: {} (was {})", new, old);
            }
            BrowserEvent::ServiceChanged { .. } => {}
            BrowserEvent::ServicesUpdated(services) => {
                tracing::debug!(service_type = %service_type, count = services.len(), "Services updated");
            }
            BrowserEvent::StartupPhase { progress, description } => {
                tracing::info!(service_type = %service_type, progress, "{}", description);
            }
            BrowserEvent::StartedBrowsing => {
                tracing::info!(service_type = %service_type, "Browsing started");
            }
            // Already logged by the connection at the matching level
            BrowserEvent::ErrorMessage(_) => {}
            BrowserEvent::HadFailure(history) => {
                tracing::error!(
                    service_type = %service_type,
                    errors = history.len(),
                    "Browsing failed for good"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("service_watchd=info"))
        )
        .init();

    tracing::info!("Starting service-watchd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/service-watchd/watchd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    if config.browse.is_empty() {
        tracing::warn!("No [[browse]] entries configured, nothing will be discovered");
    }

    let chain = config.backend_chain();
    tracing::info!(
        "Backend chain: {}",
        chain.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(" -> ")
    );
    let discovery = Discovery::new(
        Arc::new(MdnsChainFactory::new(chain)),
        config.connection_settings(),
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // One browser and one logging task per configured service type
    let mut browsers = Vec::with_capacity(config.browse.len());
    let mut log_handles = Vec::with_capacity(config.browse.len());
    for entry in &config.browse {
        let (browser, events) = discovery.browser(
            &entry.service_type,
            &entry.domain,
            config.browser_options(entry),
        );
        log_handles.push(tokio::spawn(log_events(
            browser.service_type().to_string(),
            events,
            cancel.clone(),
        )));

        if let Err(e) = browser.start_browsing(entry.interface()) {
            tracing::error!(service_type = %entry.service_type, "Failed to start browsing: {}", e);
        }
        browsers.push(browser);
    }

    // Build API router
    let app_state = api::routes::AppState {
        discovery: discovery.clone(),
        browsers: Arc::new(browsers),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = server_handle.await;
    for handle in log_handles {
        let _ = handle.await;
    }

    // Joining the worker blocks
    let stopped = tokio::task::spawn_blocking(move || discovery.shutdown())
        .await
        .context("Shutdown task panicked")?;
    if let Err(e) = stopped {
        tracing::error!("Failed to stop discovery: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
