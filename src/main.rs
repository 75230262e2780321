mod config;

use azure_gateway::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    gateway_file::{GatewayFile, WatchedFile},
};
use clap::Parser as _;
use config::Config;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting gateway with config: {:?}", config);

    let file = GatewayFile::from_path(&config.config_file).await?;
    let app_state = AppState::new(file, config.proxy_settings(), &config.pool_settings());

    // Start file watcher if requested
    if config.watch {
        app_state
            .receive_updates(WatchedFile(config.config_file.clone()))
            .await?;
    }

    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Gateway listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
