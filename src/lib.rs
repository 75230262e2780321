//! azure-gateway - a model-routing proxy for Azure-style chat completion endpoints
//!
//! Requests name a model; the gateway checks the caller may use it, finds the configured
//! endpoint that serves it, rewrites the payload for that endpoint's quirks and relays the
//! upstream's answer, streamed or buffered.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{error, info, instrument};

pub mod access;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod endpoints;
pub mod errors;
pub mod gateway_file;
pub mod handlers;
pub mod payload;
pub mod proxy;
pub mod resolver;

use access::ModelRecords;
use auth::Callers;
use catalog::ModelCatalog;
use client::{HttpClient, HyperClient, PoolSettings};
use endpoints::ConfigStore;
use gateway_file::{ConfigStream, GatewayFile};
use proxy::{ConnectionTracker, ProxySettings};

/// The main application state: the upstream client plus every piece of live configuration.
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub config: ConfigStore,
    pub catalog: ModelCatalog,
    pub callers: Callers,
    pub model_records: ModelRecords,
    pub connections: ConnectionTracker,
    pub settings: ProxySettings,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(file: GatewayFile, settings: ProxySettings, pool: &PoolSettings) -> Self {
        Self::with_client(file, settings, client::create_hyper_client(pool))
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(file: GatewayFile, settings: ProxySettings, http_client: T) -> Self {
        Self {
            http_client,
            config: ConfigStore::new(file.endpoints),
            catalog: ModelCatalog::default(),
            callers: Callers::from_accounts(file.callers),
            model_records: ModelRecords::from_records(file.models),
            connections: ConnectionTracker::default(),
            settings,
        }
    }

    /// Replaces all live configuration with the contents of `file`.
    pub fn apply_file(&self, file: GatewayFile) {
        self.config.store(file.endpoints);
        self.catalog.invalidate();
        self.callers.replace(file.callers);
        self.model_records.replace(file.models);
    }
}

impl<T: HttpClient + Clone + Send + Sync + 'static> AppState<T> {
    /// Applies every gateway file received from `stream` until it closes.
    pub async fn receive_updates<W: ConfigStream + Send + 'static>(
        &self,
        stream: W,
    ) -> Result<(), anyhow::Error> {
        let state = self.clone();
        let mut rx = stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(file) => {
                        info!("Config file changed, updating gateway...");
                        state.apply_file(file);
                    }
                    Err(e) => {
                        error!("Failed to reload config: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

/// Build the main router for the gateway
/// This creates routes for:
/// - `/models` and `/models/{endpoint_index}` - list served models
/// - `/chat/completions` - forward a completion to the endpoint serving its model
/// - `/config` and `/config/update` - read and replace the endpoint configuration
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/models", get(handlers::models))
        .route("/models/{endpoint_index}", get(handlers::endpoint_models))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/config", get(handlers::get_config))
        .route("/config/update", post(handlers::update_config))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
