/// Maps a requested model id onto the endpoint that serves it.
use crate::catalog::{ModelCatalog, ModelEntry};
use crate::endpoints::{EndpointConfig, GatewayConfig};
use crate::errors::GatewayError;
use tracing::{debug, error};

/// Everything needed to call the upstream for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: EndpointConfig,
    pub entry: ModelEntry,
}

/// Resolves `model_id` through the (cached) catalog built from `config`.
pub fn resolve(
    catalog: &ModelCatalog,
    config: &GatewayConfig,
    model_id: &str,
) -> Result<ResolvedEndpoint, GatewayError> {
    let snapshot = catalog.get_models(config);
    let entry = snapshot
        .get(model_id)
        .cloned()
        .ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))?;

    // The catalog may be up to one TTL older than `config`, so the index can dangle.
    let endpoint = config.endpoint(entry.endpoint_index).ok_or_else(|| {
        error!(
            "Model {} points at endpoint {} which is no longer configured",
            model_id, entry.endpoint_index
        );
        GatewayError::ModelNotFound(model_id.to_string())
    })?;

    debug!(
        "Resolved model {} to endpoint {} ({})",
        model_id, endpoint.index, endpoint.base_url
    );
    Ok(ResolvedEndpoint { endpoint, entry })
}
