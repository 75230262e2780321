//! The model catalog: every model id served by a configured endpoint, mapped to that endpoint.
//!
//! The catalog is derived from configuration rather than discovered from upstreams, so it is
//! cheap to build. It is still memoized for [`CATALOG_TTL`] and published as an immutable
//! snapshot, so readers always see a whole catalog. Concurrent rebuilds on expiry are harmless:
//! they produce identical snapshots and the last store wins.
use crate::endpoints::GatewayConfig;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CATALOG_TTL: Duration = Duration::from_secs(3);

const OWNED_BY: &str = "azure";

/// A model as listed by `/models`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    /// The object type, which is always "model".
    pub object: String,
    /// Unix timestamp (seconds) of the catalog build that produced this entry.
    pub created: u64,
    pub owned_by: String,
    /// Index of the endpoint serving this model.
    pub endpoint_index: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pipeline: bool,
}

impl ModelEntry {
    fn new(id: String, name: &str, created: u64, endpoint_index: usize, pipeline: bool) -> Self {
        Self {
            id,
            name: name.to_owned(),
            object: "model".into(),
            created,
            owned_by: OWNED_BY.into(),
            endpoint_index,
            pipeline,
        }
    }
}

/// The response body of the `/models` endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Derives one entry per declared model id of every enabled endpoint.
///
/// Endpoints with a `prefix_id` list their models as `{prefix_id}.{model}`.
pub fn build_entries(config: &GatewayConfig) -> Vec<ModelEntry> {
    if !config.enable_api {
        debug!("Upstream API disabled, catalog is empty");
        return Vec::new();
    }

    let created = unix_now();
    config
        .endpoints()
        .into_iter()
        .filter(|endpoint| endpoint.settings.enable)
        .flat_map(|endpoint| {
            let prefix = endpoint.settings.prefix_id.clone();
            let pipeline = endpoint.settings.pipeline;
            endpoint
                .settings
                .model_ids
                .into_iter()
                .map(move |model| {
                    let id = match &prefix {
                        Some(prefix) => format!("{prefix}.{model}"),
                        None => model.clone(),
                    };
                    ModelEntry::new(id, &model, created, endpoint.index, pipeline)
                })
        })
        .collect()
}

/// The models of a single endpoint, listed by their bare ids. Unknown or disabled endpoints yield
/// no models.
pub fn endpoint_entries(config: &GatewayConfig, index: usize) -> Vec<ModelEntry> {
    if !config.enable_api {
        return Vec::new();
    }
    let Some(endpoint) = config.endpoint(index).filter(|e| e.settings.enable) else {
        return Vec::new();
    };
    let created = unix_now();
    endpoint
        .settings
        .model_ids
        .iter()
        .map(|model| {
            ModelEntry::new(
                model.clone(),
                model,
                created,
                index,
                endpoint.settings.pipeline,
            )
        })
        .collect()
}

/// An immutable, fully built catalog.
#[derive(Debug)]
pub struct CatalogSnapshot {
    built_at: Instant,
    entries: Vec<ModelEntry>,
    by_id: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn build(config: &GatewayConfig) -> Self {
        let entries = build_entries(config);
        let mut by_id = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if let Some(previous) = by_id.insert(entry.id.clone(), position) {
                warn!(
                    "Model {} is served by endpoints {} and {}; using {}",
                    entry.id,
                    entries[previous].endpoint_index,
                    entry.endpoint_index,
                    entry.endpoint_index
                );
            }
        }
        Self {
            built_at: Instant::now(),
            entries,
            by_id,
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelEntry> {
        self.by_id.get(model_id).map(|&position| &self.entries[position])
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.built_at.elapsed() < ttl
    }
}

/// Process-wide memoized catalog.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    current: Arc<ArcSwapOption<CatalogSnapshot>>,
    ttl: Duration,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::with_ttl(CATALOG_TTL)
    }
}

impl ModelCatalog {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            current: Arc::new(ArcSwapOption::empty()),
            ttl,
        }
    }

    /// Returns the cached catalog, rebuilding it from `config` when it is missing or stale.
    pub fn get_models(&self, config: &GatewayConfig) -> Arc<CatalogSnapshot> {
        if let Some(snapshot) = self.current.load_full()
            && snapshot.is_fresh(self.ttl)
        {
            return snapshot;
        }

        let snapshot = Arc::new(CatalogSnapshot::build(config));
        debug!("Rebuilt model catalog with {} models", snapshot.len());
        self.current.store(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// Forces the next lookup to rebuild.
    pub fn invalidate(&self) {
        self.current.store(None);
    }
}
