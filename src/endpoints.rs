//! Upstream endpoint configuration.
//!
//! Endpoints are configured positionally: `base_urls[i]` and `api_keys[i]` describe endpoint `i`,
//! and `api_configs` holds the auxiliary settings (served models, prefix, pipeline flag) keyed by
//! the index rendered as a string. Older configurations keyed the settings by base URL instead;
//! [`endpoint_settings`] honours both.
use arc_swap::ArcSwap;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Host of the public vendor API. Endpoints on any other host only understand the legacy
/// `max_tokens` field.
pub const PUBLIC_VENDOR_HOST: &str = "api.openai.com";

/// Auxiliary settings for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct EndpointSettings {
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enable: bool,
    #[serde(default)]
    #[builder(default)]
    pub model_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub prefix_id: Option<String>,
    /// The endpoint is a pipeline server that personalises responses per caller.
    #[serde(default)]
    #[builder(default)]
    pub pipeline: bool,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_true() -> bool {
    true
}

/// Resolves the settings for endpoint `index`: first by the index as a string, then by base URL.
pub fn endpoint_settings<'a>(
    configs: &'a BTreeMap<String, EndpointSettings>,
    index: usize,
    base_url: &str,
) -> Option<&'a EndpointSettings> {
    configs
        .get(&index.to_string())
        .or_else(|| configs.get(base_url))
}

/// Removes settings whose key is not a valid index into a list of `endpoint_count` base URLs.
pub fn prune_endpoint_settings(
    configs: BTreeMap<String, EndpointSettings>,
    endpoint_count: usize,
) -> BTreeMap<String, EndpointSettings> {
    configs
        .into_iter()
        .filter(|(key, _)| {
            let keep = key
                .parse::<usize>()
                .is_ok_and(|index| index < endpoint_count && index.to_string() == *key);
            if !keep {
                debug!("Pruning endpoint settings for stale key {}", key);
            }
            keep
        })
        .collect()
}

/// One upstream endpoint, flattened out of the positional configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub index: usize,
    pub base_url: String,
    pub api_key: String,
    pub settings: EndpointSettings,
}

impl EndpointConfig {
    /// Whether this endpoint is the public vendor API rather than a deployment-specific one.
    pub fn is_public_vendor(&self) -> bool {
        self.base_url.contains(PUBLIC_VENDOR_HOST)
    }
}

/// The in-memory endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enable_api: bool,
    #[serde(default)]
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub api_configs: BTreeMap<String, EndpointSettings>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enable_api: true,
            base_urls: Vec::new(),
            api_keys: Vec::new(),
            api_configs: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// The endpoint at `index`, if a base URL exists there.
    pub fn endpoint(&self, index: usize) -> Option<EndpointConfig> {
        let base_url = self.base_urls.get(index)?;
        let settings = endpoint_settings(&self.api_configs, index, base_url)
            .cloned()
            .unwrap_or_default();
        Some(EndpointConfig {
            index,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: self.api_keys.get(index).cloned().unwrap_or_default(),
            settings,
        })
    }

    /// All configured endpoints in index order.
    pub fn endpoints(&self) -> Vec<EndpointConfig> {
        (0..self.base_urls.len())
            .filter_map(|index| self.endpoint(index))
            .collect()
    }

    /// Applies an update form, returning the new configuration.
    ///
    /// Keys are padded or truncated to one per base URL, and settings whose key is no longer a
    /// valid index are pruned.
    pub fn apply_update(&self, form: ConfigForm) -> Result<GatewayConfig, String> {
        for base_url in &form.base_urls {
            Url::parse(base_url).map_err(|e| format!("Invalid base URL {base_url}: {e}"))?;
        }

        let endpoint_count = form.base_urls.len();
        let mut api_keys = form.api_keys;
        if api_keys.len() != endpoint_count {
            warn!(
                "Received {} API keys for {} base URLs, adjusting",
                api_keys.len(),
                endpoint_count
            );
            api_keys.resize(endpoint_count, String::new());
        }

        Ok(GatewayConfig {
            enable_api: form.enable_api.unwrap_or(self.enable_api),
            api_configs: prune_endpoint_settings(form.api_configs, endpoint_count),
            base_urls: form.base_urls,
            api_keys,
        })
    }
}

/// Body of `POST /config/update`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigForm {
    #[serde(default)]
    pub enable_api: Option<bool>,
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_configs: BTreeMap<String, EndpointSettings>,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Holder of the current configuration snapshot. Readers get an immutable `Arc` and never observe
/// a partially applied update.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    current: Arc<ArcSwap<GatewayConfig>>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    pub fn store(&self, config: GatewayConfig) {
        self.current.store(Arc::new(config));
    }
}
