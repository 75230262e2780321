//! Configuration parsing and validation for the gateway server
//!
//! This module handles command-line argument parsing and validation using clap.
//! Every option can also be supplied through the environment.
use anyhow::anyhow;
use azure_gateway::client::PoolSettings;
use azure_gateway::proxy::ProxySettings;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, env = "GATEWAY_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "GATEWAY_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "GATEWAY_METRICS", default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "GATEWAY_METRICS_PREFIX", default_value = "gateway")]
    pub metrics_prefix: String,

    /// The gateway file holding endpoints, callers and model records.
    #[arg(short = 'f', long, env = "GATEWAY_CONFIG")]
    pub config_file: PathBuf,

    /// Whether we should continue watching the gateway file for changes
    #[arg(short = 'w', long, env = "GATEWAY_WATCH", default_value_t = true)]
    pub watch: bool,

    /// Total timeout in seconds for an upstream call, body included. 0 disables it.
    #[arg(long, env = "GATEWAY_CLIENT_TIMEOUT_SECS", default_value_t = 300)]
    pub client_timeout_secs: u64,

    /// Skip per-model access control for every caller.
    #[arg(long, env = "BYPASS_MODEL_ACCESS_CONTROL", default_value_t = false)]
    pub bypass_model_access_control: bool,

    /// Forward the caller's name, id, email and role upstream as headers.
    #[arg(long, env = "ENABLE_FORWARD_USER_INFO_HEADERS", default_value_t = false)]
    pub forward_user_info_headers: bool,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, env = "GATEWAY_POOL_MAX_IDLE_PER_HOST", default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, env = "GATEWAY_POOL_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config_file.display()
            ));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} clashes with the gateway port",
                self.metrics_port
            ));
        }
        Ok(self)
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings::builder()
            .maybe_timeout(
                (self.client_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.client_timeout_secs)),
            )
            .bypass_model_access_control(self.bypass_model_access_control)
            .forward_user_info_headers(self.forward_user_info_headers)
            .build()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            max_idle_per_host: self.pool_max_idle_per_host,
        }
    }
}
