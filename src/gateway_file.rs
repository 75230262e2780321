/// The gateway file holds everything the gateway is configured with: upstream endpoints, the
/// callers allowed to use it, and the model registry. It can be watched, in which case every
/// change is re-read and applied wholesale.
use crate::access::ModelRecord;
use crate::auth::CallerAccount;
use crate::endpoints::GatewayConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFile {
    #[serde(default)]
    pub endpoints: GatewayConfig,
    #[serde(default)]
    pub callers: Vec<CallerAccount>,
    #[serde(default)]
    pub models: Vec<ModelRecord>,
}

impl GatewayFile {
    pub async fn from_path(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path.display(), e))?;

        let file: GatewayFile = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path.display(), e))?;

        info!(
            "Loaded {} endpoints, {} callers and {} models from {}",
            file.endpoints.base_urls.len(),
            file.callers.len(),
            file.models.len(),
            path.display()
        );
        Ok(file)
    }
}

#[async_trait]
pub trait ConfigStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<GatewayFile, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl ConfigStream for WatchedFile {
    /// Watches the file and yields a freshly parsed [`GatewayFile`] on every modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<GatewayFile, anyhow::Error>>, anyhow::Error> {
        let (config_tx, config_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let path = self.0.clone();
        tokio::spawn(async move {
            // The watcher stops when dropped, so it lives as long as this task.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Config file changed, reloading...");
                        GatewayFile::from_path(&path).await
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Watch error: {}", e);
                        Err(anyhow!("Watch error: {}", e))
                    }
                };
                if config_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(config_rx)
    }
}
