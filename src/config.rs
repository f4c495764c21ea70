use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub model: String,
    pub min_instances: usize,
    pub max_instances: usize,
    pub max_concurrency: u32,
    pub idle_timeout_seconds: u64,
    pub scale_up_load_threshold: f64,
    pub scale_down_load_threshold: f64,
    pub scale_up_rps: f64,
    pub predictive_rps_window: usize,
    pub predictive_rps_trend_threshold: f64,
    pub bind_addr: String,

    #[serde(skip)]
    pub config_path: PathBuf,

    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            min_instances: 1,
            max_instances: 4,
            max_concurrency: 4,
            idle_timeout_seconds: 300,
            scale_up_load_threshold: 0.8,
            scale_down_load_threshold: 0.2,
            scale_up_rps: 50.0,
            predictive_rps_window: 5,
            predictive_rps_trend_threshold: 10.0,
            bind_addr: "127.0.0.1:5000".to_string(),
            config_path: PathBuf::from("clusterconfig.json"),
            logging: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.min_instances > self.max_instances {
            return Err(ClusterError::ConfigMalformed(
                "minInstances must be <= maxInstances".to_string(),
            ));
        }
        if self.scale_down_load_threshold >= self.scale_up_load_threshold {
            return Err(ClusterError::ConfigMalformed(
                "scaleDownLoadThreshold must be < scaleUpLoadThreshold".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads the configuration file at `path`, creating it with defaults if it
/// does not yet exist.
pub fn load_or_init(path: &Path) -> Result<Config> {
    if !path.exists() {
        let config = Config {
            config_path: path.to_path_buf(),
            ..Config::default()
        };
        write(path, &config)?;
        return Ok(config);
    }

    let text = std::fs::read_to_string(path)?;
    let mut config: Config =
        serde_json::from_str(&text).map_err(|e| ClusterError::ConfigMalformed(e.to_string()))?;
    config.config_path = path.to_path_buf();
    config.validate()?;
    Ok(config)
}

fn write(path: &Path, config: &Config) -> Result<()> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// A hot-reloadable configuration snapshot shared by the control loop,
/// dispatcher and HTTP plane. A reload swaps in a new `Arc<Config>` so
/// in-flight readers keep seeing a consistent snapshot.
#[derive(Clone)]
pub struct ConfigCell(Arc<ArcSwap<Config>>);

impl ConfigCell {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(config)))
    }

    pub fn current(&self) -> Arc<Config> {
        self.0.load_full()
    }

    fn reload_from_disk(&self) {
        let path = self.current().config_path.clone();
        match load_or_init(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "configuration reloaded");
                self.0.store(Arc::new(config));
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring malformed configuration reload, keeping previous snapshot");
            }
        }
    }
}

/// Debounce window for coalescing the double-write some editors perform on save.
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Starts a background filesystem watcher that reloads `cell` whenever its
/// backing file changes. The watcher lives on a dedicated OS thread because
/// `notify` delivers events through a synchronous callback.
pub fn spawn_watcher(cell: ConfigCell) {
    let path = cell.current().config_path.clone();
    let Some(parent) = path.parent().map(|p| {
        if p.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            p.to_path_buf()
        }
    }) else {
        return;
    };

    std::thread::spawn(move || {
        use notify::Watcher;

        let (tx, rx) = std::sync::mpsc::channel();
        let watch_path = path.clone();
        let mut watcher = match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                if event.kind.is_modify() && event.paths.iter().any(|p| p == &watch_path) {
                    let _ = tx.send(());
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(error) => {
                tracing::warn!(%error, "failed to start configuration watcher");
                return;
            }
        };

        if let Err(error) = watcher.watch(&parent, notify::RecursiveMode::NonRecursive) {
            tracing::warn!(%error, path = %parent.display(), "failed to watch configuration directory");
            return;
        }

        for () in rx.iter() {
            std::thread::sleep(DEBOUNCE);
            while rx.try_recv().is_ok() {}
            cell.reload_from_disk();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterconfig.json");
        let config = load_or_init(&path).unwrap();
        assert_eq!(config.min_instances, Config::default().min_instances);
        assert!(path.exists());
    }

    #[test]
    fn roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterconfig.json");
        let mut written = Config::default();
        written.max_instances = 9;
        std::fs::write(&path, serde_json::to_string(&written).unwrap()).unwrap();

        let read = load_or_init(&path).unwrap();
        assert_eq!(read.max_instances, 9);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.scale_down_load_threshold = 0.9;
        config.scale_up_load_threshold = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_reported_as_config_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterconfig.json");
        std::fs::write(&path, "{ not valid json").unwrap();
        let result = load_or_init(&path);
        assert!(matches!(result, Err(ClusterError::ConfigMalformed(_))));
    }
}
