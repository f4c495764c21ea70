use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Log filter string in the tracing format `target[span{field=value}]=level`.
    /// Falls back to the `CLUSTERD_LOG` environment variable, then to `info`.
    pub filter: Option<String>,

    /// One of `full`, `compact`, `pretty`, `json`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: None,
            format: "full".to_string(),
        }
    }
}

pub fn init(config: &LogConfig) {
    let filter = match &config.filter {
        Some(filter) => EnvFilter::new(filter.as_str()),
        None => EnvFilter::try_from_env("CLUSTERD_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let registry = tracing_subscriber::registry();
    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.format.to_lowercase().as_str() {
        "pretty" => registry.with(fmt_layer.pretty().with_filter(filter)).init(),
        "compact" => registry.with(fmt_layer.compact().with_filter(filter)).init(),
        "json" => registry.with(fmt_layer.json().with_filter(filter)).init(),
        _ => registry.with(fmt_layer.with_filter(filter)).init(),
    }

    tracing::info!(format = config.format.as_str(), "logging initialized");
}
