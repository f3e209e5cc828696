//! Engine configuration loader.
//!
//! Reads `stepflow.toml` from the data directory (`~/.stepflow/` in
//! production) and deserializes it into [`EngineConfig`]. A missing or
//! malformed file yields the defaults.

use std::path::Path;

use stepflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/stepflow.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("stepflow.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No stepflow.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}
