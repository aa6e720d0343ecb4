//! Engine configuration loader.
//!
//! Reads a TOML file into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed, so a broken config never prevents a run.

use std::path::Path;

use weft_types::config::EngineConfig;

/// File name looked up in the data directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "weft.toml";

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Directory holding `weft.toml` and the document database.
///
/// `WEFT_DATA_DIR` wins; otherwise `~/.weft`.
pub fn default_data_dir() -> std::path::PathBuf {
    match std::env::var("WEFT_DATA_DIR") {
        Ok(dir) => dir.into(),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".weft")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
lifecycle_events = false
event_bus_capacity = 16
default_namespace = "orders"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert!(!config.lifecycle_events);
        assert_eq!(config.event_bus_capacity, 16);
        assert_eq!(config.default_namespace, "orders");
        assert!(config.lifecycle_sink.is_none());
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "lifecycle_events = = yes").await.unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config, EngineConfig::default());
    }
}
