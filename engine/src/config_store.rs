use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use shared::EngineConfig;

// ===== CONFIG PERSISTENCE =====

/// Default config file name, stored next to the host application's data.
pub const CONFIG_FILE_NAME: &str = ".wavetap";

/// Load the engine config from `path`, validating and migrating it. A
/// missing file yields defaults; corrected values are persisted back.
pub fn load_config(path: impl AsRef<Path>) -> io::Result<EngineConfig> {
    let path = path.as_ref();
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<EngineConfig>(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            let config = EngineConfig::default();
            save_config(path, &config)?;
            return Ok(config);
        }
        Err(error) => return Err(error),
    };

    let warnings = config.validate_and_fix();
    if !warnings.is_empty() {
        for warning in &warnings {
            warn!(%warning, "engine config corrected on load");
        }
        // Persist the corrected config; failing to do so is not fatal.
        if let Err(error) = save_config(path, &config) {
            warn!(%error, "could not persist corrected config");
        }
    }
    Ok(config)
}

pub fn save_config(path: impl AsRef<Path>, config: &EngineConfig) -> io::Result<()> {
    let toml_content = toml::to_string_pretty(config)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let content_with_header = format!(
        "# wavetap engine configuration\n\
         # Streaming, caching, and scheduling settings for the trace-query engine\n\
         \n\
         {toml_content}"
    );
    fs::write(path, content_with_header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = load_config(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn round_trips_and_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = EngineConfig::default();
        config.scheduling.debounce_ms = 75;
        save_config(&path, &config).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# wavetap engine configuration"));

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.scheduling.debounce_ms, 75);
    }

    #[test]
    fn invalid_values_are_corrected_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = EngineConfig::default();
        config.streaming.chunk_bytes = 1;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(
            loaded.streaming.chunk_bytes,
            EngineConfig::default().streaming.chunk_bytes
        );

        // The corrected value was written back.
        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded, loaded);
    }
}
