use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QualityMode {
    Native,
    Quality,
    #[default]
    Balanced,
    Performance,
    UltraPerformance,
}

impl QualityMode {
    /// Ratio between the raytraced resolution and the output resolution.
    pub fn render_scale(self) -> f32 {
        match self {
            QualityMode::Native => 1.0,
            QualityMode::Quality => 1.0 / 1.5,
            QualityMode::Balanced => 1.0 / 1.7,
            QualityMode::Performance => 1.0 / 2.0,
            QualityMode::UltraPerformance => 1.0 / 3.0,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quality_mode: QualityMode,
    pub frames_in_flight: usize,
    pub scratch_buffer_size: u64,
    pub upload_chunk_size: u64,
    pub transport_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quality_mode: QualityMode::default(),
            frames_in_flight: 2,
            scratch_buffer_size: 16 * 1024 * 1024,
            upload_chunk_size: 4 * 1024 * 1024,
            transport_capacity: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads the configuration at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        let config: Config = serde_json::from_str(&text)?;
        tracing::debug!(?config, "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("raybridge.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.quality_mode, QualityMode::Balanced);
    }

    #[test]
    fn partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "quality_mode": "Performance", "frames_in_flight": 3 }}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.quality_mode, QualityMode::Performance);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.scratch_buffer_size, 16 * 1024 * 1024);
    }

    #[test]
    fn malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "quality_mode = 1").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
