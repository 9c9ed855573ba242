//! Recorder configuration file support

use crate::audio::{ControllerConfig, ResidualPolicy};
use crate::sink::DEFAULT_OUTPUT_PATH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file looked up next to the executable
const LOCAL_CONFIG_NAME: &str = "pcmcap.toml";

/// Recorder configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Raw output file
    pub output: String,

    /// Recording length in seconds
    pub duration_secs: f64,

    /// Input device index (0 = default device)
    pub device_index: u32,

    /// Capture buffers kept queued on the device
    pub buffer_count: usize,

    /// Write samples still held by the device at stop
    pub flush_residual: bool,

    /// How long to wait for the device close notification, in milliseconds
    pub close_timeout_ms: u64,

    /// WAV copy of the recording (empty = none)
    #[serde(default)]
    pub wav_output: String,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    #[serde(default)]
    pub log_file: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output: DEFAULT_OUTPUT_PATH.to_string(),
            duration_secs: 5.0,
            device_index: 0,
            buffer_count: 3,
            flush_residual: true,
            close_timeout_ms: 2000,
            wav_output: String::new(),
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: pcmcap.toml
    /// 2. User config directory: pcmcap/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_locations().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = Vec::new();

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                locations.push(exe_dir.join(LOCAL_CONFIG_NAME));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("pcmcap").join("config.toml"));
        }

        locations
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Reject values the recorder cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.is_empty() {
            return Err(ConfigError::Invalid("output cannot be empty".into()));
        }
        if !(self.duration_secs.is_finite() && self.duration_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "duration_secs must be positive, got {}",
                self.duration_secs
            )));
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    /// Convert to ControllerConfig
    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            device_index: self.device_index,
            buffer_count: self.buffer_count,
            residual: if self.flush_residual {
                ResidualPolicy::Flush
            } else {
                ResidualPolicy::Discard
            },
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            ..ControllerConfig::default()
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# pcmcap configuration

# Raw output file (interleaved 16-bit little-endian PCM, no header)
output = "test.raw"

# Recording length in seconds (default: 5)
duration_secs = 5.0

# Input device index; 0 is the system default input
device_index = 0

# Capture buffers of 32 KB kept queued on the device (default: 3)
buffer_count = 3

# Write samples still held by the device when recording stops
flush_residual = true

# How long to wait for the device to acknowledge close, in milliseconds
close_timeout_ms = 2000

# Also write a WAV copy of the recording (empty = none)
wav_output = ""

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
log_file = ""
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    Serialize(toml::ser::Error),
    /// A value out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config file '{}': {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{}': {}", path, source)
            }
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_matches_defaults() {
        let parsed: RecorderConfig = toml::from_str(&RecorderConfig::sample_config()).unwrap();
        assert_eq!(parsed, RecorderConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: RecorderConfig = toml::from_str("duration_secs = 1.5\nbuffer_count = 1\n").unwrap();
        assert_eq!(parsed.duration(), Duration::from_millis(1500));
        assert_eq!(parsed.buffer_count, 1);
        assert_eq!(parsed.output, DEFAULT_OUTPUT_PATH);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = RecorderConfig {
            output: "take.raw".into(),
            flush_residual: false,
            ..RecorderConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RecorderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let zero_buffers = RecorderConfig {
            buffer_count: 0,
            ..RecorderConfig::default()
        };
        assert!(matches!(zero_buffers.validate(), Err(ConfigError::Invalid(_))));

        let negative = RecorderConfig {
            duration_secs: -1.0,
            ..RecorderConfig::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "buffer_count = \"many\"").unwrap();

        let err = RecorderConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_controller_config_mapping() {
        let config = RecorderConfig {
            device_index: 2,
            buffer_count: 5,
            flush_residual: false,
            close_timeout_ms: 250,
            ..RecorderConfig::default()
        };
        let controller = config.to_controller_config();
        assert_eq!(controller.device_index, 2);
        assert_eq!(controller.buffer_count, 5);
        assert_eq!(controller.residual, ResidualPolicy::Discard);
        assert_eq!(controller.close_timeout, Duration::from_millis(250));
    }
}
