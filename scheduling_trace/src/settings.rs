//! Configuration management with file and environment variable support.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::registry::{PluginWeight, ScoreProfile};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

/// Retry schedule for persisting reflected results, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_elapsed_time_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self {
            initial_interval_ms: defaults.initial_interval.as_millis() as u64,
            multiplier: defaults.multiplier,
            max_interval_ms: defaults.max_interval.as_millis() as u64,
            max_elapsed_time_ms: defaults.max_elapsed_time.as_millis() as u64,
        }
    }
}

impl BackoffSettings {
    pub fn to_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed_time: Duration::from_millis(self.max_elapsed_time_ms),
        }
    }
}

/// Reflector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorConfig {
    pub max_concurrent_reflections: usize,
    pub backoff: BackoffSettings,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reflections: 16,
            backoff: BackoffSettings::default(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub reflector: ReflectorConfig,
    /// Enabled plugins and their score weights.
    #[serde(default)]
    pub profile: ScoreProfile,
}

impl Settings {
    /// Load settings from the built-in defaults, an optional `schedtrace` config file
    /// in the working directory and `SCHEDTRACE__*` environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::with_name("schedtrace").required(false))
            .add_source(env_source())
            .build()?;

        Self::finish(config)
    }

    /// Like [`load`](Self::load), with an explicit config file instead of the
    /// optional local one.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from(path).required(true))
            .add_source(env_source())
            .build()
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.reflector.max_concurrent_reflections == 0 {
            return Err(anyhow!("Max concurrent reflections cannot be 0"));
        }

        let backoff = &self.reflector.backoff;
        if backoff.initial_interval_ms == 0 {
            return Err(anyhow!("Backoff initial interval cannot be 0"));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(anyhow!("Backoff multiplier must be at least 1, got {}", backoff.multiplier));
        }
        if backoff.max_interval_ms < backoff.initial_interval_ms {
            return Err(anyhow!("Backoff max interval is shorter than the initial interval"));
        }

        if let Some(p) = self.all_plugins().find(|p| p.weight < 0) {
            return Err(anyhow!("Plugin {} has negative weight {}", p.name, p.weight));
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(anyhow!("Unknown log format: {}", other)),
        }
    }

    fn all_plugins(&self) -> impl Iterator<Item = &PluginWeight> {
        self.profile.score.iter().chain(&self.profile.multi_point)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("SCHEDTRACE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_embedded_config_parses() {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();
        settings.validate().unwrap();
        assert!(!settings.profile.multi_point.is_empty());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[reflector]
max_concurrent_reflections = 3

[reflector.backoff]
initial_interval_ms = 20
multiplier = 2.0
max_interval_ms = 200
max_elapsed_time_ms = 1000
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.reflector.max_concurrent_reflections, 3);
        assert_eq!(settings.reflector.backoff.to_config().initial_interval, Duration::from_millis(20));
        // untouched sections keep the embedded defaults
        assert_eq!(settings.logging.format, "text");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.reflector.max_concurrent_reflections = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reflector.backoff.multiplier = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reflector.backoff.initial_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.profile.score.push(PluginWeight::new("Fit", -1));
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());
    }
}
