use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration loaded from extractor.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub monitor: MonitorSettings,
    pub updater: UpdaterSettings,
    pub limits: LimitsSettings,
    pub container: ContainerSettings,
    pub archive: ArchiveSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
    pub bootstrap_grace_secs: u64,
    pub inactivity_window_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    pub tick_interval_secs: u64,
    /// Rough count of expected extraction phases; drives the advisory
    /// progress percentage only.
    pub total_steps: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    /// Hard wall-clock budget for the whole job, independent of any
    /// worker-internal timeout.
    pub hard_timeout_secs: u64,
    /// Grace period between asking the worker to stop and killing it.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub image: String,
    /// Prefix for the unique per-job container instance name.
    pub name_prefix: String,
    /// Environment variable holding the API credential when none is passed
    /// on the command line.
    pub api_key_env: String,
    /// Mount point of the shared directory inside the container.
    pub shared_mount: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            bootstrap_grace_secs: 60,
            inactivity_window_secs: 120,
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 2,
            total_steps: 5,
        }
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            hard_timeout_secs: 600,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/anthropics/anthropic-quickstarts:computer-use-demo-latest".to_string(),
            name_prefix: "extract".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            shared_mount: "/home/computeruse/shared".to_string(),
        }
    }
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    pub fn bootstrap_grace(&self) -> Duration {
        Duration::from_secs(self.monitor.bootstrap_grace_secs)
    }

    pub fn inactivity_window(&self) -> Duration {
        Duration::from_secs(self.monitor.inactivity_window_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.updater.tick_interval_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.hard_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.limits.shutdown_grace_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive.interval_secs)
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_recommended_windows() {
        let config = HarnessConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.bootstrap_grace(), Duration::from_secs(60));
        assert_eq!(config.inactivity_window(), Duration::from_secs(120));
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.hard_timeout(), Duration::from_secs(600));
        assert_eq!(config.archive_interval(), Duration::from_secs(86_400));
        assert_eq!(config.updater.total_steps, 5);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/extractor.toml")).unwrap();
        assert_eq!(config.limits.hard_timeout_secs, 600);
    }

    #[test]
    fn test_partial_file_overrides_one_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extractor.toml");
        std::fs::write(
            &path,
            "[limits]\nhard_timeout_secs = 120\n\n[monitor]\ninactivity_window_secs = 30\n",
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.hard_timeout(), Duration::from_secs(120));
        assert_eq!(config.inactivity_window(), Duration::from_secs(30));
        // Untouched sections keep defaults.
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.container.name_prefix, "extract");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extractor.toml");
        std::fs::write(&path, "[limits\nhard_timeout_secs = ").unwrap();

        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }
}
