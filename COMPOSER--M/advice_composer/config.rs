use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::{context::FeatureCatalog, FunctionFamily},
    error::ComposerError,
};

/// Default capability feed query.
pub const DEFAULT_CAPABILITY_QUERY: &str =
    "SELECT ?descriptor WHERE { ?descriptor a :AdvisorFunctionDescriptor }";

const fn default_loop_interval_ms() -> u64 {
    1000
}

fn default_blackboard_url() -> String {
    "opc.tcp://localhost:48030".into()
}

fn default_capability_query() -> String {
    DEFAULT_CAPABILITY_QUERY.into()
}

const fn default_window_ms() -> u64 {
    5000
}

/// Staleness windows per family, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObsolescenceConfig {
    /// Controller functions.
    #[serde(default = "default_window_ms")]
    pub controller_ms: u64,
    /// Procedure functions.
    #[serde(default = "default_window_ms")]
    pub procedure_ms: u64,
    /// Fault handling functions.
    #[serde(default = "default_window_ms")]
    pub fault_handling_ms: u64,
    /// Safe envelope functions.
    #[serde(default = "default_window_ms")]
    pub safe_envelope_ms: u64,
}

impl Default for ObsolescenceConfig {
    fn default() -> Self {
        Self {
            controller_ms: default_window_ms(),
            procedure_ms: default_window_ms(),
            fault_handling_ms: default_window_ms(),
            safe_envelope_ms: default_window_ms(),
        }
    }
}

/// Composer service configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Tick period.
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    /// Blackboard endpoint, informational.
    #[serde(default = "default_blackboard_url")]
    pub blackboard_url: String,
    /// Capability feed query.
    #[serde(default = "default_capability_query")]
    pub capability_query: String,
    /// Staleness windows.
    #[serde(default)]
    pub obsolescence: ObsolescenceConfig,
    /// Feature tags accepted on top of the drilling vocabulary.
    #[serde(default)]
    pub extra_features: Vec<String>,
    /// JSON-lines telemetry file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: default_loop_interval_ms(),
            blackboard_url: default_blackboard_url(),
            capability_query: default_capability_query(),
            obsolescence: ObsolescenceConfig::default(),
            extra_features: Vec::new(),
            log_path: None,
        }
    }
}

impl ComposerConfig {
    /// Loads `path`, writing defaults there first when it does not exist.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading composer config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("serializing composer config")?;
        fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
    }

    /// Rejects settings the tick loop cannot run with.
    pub fn validate(&self) -> Result<(), ComposerError> {
        if self.loop_interval_ms == 0 {
            return Err(ComposerError::Config("loop_interval_ms must be positive".into()));
        }
        if self.capability_query.trim().is_empty() {
            return Err(ComposerError::Config("capability_query is empty".into()));
        }
        Ok(())
    }

    /// Tick period.
    #[must_use]
    pub const fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    /// Staleness window of a family.
    #[must_use]
    pub fn window(&self, family: FunctionFamily) -> chrono::Duration {
        let ms = match family {
            FunctionFamily::Controller => self.obsolescence.controller_ms,
            FunctionFamily::Procedure => self.obsolescence.procedure_ms,
            FunctionFamily::FaultHandling => self.obsolescence.fault_handling_ms,
            FunctionFamily::SafeEnvelope => self.obsolescence.safe_envelope_ms,
        };
        chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    /// Feature catalog with the extra tags.
    #[must_use]
    pub fn feature_catalog(&self) -> FeatureCatalog {
        FeatureCatalog::new(self.extra_features.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_initialized_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/composer.toml");
        let config = ComposerConfig::load_or_init(&path).unwrap();
        assert_eq!(config, ComposerConfig::default());
        assert!(path.exists());
        assert_eq!(config.loop_interval(), Duration::from_secs(1));
        assert_eq!(config.blackboard_url, "opc.tcp://localhost:48030");
        assert_eq!(
            config.window(FunctionFamily::SafeEnvelope),
            chrono::Duration::seconds(5)
        );
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("composer.toml");
        fs::write(
            &path,
            "loop_interval_ms = 250\nextra_features = [\"MudLossFeature\"]\n[obsolescence]\ncontroller_ms = 2000\n",
        )
        .unwrap();
        let config = ComposerConfig::load_or_init(&path).unwrap();
        assert_eq!(config.loop_interval_ms, 250);
        assert_eq!(config.obsolescence.controller_ms, 2000);
        assert_eq!(config.obsolescence.procedure_ms, 5000);
        assert!(config.feature_catalog().parse("MudLossFeature").is_ok());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("composer.toml");
        fs::write(&path, "loop_interval_ms = 0\n").unwrap();
        assert!(ComposerConfig::load_or_init(&path).is_err());
        fs::write(&path, "loop_interval_ms = [\n").unwrap();
        assert!(ComposerConfig::load_or_init(&path).is_err());
    }
}
