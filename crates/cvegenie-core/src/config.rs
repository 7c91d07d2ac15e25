//! Workspace configuration loaded from YAML.
//!
//! ```yaml
//! shared_root: ./shared
//! template_dir: ./templates
//! model: gpt-4o
//! classifier:
//!   default_profile: native-local
//!   min_confidence: 0.55
//!   timeout_secs: 3600
//! implementation_overrides:
//!   web-basic:
//!     WebExploiter: PlaywrightAgent
//! logging:
//!   json: false
//!   level: info
//! ```
//!
//! Every field is optional. The binary layers flags and `CVEGENIE_*`
//! environment variables on top.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::builder::{ImplementationOverrides, PlanBuilder, PlanSource, TemplatePlanSource};
use crate::classifier::ClassifierConfig;
use crate::plan::PlanResult;
use crate::telemetry::parse_level;

/// Errors raised while loading or checking a [`GenieConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown log level {0:?}")]
    InvalidLevel(String),

    #[error("min_confidence must be within [0, 1], got {0}")]
    InvalidMinConfidence(f64),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenieConfig {
    /// Root of `<cve>/events.jsonl`, `<cve>/artifacts/` and `results.csv`.
    pub shared_root: PathBuf,
    /// Directory of `<profile>.yaml` templates. Unset means the built-in
    /// programmatic plans.
    pub template_dir: Option<PathBuf>,
    /// Model name recorded in the results ledger.
    pub model: String,
    pub classifier: ClassifierConfig,
    pub implementation_overrides: ImplementationOverrides,
    pub logging: LoggingConfig,
}

impl Default for GenieConfig {
    fn default() -> Self {
        Self {
            shared_root: PathBuf::from("shared"),
            template_dir: None,
            model: "unknown".to_string(),
            classifier: ClassifierConfig::default(),
            implementation_overrides: ImplementationOverrides::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GenieConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.log_level()?;
        let min = self.classifier.min_confidence;
        if !(0.0..=1.0).contains(&min) {
            return Err(ConfigError::InvalidMinConfidence(min));
        }
        Ok(())
    }

    pub fn log_level(&self) -> ConfigResult<Level> {
        parse_level(&self.logging.level)
            .ok_or_else(|| ConfigError::InvalidLevel(self.logging.level.clone()))
    }

    pub fn plan_builder(&self) -> PlanBuilder {
        PlanBuilder::with_overrides(self.implementation_overrides.clone())
    }

    /// Template source when `template_dir` is set, programmatic builder
    /// otherwise.
    pub fn plan_source(&self) -> PlanResult<Box<dyn PlanSource>> {
        match &self.template_dir {
            Some(dir) => Ok(Box::new(TemplatePlanSource::from_path(dir)?)),
            None => Ok(Box::new(self.plan_builder())),
        }
    }
}
