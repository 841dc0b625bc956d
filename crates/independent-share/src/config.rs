//! Orchestration configuration.
//!
//! Loaded from TOML or JSON. Shared entries accept either a table or a
//! string shorthand:
//!
//! ```toml
//! host_name = "host"
//! treeshake = true
//!
//! [shared]
//! react = "^18.0.0"                # import "react", requiredVersion "^18.0.0"
//! "ui-lib" = { treeshake = true, used_exports = ["Button"] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::PluginDescriptor;
use crate::error::{ShareError, ShareResult};
use crate::model::{SharedDependencySpec, DEFAULT_SHARE_SCOPE};
use crate::naming::is_required_version;

pub const DEFAULT_OUTPUT_DIR: &str = "independent-packages";

fn default_output_dir() -> String {
    DEFAULT_OUTPUT_DIR.to_string()
}

/// Per-key shared configuration table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Module request; defaults to the share key.
    #[serde(default)]
    pub import: Option<String>,
    #[serde(default, alias = "requiredVersion")]
    pub required_version: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "shareScope")]
    pub share_scope: Option<String>,
    #[serde(default)]
    pub treeshake: bool,
    #[serde(default, alias = "usedExports")]
    pub used_exports: Option<Vec<String>>,
}

/// A `shared` map value as written by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SharedEntry {
    Shorthand(String),
    Config(SharedConfig),
    /// Arrays are not a valid shared entry; kept to report a precise error.
    List(Vec<Value>),
}

/// Everything the orchestrator needs from the host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Federation name of the host.
    #[serde(default, alias = "name", alias = "hostName")]
    pub host_name: String,
    #[serde(default)]
    pub shared: BTreeMap<String, SharedEntry>,
    /// Directory, below the host output directory, receiving sub-builds.
    #[serde(default = "default_output_dir", alias = "outputDir")]
    pub output_dir: String,
    /// Extra plugins appended to every sub-build.
    #[serde(default, alias = "plugins")]
    pub additional_plugins: Vec<PluginDescriptor>,
    /// Emit the fallback manifest into the host build.
    #[serde(default)]
    pub treeshake: bool,
    /// Upper bound on concurrently running sub-builds; unbounded when absent.
    #[serde(default, alias = "maxConcurrency")]
    pub max_concurrency: Option<usize>,
}

impl ShareConfig {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            shared: BTreeMap::new(),
            output_dir: default_output_dir(),
            additional_plugins: Vec::new(),
            treeshake: false,
            max_concurrency: None,
        }
    }

    pub fn with_shared(mut self, key: impl Into<String>, config: SharedConfig) -> Self {
        self.shared.insert(key.into(), SharedEntry::Config(config));
        self
    }

    pub fn from_toml_str(raw: &str) -> ShareResult<Self> {
        toml::from_str(raw).map_err(|e| ShareError::Config(e.to_string()))
    }

    pub fn from_json_str(raw: &str) -> ShareResult<Self> {
        serde_json::from_str(raw).map_err(|e| ShareError::Config(e.to_string()))
    }

    /// Load by extension: `.json` is JSON, anything else is TOML.
    pub fn from_path(path: &Path) -> ShareResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ShareError::Config(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_toml_str(&raw),
        }
    }

    /// Reject configurations that cannot start an orchestration.
    pub fn validate(&self) -> ShareResult<()> {
        if self.shared.is_empty() {
            return Err(ShareError::MissingShared);
        }
        if self.host_name.trim().is_empty() {
            return Err(ShareError::MissingHostName);
        }
        if self.max_concurrency == Some(0) {
            return Err(ShareError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate and normalize every shared entry, ordered by share key.
    pub fn shared_specs(&self) -> ShareResult<Vec<SharedDependencySpec>> {
        self.validate()?;
        self.shared
            .iter()
            .map(|(key, entry)| normalize_entry(key, entry))
            .collect()
    }
}

fn normalize_entry(key: &str, entry: &SharedEntry) -> ShareResult<SharedDependencySpec> {
    match entry {
        SharedEntry::Shorthand(value) => {
            let spec = if value == key || !is_required_version(value) {
                SharedDependencySpec::new(key, value.as_str())
            } else {
                SharedDependencySpec::new(key, key).with_required_version(value.as_str())
            };
            Ok(spec)
        }
        SharedEntry::Config(config) => {
            let import = config.import.clone().unwrap_or_else(|| key.to_string());
            if import.is_empty() {
                return Err(ShareError::InvalidSharedConfig {
                    key: key.to_string(),
                    reason: "import must not be empty".to_string(),
                });
            }
            let mut spec = SharedDependencySpec::new(key, import);
            spec.required_version = config.required_version.clone();
            spec.version = config.version.clone();
            spec.share_scope = config
                .share_scope
                .clone()
                .unwrap_or_else(|| DEFAULT_SHARE_SCOPE.to_string());
            spec.treeshake = config.treeshake;
            if let Some(exports) = &config.used_exports {
                spec = spec.with_used_exports(exports.iter().cloned());
            }
            Ok(spec)
        }
        SharedEntry::List(_) => Err(ShareError::InvalidSharedConfig {
            key: key.to_string(),
            reason: "unexpected array in shared configuration".to_string(),
        }),
    }
}
