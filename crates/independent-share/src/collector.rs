//! Share Request Collector.
//!
//! Drives the discovery pass: hands the engine the list of shared
//! specifiers to provide, then reads back the discovery artifact the engine
//! emitted and turns it into a [`ShareRequestsMap`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::engine::{AssetStage, Compilation, PluginDescriptor, ProcessAssetsHook};
use crate::error::{ShareError, ShareResult};
use crate::model::{ShareRequests, ShareRequestsMap, SharedDependencySpec};

/// Well-known discovery artifact filename.
pub const SHARE_ENTRY_ASSET: &str = "collect-share-entries.json";

/// Engine plugin that records resolved shared requests.
pub const COLLECT_SHARE_ENTRY_PLUGIN: &str = "CollectShareEntryPlugin";

/// One specifier the discovery build must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvideOption {
    /// Request as written in the synthetic entry. A trailing `/` makes it a
    /// prefix that matches deep imports.
    pub key: String,
    pub share_key: String,
    pub share_scope: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub required_version: Option<String>,
}

/// Options of [`COLLECT_SHARE_ENTRY_PLUGIN`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectShareEntryOptions {
    pub provides: Vec<ProvideOption>,
    pub filename: String,
}

impl CollectShareEntryOptions {
    pub fn from_specs(specs: &[SharedDependencySpec]) -> Self {
        let provides = specs
            .iter()
            .map(|spec| ProvideOption {
                key: spec.import.clone(),
                share_key: spec.share_key.clone(),
                share_scope: spec.share_scope.clone(),
                version: spec.version.clone(),
                required_version: spec.required_version.clone(),
            })
            .collect();
        Self {
            provides,
            filename: SHARE_ENTRY_ASSET.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryArtifact {
    Enveloped { shared: ShareRequestsMap },
    Flat(ShareRequestsMap),
}

/// Collects discovery results from one discovery build.
#[derive(Debug)]
pub struct ShareRequestCollector {
    options: CollectShareEntryOptions,
    collected: Mutex<Option<ShareRequestsMap>>,
}

impl ShareRequestCollector {
    pub fn new(specs: &[SharedDependencySpec]) -> Self {
        Self {
            options: CollectShareEntryOptions::from_specs(specs),
            collected: Mutex::new(None),
        }
    }

    pub fn filename(&self) -> &str {
        &self.options.filename
    }

    /// Plugin descriptor the discovery build must carry.
    pub fn configure(&self) -> ShareResult<PluginDescriptor> {
        Ok(PluginDescriptor::host_only(
            COLLECT_SHARE_ENTRY_PLUGIN,
            serde_json::to_value(&self.options)?,
        ))
    }

    /// Source of the synthetic entry importing every configured specifier.
    pub fn entry_source(&self) -> String {
        self.options
            .provides
            .iter()
            .enumerate()
            .map(|(index, provide)| format!("import shared_{index} from '{}';\n", provide.key))
            .collect()
    }

    /// Parse the discovery artifact out of a finished compilation.
    pub fn collect(&self, compilation: &Compilation) -> ShareResult<ShareRequestsMap> {
        let raw = compilation.get_asset(self.filename()).ok_or_else(|| {
            ShareError::DiscoveryArtifactMissing {
                filename: self.filename().to_string(),
            }
        })?;
        parse_discovery_artifact(self.filename(), raw)
    }

    /// The map captured during the discovery build.
    ///
    /// Fails with [`ShareError::DiscoveryArtifactMissing`] when the build
    /// never reached the collection stage.
    pub fn data(&self) -> ShareResult<ShareRequestsMap> {
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ShareError::DiscoveryArtifactMissing {
                filename: self.filename().to_string(),
            })
    }
}

impl ProcessAssetsHook for ShareRequestCollector {
    fn name(&self) -> &str {
        "collect share entry"
    }

    fn stage(&self) -> AssetStage {
        AssetStage::Summarize
    }

    fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()> {
        let map = self.collect(compilation)?;
        *self.collected.lock().unwrap_or_else(|e| e.into_inner()) = Some(map);
        Ok(())
    }
}

/// Parse either the flat `shareKey -> {..}` form or the `{"shared": {..}}`
/// envelope, dropping repeated request paths per key.
pub fn parse_discovery_artifact(filename: &str, raw: &str) -> ShareResult<ShareRequestsMap> {
    let parsed: DiscoveryArtifact =
        serde_json::from_str(raw).map_err(|e| ShareError::DiscoveryArtifactInvalid {
            filename: filename.to_string(),
            reason: e.to_string(),
        })?;
    let map = match parsed {
        DiscoveryArtifact::Enveloped { shared } => shared,
        DiscoveryArtifact::Flat(map) => map,
    };

    let mut normalized = BTreeMap::new();
    for (share_key, entry) in map {
        let mut requests = ShareRequests::new(entry.share_scope);
        for (path, version) in entry.requests {
            requests.push_request(path, version);
        }
        normalized.insert(share_key, requests);
    }
    Ok(normalized)
}
