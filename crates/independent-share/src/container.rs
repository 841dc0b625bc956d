//! Container Descriptor Builder.
//!
//! Owns the identity of one isolated build (container name, global name,
//! output filename) and checks that the build emitted exactly one file for
//! its container entrypoint.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::engine::{AssetStage, Compilation, PluginDescriptor, ProcessAssetsHook};
use crate::error::{ShareError, ShareResult};
use crate::model::ContainerArtifact;
use crate::naming::encode_name;

/// Engine plugin that adds the share container entry.
pub const SHARE_CONTAINER_PLUGIN: &str = "ShareContainerPlugin";

const HOT_UPDATE_SUFFIX: &str = ".hot-update";
const FALLBACK_VERSION: &str = "0.0.0";

/// Options of [`SHARE_CONTAINER_PLUGIN`].
///
/// The engine registers the container entry under `share_name`, emits it to
/// `file_name`, and exposes `get`/`init` on `global_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareContainerOptions {
    pub name: String,
    pub share_name: String,
    pub request: String,
    pub version: String,
    pub global_name: String,
    pub file_name: String,
}

impl ShareContainerOptions {
    pub fn new(host_name: &str, share_key: &str, version: &str, request: &str) -> Self {
        let version = if version.is_empty() {
            FALLBACK_VERSION
        } else {
            version
        };
        Self {
            name: encode_name(&format!("{host_name}_{share_key}_{version}")),
            share_name: share_key.to_string(),
            request: request.to_string(),
            version: version.to_string(),
            global_name: encode_name(&format!("{host_name}_{share_key}_{version}_global")),
            file_name: format!("independent-share/{share_key}@{version}/{host_name}.container.js"),
        }
    }
}

/// Identity and output-shape contract of one isolated build.
#[derive(Debug)]
pub struct ContainerDescriptor {
    options: ShareContainerOptions,
    emitted: Mutex<Option<String>>,
}

impl ContainerDescriptor {
    pub fn new(host_name: &str, share_key: &str, version: &str, request: &str) -> Self {
        Self {
            options: ShareContainerOptions::new(host_name, share_key, version, request),
            emitted: Mutex::new(None),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.options.name
    }

    pub fn global_name(&self) -> &str {
        &self.options.global_name
    }

    pub fn file_name(&self) -> &str {
        &self.options.file_name
    }

    pub fn share_key(&self) -> &str {
        &self.options.share_name
    }

    pub fn version(&self) -> &str {
        &self.options.version
    }

    pub fn options(&self) -> &ShareContainerOptions {
        &self.options
    }

    pub fn plugin(&self) -> ShareResult<PluginDescriptor> {
        Ok(PluginDescriptor::host_only(
            SHARE_CONTAINER_PLUGIN,
            serde_json::to_value(&self.options)?,
        ))
    }

    /// Find the single eligible file emitted for the container entrypoint.
    ///
    /// Hot-update files and stylesheets are not eligible.
    pub fn locate(&self, compilation: &Compilation) -> ShareResult<String> {
        let share_key = self.share_key();
        let files = compilation
            .entrypoint_files(share_key)
            .ok_or_else(|| ShareError::EntrypointMissing {
                share_key: share_key.to_string(),
            })?;

        let mut eligible: Vec<String> = files
            .iter()
            .filter(|file| !file.contains(HOT_UPDATE_SUFFIX) && !file.ends_with(".css"))
            .cloned()
            .collect();

        match eligible.len() {
            0 => Err(ShareError::NoFilesFound {
                share_key: share_key.to_string(),
            }),
            1 => Ok(eligible.remove(0)),
            _ => Err(ShareError::MultipleFiles {
                share_key: share_key.to_string(),
                files: eligible,
            }),
        }
    }

    /// The captured artifact; available once the owning build processed
    /// its assets.
    pub fn artifact(&self) -> ShareResult<ContainerArtifact> {
        let emitted = self
            .emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ShareError::ArtifactNotCaptured {
                share_key: self.share_key().to_string(),
            })?;
        Ok(ContainerArtifact {
            container_name: self.options.name.clone(),
            global_name: self.options.global_name.clone(),
            emitted_filename: emitted,
        })
    }
}

impl ProcessAssetsHook for ContainerDescriptor {
    fn name(&self) -> &str {
        "getShareContainerFile"
    }

    fn stage(&self) -> AssetStage {
        AssetStage::Summarize
    }

    fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()> {
        let file = self.locate(compilation)?;
        *self.emitted.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
        Ok(())
    }
}
