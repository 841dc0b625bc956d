//! Error types for independent share orchestration.

use thiserror::Error;

use crate::model::FallbackManifest;

/// Failure reported by a build engine for one compilation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The compilation finished but reported errors.
    #[error("compilation failed: {}", .0.join("; "))]
    Compilation(Vec<String>),

    /// The engine itself could not run the build.
    #[error("engine failure: {0}")]
    Engine(String),

    /// A process-assets hook rejected the compilation.
    #[error("{0}")]
    Hook(String),

    /// Reading or writing through a file system handle failed.
    #[error("file system error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<ShareError> for EngineError {
    fn from(err: ShareError) -> Self {
        EngineError::Hook(err.to_string())
    }
}

/// Errors produced by the independent share layer.
#[derive(Debug, Error)]
pub enum ShareError {
    /// No shared dependencies were configured.
    #[error("shared configuration is required for share treeshake")]
    MissingShared,

    /// The host (federation) name was not configured.
    #[error("host name is required for share treeshake")]
    MissingHostName,

    /// A shared entry could not be interpreted.
    #[error("invalid shared configuration for key \"{key}\": {reason}")]
    InvalidSharedConfig { key: String, reason: String },

    /// Two scheduled jobs encode to the same container name.
    #[error("container name {name} is produced by both {first} and {second}")]
    ContainerNameCollision {
        name: String,
        first: String,
        second: String,
    },

    /// The discovery build did not emit its artifact.
    #[error("Can not get {filename}")]
    DiscoveryArtifactMissing { filename: String },

    /// The discovery artifact exists but is malformed.
    #[error("malformed discovery artifact {filename}: {reason}")]
    DiscoveryArtifactInvalid { filename: String, reason: String },

    /// The container entrypoint was never created by the engine.
    #[error("Can not get shared {share_key} entryPoint!")]
    EntrypointMissing { share_key: String },

    /// Output-shape violation: no eligible file for the container.
    #[error("no files found for shared {share_key} chunk")]
    NoFilesFound { share_key: String },

    /// Output-shape violation: more than one eligible file.
    #[error(
        "shared {share_key} chunk should not have multiple files!, current files: {}",
        .files.join(",")
    )]
    MultipleFiles { share_key: String, files: Vec<String> },

    /// A build finished without its descriptor capturing an artifact.
    #[error("container for shared {share_key} was not captured")]
    ArtifactNotCaptured { share_key: String },

    /// A discovery build or isolated build failed.
    #[error("{target} build failed: {source}")]
    BuildFailed {
        target: String,
        #[source]
        source: EngineError,
    },

    /// At least one isolated build failed; `succeeded` lists the outputs
    /// that were written and remain valid.
    #[error("independent share orchestration failed: {first}")]
    OrchestrationFailed {
        first: Box<ShareError>,
        succeeded: FallbackManifest,
    },

    /// A job was driven through an illegal state transition.
    #[error("build job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        job: String,
        from: &'static str,
        to: &'static str,
    },

    /// A scheduled task panicked or was aborted.
    #[error("build task for {target} did not complete: {detail}")]
    TaskJoin { target: String, detail: String },

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// File system access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        ShareError::Serialization(err.to_string())
    }
}

/// Convenience result alias.
pub type ShareResult<T> = std::result::Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_files_error_lists_files() {
        let err = ShareError::MultipleFiles {
            share_key: "react".to_string(),
            files: vec!["a.js".to_string(), "b.js".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("should not have multiple files"));
        assert!(msg.contains("a.js,b.js"));
    }

    #[test]
    fn test_discovery_missing_names_filename() {
        let err = ShareError::DiscoveryArtifactMissing {
            filename: "collect-share-entries.json".to_string(),
        };
        assert!(err.to_string().contains("collect-share-entries.json"));
    }

    #[test]
    fn test_orchestration_failure_surfaces_first_cause() {
        let err = ShareError::OrchestrationFailed {
            first: Box::new(ShareError::BuildFailed {
                target: "lib".to_string(),
                source: EngineError::Compilation(vec!["Module not found".to_string()]),
            }),
            succeeded: FallbackManifest::default(),
        };
        let msg = err.to_string();
        assert!(msg.contains("lib build failed"));
        assert!(msg.contains("Module not found"));
    }
}
