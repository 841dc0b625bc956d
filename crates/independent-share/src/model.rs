//! Data model shared by the collector, the container descriptor and the
//! orchestrator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};

/// Share scope used when a shared entry does not name one.
pub const DEFAULT_SHARE_SCOPE: &str = "default";

/// One declared shared dependency, normalized from host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDependencySpec {
    /// Logical name the dependency is shared under.
    pub share_key: String,
    /// Module request the host imports for this key.
    pub import: String,
    /// Version range consumers accept.
    pub required_version: Option<String>,
    /// Version this host provides, when pinned in configuration.
    pub version: Option<String>,
    pub share_scope: String,
    /// Whether an isolated build is produced for this key.
    pub treeshake: bool,
    /// Exports known to be used; kept in declaration order without duplicates.
    pub used_exports: Option<Vec<String>>,
}

impl SharedDependencySpec {
    pub fn new(share_key: impl Into<String>, import: impl Into<String>) -> Self {
        Self {
            share_key: share_key.into(),
            import: import.into(),
            required_version: None,
            version: None,
            share_scope: DEFAULT_SHARE_SCOPE.to_string(),
            treeshake: false,
            used_exports: None,
        }
    }

    /// Enable tree-shaking for this key.
    pub fn treeshake(mut self) -> Self {
        self.treeshake = true;
        self
    }

    pub fn with_required_version(mut self, range: impl Into<String>) -> Self {
        self.required_version = Some(range.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Record used exports, dropping repeats while keeping first-seen order.
    pub fn with_used_exports<I, S>(mut self, exports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for export in exports {
            let export = export.into();
            if !ordered.contains(&export) {
                ordered.push(export);
            }
        }
        self.used_exports = Some(ordered);
        self
    }
}

/// Requests discovered for one share key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRequests {
    #[serde(rename = "shareScope")]
    pub share_scope: String,
    /// `(resolved request path, version)` pairs, unique by path.
    pub requests: Vec<(String, String)>,
}

impl ShareRequests {
    pub fn new(share_scope: impl Into<String>) -> Self {
        Self {
            share_scope: share_scope.into(),
            requests: Vec::new(),
        }
    }

    /// Add a request unless its path is already present.
    ///
    /// Returns `false` when the path was a duplicate.
    pub fn push_request(&mut self, path: impl Into<String>, version: impl Into<String>) -> bool {
        let path = path.into();
        if self.requests.iter().any(|(existing, _)| *existing == path) {
            return false;
        }
        self.requests.push((path, version.into()));
        true
    }
}

/// Discovery result: share key to the requests that satisfy it.
pub type ShareRequestsMap = BTreeMap<String, ShareRequests>;

/// Identity of a finished container build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerArtifact {
    pub container_name: String,
    pub global_name: String,
    pub emitted_filename: String,
}

/// Lifecycle of a [`BuildJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Succeeded { artifact: ContainerArtifact },
    Failed { error: String },
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }
}

/// One scheduled isolated build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub share_key: String,
    pub resolved_request: String,
    pub version: String,
    pub output_dir: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    pub fn new(
        share_key: impl Into<String>,
        resolved_request: impl Into<String>,
        version: impl Into<String>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            share_key: share_key.into(),
            resolved_request: resolved_request.into(),
            version: version.into(),
            output_dir,
            state: JobState::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Registry key: `shareKey@version`.
    pub fn id(&self) -> String {
        format!("{}@{}", self.share_key, self.version)
    }

    pub fn start(&mut self) -> ShareResult<()> {
        if self.state != JobState::Created {
            return Err(self.illegal("running"));
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn succeed(&mut self, artifact: ContainerArtifact) -> ShareResult<()> {
        if self.state != JobState::Running {
            return Err(self.illegal("succeeded"));
        }
        self.state = JobState::Succeeded { artifact };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> ShareResult<()> {
        if self.state != JobState::Running {
            return Err(self.illegal("failed"));
        }
        self.state = JobState::Failed {
            error: error.into(),
        };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn illegal(&self, to: &'static str) -> ShareError {
        ShareError::InvalidTransition {
            job: self.id(),
            from: self.state.label(),
            to,
        }
    }
}

/// Aggregated output of all successful isolated builds.
///
/// Entries for a key appear in job completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackManifest(BTreeMap<String, Vec<(String, String)>>);

impl FallbackManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        share_key: impl Into<String>,
        filename: impl Into<String>,
        version: impl Into<String>,
    ) {
        self.0
            .entry(share_key.into())
            .or_default()
            .push((filename.into(), version.into()));
    }

    pub fn get(&self, share_key: &str) -> Option<&[(String, String)]> {
        self.0.get(share_key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Total number of `(file, version)` entries across keys.
    pub fn entry_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> ShareResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Vec<(String, String)>> {
        &self.0
    }
}
