//! Independent Share Library
//!
//! Builds each tree-shaken shared dependency of a module federation host in
//! its own isolated compilation, one per discovered version, and records the
//! emitted container files in a fallback manifest the runtime can load when
//! the host's own shared chunk is unusable.
//!
//! The bundler itself sits behind [`BuildEngine`]; [`CommandEngine`] drives
//! an external bundler process and [`fakes::MemoryEngine`] runs everything
//! in memory for tests.

pub mod collector;
pub mod config;
pub mod container;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod fs;
pub mod model;
pub mod naming;
pub mod obs;
pub mod orchestrator;
pub mod process;
pub mod telemetry;

pub use collector::{
    parse_discovery_artifact, CollectShareEntryOptions, ProvideOption, ShareRequestCollector,
    COLLECT_SHARE_ENTRY_PLUGIN, SHARE_ENTRY_ASSET,
};
pub use config::{ShareConfig, SharedConfig, SharedEntry, DEFAULT_OUTPUT_DIR};
pub use container::{ContainerDescriptor, ShareContainerOptions, SHARE_CONTAINER_PLUGIN};
pub use discovery::DiscoveryRecorder;
pub use engine::{
    finish_compilation, AssetStage, BuildConfig, BuildEngine, BuildHandle, BuildStats,
    Compilation, Optimization, OutputOptions, PluginDescriptor, ProcessAssetsHook,
};
pub use error::{EngineError, ShareError, ShareResult};
pub use fs::{FileSystem, FileSystems, MemoryFileSystem, NativeFileSystem};
pub use model::{
    BuildJob, ContainerArtifact, FallbackManifest, JobState, ShareRequests, ShareRequestsMap,
    SharedDependencySpec, DEFAULT_SHARE_SCOPE,
};
pub use naming::{encode_name, is_required_version};
pub use orchestrator::{
    plan_jobs, read_manifest, IndependentShareOrchestrator, JobPlan, SchedulingContext,
    SubBuildResult, SubBuildStatus, INDEPENDENT_SHARE_BUILD_ASSETS,
};
pub use process::{BuildReport, CommandEngine};
pub use telemetry::{default_directives, init_tracing, LogFormat};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
