//! In-memory build engine (testing only)
//!
//! `MemoryEngine` understands the declarative plugins this crate emits:
//! it records discovery results for [`COLLECT_SHARE_ENTRY_PLUGIN`] from a
//! package table and emits one container file per [`SHARE_CONTAINER_PLUGIN`].
//! Faults (failing builds, extra or missing files, delays) are injectable per
//! share key.
//!
//! [`COLLECT_SHARE_ENTRY_PLUGIN`]: crate::collector::COLLECT_SHARE_ENTRY_PLUGIN
//! [`SHARE_CONTAINER_PLUGIN`]: crate::container::SHARE_CONTAINER_PLUGIN

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::collector::{CollectShareEntryOptions, COLLECT_SHARE_ENTRY_PLUGIN};
use crate::container::{ShareContainerOptions, SHARE_CONTAINER_PLUGIN};
use crate::discovery::DiscoveryRecorder;
use crate::engine::{
    finish_compilation, resolve_output_path, BuildConfig, BuildEngine, BuildHandle, BuildStats,
    Compilation, ProcessAssetsHook,
};
use crate::error::{EngineError, ShareResult};

#[derive(Debug, Clone)]
struct Package {
    resource: String,
    version: Option<String>,
}

#[derive(Debug, Default)]
struct Faults {
    failing: HashSet<String>,
    extra_files: HashMap<String, Vec<String>>,
    without_file: HashSet<String>,
    delays: HashMap<String, Duration>,
    skip_discovery_artifact: bool,
    discovery_artifact: Option<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    /// Import request to the resources it resolves to.
    packages: HashMap<String, Vec<Package>>,
    faults: Faults,
    watch: bool,
}

/// Shared counters for observing concurrency.
#[derive(Debug, Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// In-memory engine driven by a package table.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
    gauge: Arc<Gauge>,
    handles: Mutex<Vec<Arc<MemoryBuildHandle>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `request` to `resource`, with the package description
    /// reporting `version` (`None` means no version field).
    pub fn with_package(self, request: &str, resource: &str, version: Option<&str>) -> Self {
        self.state()
            .packages
            .entry(request.to_string())
            .or_default()
            .push(Package {
                resource: resource.to_string(),
                version: version.map(str::to_string),
            });
        self
    }

    /// Builds for this share key report a compilation error.
    pub fn failing(self, share_key: &str) -> Self {
        self.state().faults.failing.insert(share_key.to_string());
        self
    }

    /// Builds for this share key emit an additional entrypoint file.
    pub fn with_extra_file(self, share_key: &str, file: &str) -> Self {
        self.state()
            .faults
            .extra_files
            .entry(share_key.to_string())
            .or_default()
            .push(file.to_string());
        self
    }

    /// Builds for this share key create the entrypoint but no file.
    pub fn without_container_file(self, share_key: &str) -> Self {
        self.state().faults.without_file.insert(share_key.to_string());
        self
    }

    pub fn with_delay(self, share_key: &str, delay: Duration) -> Self {
        self.state().faults.delays.insert(share_key.to_string(), delay);
        self
    }

    /// Discovery builds never emit their artifact.
    pub fn without_discovery_artifact(self) -> Self {
        self.state().faults.skip_discovery_artifact = true;
        self
    }

    /// Discovery builds emit `raw` as their artifact instead of what the
    /// package table resolves to.
    pub fn with_discovery_artifact(self, raw: &str) -> Self {
        self.state().faults.discovery_artifact = Some(raw.to_string());
        self
    }

    /// Handles created from now on are in watch mode.
    pub fn watching(self) -> Self {
        self.state().watch = true;
        self
    }

    /// Every handle created so far, in creation order.
    pub fn handles(&self) -> Vec<Arc<MemoryBuildHandle>> {
        self.handles.lock().unwrap().clone()
    }

    /// Configurations of every handle created so far.
    pub fn configs(&self) -> Vec<BuildConfig> {
        self.handles().iter().map(|h| h.config.clone()).collect()
    }

    /// Highest number of builds observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }
}

impl BuildEngine for MemoryEngine {
    fn create(&self, config: BuildConfig) -> ShareResult<Arc<dyn BuildHandle>> {
        let handle = Arc::new(MemoryBuildHandle {
            config,
            state: Arc::clone(&self.state),
            gauge: Arc::clone(&self.gauge),
            running: AtomicBool::new(false),
            watching: AtomicBool::new(self.state().watch),
            runs: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        Ok(handle)
    }
}

/// Handle created by [`MemoryEngine`].
#[derive(Debug)]
pub struct MemoryBuildHandle {
    config: BuildConfig,
    state: Arc<Mutex<EngineState>>,
    gauge: Arc<Gauge>,
    running: AtomicBool,
    watching: AtomicBool,
    runs: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryBuildHandle {
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Share key of the container this handle builds, if any.
    pub fn share_key(&self) -> Option<String> {
        self.container_options().map(|o| o.share_name)
    }

    fn container_options(&self) -> Option<ShareContainerOptions> {
        self.config
            .plugin(SHARE_CONTAINER_PLUGIN)
            .and_then(|p| serde_json::from_value(p.options.clone()).ok())
    }

    fn compile(&self) -> Result<(Compilation, Vec<Arc<dyn ProcessAssetsHook>>), EngineError> {
        let state = self.state.lock().unwrap();
        let mut compilation = Compilation::new();
        let mut extra_hooks: Vec<Arc<dyn ProcessAssetsHook>> = Vec::new();

        if let Some(plugin) = self.config.plugin(COLLECT_SHARE_ENTRY_PLUGIN) {
            let options: CollectShareEntryOptions = serde_json::from_value(plugin.options.clone())
                .map_err(|e| EngineError::Engine(e.to_string()))?;
            let provided: Vec<String> = options.provides.iter().map(|p| p.key.clone()).collect();
            let filename = options.filename.clone();
            let recorder = DiscoveryRecorder::new(options);
            for request in provided {
                for package in state.packages.get(&request).into_iter().flatten() {
                    recorder.record(&request, &package.resource, package.version.as_deref());
                }
            }
            if let Some(raw) = &state.faults.discovery_artifact {
                compilation.emit_asset(filename, raw.clone());
            } else if !state.faults.skip_discovery_artifact {
                extra_hooks.push(Arc::new(recorder));
            }
            compilation.add_entrypoint_file("virtual-entry", "virtual-entry.js");
        }

        if let Some(options) = self.container_options() {
            let key = &options.share_name;
            if state.faults.failing.contains(key) {
                return Err(EngineError::Compilation(vec![format!(
                    "Module not found: Can't resolve '{}'",
                    options.request
                )]));
            }
            if state.faults.without_file.contains(key) {
                compilation.entrypoints.entry(key.clone()).or_default();
            } else {
                compilation.add_entrypoint_file(key.clone(), options.file_name.clone());
                compilation.emit_asset(
                    options.file_name.clone(),
                    format!(
                        "var {} = {{ get: function () {{}}, init: function () {{}} }};\n",
                        options.global_name
                    ),
                );
            }
            for extra in state.faults.extra_files.get(key).into_iter().flatten() {
                compilation.add_entrypoint_file(key.clone(), extra.clone());
            }
        }

        Ok((compilation, extra_hooks))
    }

    fn delay(&self) -> Option<Duration> {
        let key = self.share_key()?;
        self.state.lock().unwrap().faults.delays.get(&key).copied()
    }
}

#[async_trait]
impl BuildHandle for MemoryBuildHandle {
    async fn run(&self) -> Result<BuildStats, EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let now = self.gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        match self.delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let result = match self.compile() {
            Ok((compilation, extra_hooks)) => {
                let mut config = self.config.clone();
                config.hooks.extend(extra_hooks);
                finish_compilation(&config, compilation)
            }
            // Compile errors are reported through stats, like a real engine.
            Err(EngineError::Compilation(errors)) => Ok(BuildStats {
                output_path: resolve_output_path(&self.config),
                errors,
                ..BuildStats::default()
            }),
            Err(other) => Err(other),
        };

        self.gauge.running.fetch_sub(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.watching.store(false, Ordering::SeqCst);
        Ok(())
    }
}
