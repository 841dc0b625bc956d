//! Independent Build Orchestrator.
//!
//! Runs one discovery build, then one isolated build per discovered
//! `(share key, request, version)`, and folds the emitted container files
//! into a [`FallbackManifest`].
//!
//! Sub-build handles and job records live in a [`SchedulingContext`] owned by
//! the caller, so independent orchestrations never share state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::collector::ShareRequestCollector;
use crate::config::ShareConfig;
use crate::container::{ContainerDescriptor, ShareContainerOptions};
use crate::engine::{
    AssetStage, BuildConfig, BuildEngine, BuildHandle, BuildStats, Compilation, PluginDescriptor,
    ProcessAssetsHook,
};
use crate::error::{EngineError, ShareError, ShareResult};
use crate::model::{
    BuildJob, ContainerArtifact, FallbackManifest, ShareRequestsMap, SharedDependencySpec,
};
use crate::naming::encode_name;
use crate::obs;

/// Filename of the fallback manifest emitted into the host build.
pub const INDEPENDENT_SHARE_BUILD_ASSETS: &str = "independent-share-build-assets.json";

pub const VIRTUAL_ENTRY: &str = "virtual-entry.js";
pub const VIRTUAL_ENTRY_NAME: &str = "virtual-entry";

/// Engine plugin serving in-memory modules (the synthetic entries).
pub const VIRTUAL_MODULES_PLUGIN: &str = "VirtualModulesPlugin";

/// Engine plugin receiving used-exports hints for tree-shaking.
pub const OPTIMIZE_REFERENCED_EXPORTS_PLUGIN: &str = "OptimizeDependencyReferencedExportsPlugin";

const DISCOVERY_TARGET: &str = "collect shared dependencies";

/// Read-only view of a registered sub-build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubBuildStatus {
    pub name: String,
    pub is_running: bool,
    pub is_watching: bool,
}

/// Where a registered sub-build writes and what it compiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubBuildResult {
    pub name: String,
    pub output_path: PathBuf,
    pub entry: BTreeMap<String, String>,
}

struct SubBuild {
    handle: Arc<dyn BuildHandle>,
    output_path: PathBuf,
    entry: BTreeMap<String, String>,
}

/// Registry of live sub-builds plus the records of every settled job.
///
/// Entries are inserted while jobs are scheduled and removed only by
/// [`SchedulingContext::shutdown`].
#[derive(Default)]
pub struct SchedulingContext {
    registry: Mutex<BTreeMap<String, SubBuild>>,
    jobs: Mutex<Vec<BuildJob>>,
}

impl SchedulingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Vec<SubBuildStatus> {
        self.registry()
            .iter()
            .map(|(name, sub)| SubBuildStatus {
                name: name.clone(),
                is_running: sub.handle.is_running(),
                is_watching: sub.handle.is_watching(),
            })
            .collect()
    }

    pub fn results(&self) -> Vec<SubBuildResult> {
        self.registry()
            .iter()
            .map(|(name, sub)| SubBuildResult {
                name: name.clone(),
                output_path: sub.output_path.clone(),
                entry: sub.entry.clone(),
            })
            .collect()
    }

    /// Settled jobs in completion order.
    pub fn jobs(&self) -> Vec<BuildJob> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    /// Close every watching sub-build and clear the registry.
    ///
    /// Returns how many handles were closed. Calling it again is a no-op.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(String, SubBuild)> = {
            let mut registry = self.registry();
            std::mem::take(&mut *registry).into_iter().collect()
        };

        let mut closed = 0;
        for (name, sub) in drained {
            if !sub.handle.is_watching() {
                continue;
            }
            match sub.handle.close().await {
                Ok(()) => {
                    closed += 1;
                    obs::emit_subbuild_closed(&name);
                }
                Err(e) => warn!(name = %name, error = %e, "failed to close sub-build"),
            }
        }
        closed
    }

    fn register(&self, name: String, sub: SubBuild) {
        self.registry().insert(name, sub);
    }

    fn record_job(&self, job: BuildJob) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).push(job);
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, SubBuild>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One isolated build the orchestrator will schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPlan {
    pub share_key: String,
    pub request: String,
    pub version: String,
    pub output_path: PathBuf,
    pub container: ShareContainerOptions,
}

impl JobPlan {
    /// Registry key, `shareKey@version`.
    pub fn id(&self) -> String {
        format!("{}@{}", self.share_key, self.version)
    }
}

/// Schedules discovery and isolated builds through a [`BuildEngine`].
pub struct IndependentShareOrchestrator {
    engine: Arc<dyn BuildEngine>,
    config: ShareConfig,
    specs: Vec<SharedDependencySpec>,
}

impl IndependentShareOrchestrator {
    /// Validate configuration; fails before any build starts.
    pub fn new(engine: Arc<dyn BuildEngine>, config: ShareConfig) -> ShareResult<Self> {
        let specs = config.shared_specs()?;
        Ok(Self {
            engine,
            config,
            specs,
        })
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    pub fn specs(&self) -> &[SharedDependencySpec] {
        &self.specs
    }

    /// Discovery, then every isolated build; resolves once all jobs settled.
    ///
    /// The manifest holds one entry per built `shareKey@version`, not one per
    /// resolved request: when several request paths resolve to the same
    /// version only the first is built, and the others are dropped with a
    /// warning. See [`plan_jobs`].
    ///
    /// On failure the error carries the first failure observed plus the
    /// manifest of the jobs that did succeed. Their files stay on disk and
    /// are valid; nothing else is.
    #[instrument(skip_all, fields(host = %self.config.host_name))]
    pub async fn run(
        &self,
        ctx: &SchedulingContext,
        host: &BuildConfig,
    ) -> ShareResult<FallbackManifest> {
        let requests = self.discover(host).await?;
        let plans = self.plan(host, &requests)?;
        let manifest = self.fan_out(ctx, host, plans).await;

        match &manifest {
            Ok(manifest) => info!(
                keys = manifest.as_map().len(),
                entries = manifest.entry_count(),
                "all independent packages compiled"
            ),
            Err(e) => warn!(error = %e, "independent share orchestration failed"),
        }
        manifest
    }

    /// Run the discovery build and return what it resolved.
    pub async fn discover(&self, host: &BuildConfig) -> ShareResult<ShareRequestsMap> {
        obs::emit_discovery_started(&self.config.host_name, self.specs.len());

        let collector = Arc::new(ShareRequestCollector::new(&self.specs));
        let hook: Arc<dyn ProcessAssetsHook> = collector.clone();
        let config = self.derive_config(
            host,
            base_output_path(&self.config, host),
            collector.entry_source(),
            vec![collector.configure()?],
            hook,
        );

        let handle = self.engine.create(config)?;
        let outcome = run_to_completion(handle.as_ref()).await;
        // The discovery build is never registered, so it is closed here.
        if handle.is_watching() {
            if let Err(e) = handle.close().await {
                warn!(error = %e, "failed to close discovery build");
            }
        }
        outcome.map_err(|source| ShareError::BuildFailed {
            target: DISCOVERY_TARGET.to_string(),
            source,
        })?;

        let requests = collector.data()?;
        obs::emit_discovery_finished(
            requests.len(),
            requests.values().map(|r| r.requests.len()).sum(),
        );
        Ok(requests)
    }

    /// Turn discovery results into job plans. See [`plan_jobs`].
    pub fn plan(
        &self,
        host: &BuildConfig,
        requests: &ShareRequestsMap,
    ) -> ShareResult<Vec<JobPlan>> {
        plan_jobs(&self.config, &self.specs, host, requests)
    }

    /// Hook emitting `manifest` into the host build, when running in
    /// treeshake mode.
    pub fn manifest_emitter(
        &self,
        manifest: FallbackManifest,
    ) -> Option<Arc<dyn ProcessAssetsHook>> {
        self.config
            .treeshake
            .then(|| Arc::new(ManifestEmitter { manifest }) as Arc<dyn ProcessAssetsHook>)
    }

    /// Orchestrate, then run the host build itself with the manifest
    /// emitter attached.
    pub async fn build_host(
        &self,
        ctx: &SchedulingContext,
        mut host: BuildConfig,
    ) -> ShareResult<(FallbackManifest, BuildStats)> {
        let manifest = self.run(ctx, &host).await?;
        if let Some(emitter) = self.manifest_emitter(manifest.clone()) {
            host.hooks.push(emitter);
        }
        let handle = self.engine.create(host)?;
        let stats = run_to_completion(handle.as_ref())
            .await
            .map_err(|source| ShareError::BuildFailed {
                target: self.config.host_name.clone(),
                source,
            })?;
        Ok((manifest, stats))
    }

    async fn fan_out(
        &self,
        ctx: &SchedulingContext,
        host: &BuildConfig,
        plans: Vec<JobPlan>,
    ) -> ShareResult<FallbackManifest> {
        let limiter = self
            .config
            .max_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits)));
        let spec_by_key: HashMap<&str, &SharedDependencySpec> = self
            .specs
            .iter()
            .map(|spec| (spec.share_key.as_str(), spec))
            .collect();

        // Every handle is created and registered before any job runs.
        let mut prepared = Vec::with_capacity(plans.len());
        for plan in plans {
            let descriptor = Arc::new(ContainerDescriptor::new(
                &self.config.host_name,
                &plan.share_key,
                &plan.version,
                &plan.request,
            ));

            let mut plugins = vec![descriptor.plugin()?];
            if let Some(spec) = spec_by_key.get(plan.share_key.as_str()) {
                plugins.push(optimize_exports_plugin(spec));
            }
            let hook: Arc<dyn ProcessAssetsHook> = descriptor.clone();
            let config = self.derive_config(
                host,
                plan.output_path.clone(),
                format!("import shared_0 from '{}';\n", plan.request),
                plugins,
                hook,
            );
            let entry = config.entry.clone();
            let handle = self.engine.create(config)?;
            prepared.push((plan, descriptor, handle, entry));
        }
        for (plan, _, handle, entry) in &prepared {
            ctx.register(
                plan.id(),
                SubBuild {
                    handle: Arc::clone(handle),
                    output_path: plan.output_path.clone(),
                    entry: entry.clone(),
                },
            );
        }

        let mut pending = FuturesUnordered::new();
        for (plan, descriptor, handle, _) in prepared {
            let id = plan.id();
            obs::emit_job_scheduled(&id, &plan.request);
            let job = BuildJob::new(plan.share_key, plan.request, plan.version, plan.output_path);
            let task = tokio::spawn(execute_job(job, handle, descriptor, limiter.clone()));
            pending.push(async move { (id, task.await) });
        }

        let scheduled = pending.len();
        let mut manifest = FallbackManifest::new();
        let mut first_failure: Option<ShareError> = None;

        while let Some((id, joined)) = pending.next().await {
            let (job, outcome) = match joined {
                Ok(settled) => settled,
                Err(e) => {
                    let err = ShareError::TaskJoin {
                        target: id.clone(),
                        detail: e.to_string(),
                    };
                    obs::emit_job_failed(&id, &err);
                    first_failure.get_or_insert(err);
                    continue;
                }
            };

            match outcome {
                Ok(artifact) => {
                    manifest.append(
                        job.share_key.clone(),
                        artifact.emitted_filename,
                        job.version.clone(),
                    );
                }
                Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
            ctx.record_job(job);
        }

        obs::emit_orchestration_finished(
            scheduled,
            manifest.entry_count(),
            first_failure.is_none(),
        );
        match first_failure {
            None => Ok(manifest),
            Some(first) => Err(ShareError::OrchestrationFailed {
                first: Box::new(first),
                succeeded: manifest,
            }),
        }
    }

    /// Isolated configuration derived from the host: synthetic entry,
    /// namespaced output, no code-splitting, inheritable host plugins only,
    /// and the host's file system handles.
    fn derive_config(
        &self,
        host: &BuildConfig,
        output_path: PathBuf,
        entry_source: String,
        extra_plugins: Vec<PluginDescriptor>,
        hook: Arc<dyn ProcessAssetsHook>,
    ) -> BuildConfig {
        let mut plugins: Vec<PluginDescriptor> = host
            .plugins
            .iter()
            .filter(|plugin| plugin.inheritable)
            .cloned()
            .collect();
        plugins.extend(self.config.additional_plugins.iter().cloned());
        plugins.extend(extra_plugins);
        let mut modules = serde_json::Map::new();
        modules.insert(VIRTUAL_ENTRY.to_string(), Value::String(entry_source));
        plugins.push(PluginDescriptor::host_only(
            VIRTUAL_MODULES_PLUGIN,
            Value::Object(modules),
        ));

        let mut optimization = host.optimization.clone();
        optimization.split_chunks = false;

        let mut output = host.output.clone();
        output.path = output_path;
        output.clean = true;
        if output.public_path.is_empty() {
            output.public_path = "auto".to_string();
        }

        BuildConfig {
            mode: Some(host.mode.clone().unwrap_or_else(|| "development".to_string())),
            context: host.context.clone(),
            entry: BTreeMap::from([(VIRTUAL_ENTRY_NAME.to_string(), VIRTUAL_ENTRY.to_string())]),
            output,
            optimization,
            plugins,
            hooks: vec![hook],
            file_systems: host.file_systems.clone(),
        }
    }
}

/// Turn discovery results into job plans.
///
/// Only tree-shaken keys get jobs. A plan keeps the discovered version
/// verbatim; an empty version falls back to `0.0.0` only in the container
/// name, file name and output directory. A second request resolving to an
/// already planned `shareKey@version` is skipped. Two jobs whose names collide after
/// encoding are rejected; equal encoded names are also the only way two jobs
/// could share an output directory.
pub fn plan_jobs(
    config: &ShareConfig,
    specs: &[SharedDependencySpec],
    host: &BuildConfig,
    requests: &ShareRequestsMap,
) -> ShareResult<Vec<JobPlan>> {
    let base = base_output_path(config, host);
    let mut plans = Vec::new();
    let mut ids = HashSet::new();
    let mut names: HashMap<String, String> = HashMap::new();

    for spec in specs.iter().filter(|spec| spec.treeshake) {
        let Some(found) = requests.get(&spec.share_key) else {
            warn!(share_key = %spec.share_key, "no requests discovered for shared dependency");
            continue;
        };

        for (request, version) in &found.requests {
            let container =
                ShareContainerOptions::new(&config.host_name, &spec.share_key, version, request);
            let plan = JobPlan {
                share_key: spec.share_key.clone(),
                request: request.clone(),
                version: version.clone(),
                output_path: base
                    .join(encode_name(&spec.share_key))
                    .join(encode_name(&container.version)),
                container,
            };
            let id = plan.id();

            // Deduplicate on the directory name so `""` and `"0.0.0"` share a build.
            if !ids.insert(format!("{}@{}", plan.share_key, plan.container.version)) {
                warn!(
                    job = %id,
                    request = %request,
                    "skipping request for an already planned version"
                );
                continue;
            }
            if let Some(first) = names.insert(plan.container.name.clone(), id.clone()) {
                return Err(ShareError::ContainerNameCollision {
                    name: plan.container.name.clone(),
                    first,
                    second: id,
                });
            }
            plans.push(plan);
        }
    }
    Ok(plans)
}

/// `<context>/<host output dir name>/<output_dir>`
fn base_output_path(config: &ShareConfig, host: &BuildConfig) -> PathBuf {
    let parent = host
        .output
        .path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    host.context.join(parent).join(&config.output_dir)
}

fn optimize_exports_plugin(spec: &SharedDependencySpec) -> PluginDescriptor {
    PluginDescriptor::host_only(
        OPTIMIZE_REFERENCED_EXPORTS_PLUGIN,
        json!({
            "shared": [{
                "shareKey": spec.share_key,
                "treeshake": spec.treeshake,
                "usedExports": spec.used_exports,
            }],
            "ignoredRuntime": [],
        }),
    )
}

/// Run a handle once, treating reported compilation errors as failure.
async fn run_to_completion(handle: &dyn BuildHandle) -> Result<BuildStats, EngineError> {
    let stats = handle.run().await?;
    if stats.has_errors() {
        return Err(EngineError::Compilation(stats.errors));
    }
    Ok(stats)
}

async fn execute_job(
    mut job: BuildJob,
    handle: Arc<dyn BuildHandle>,
    descriptor: Arc<ContainerDescriptor>,
    limiter: Option<Arc<Semaphore>>,
) -> (BuildJob, ShareResult<ContainerArtifact>) {
    let _permit = match limiter {
        Some(sem) => sem.acquire_owned().await.ok(),
        None => None,
    };

    let id = job.id();
    let started = Instant::now();
    if let Err(e) = job.start() {
        return (job, Err(e));
    }
    debug!(job = %id, "isolated build running");

    let outcome = match run_to_completion(handle.as_ref()).await {
        Ok(_) => descriptor.artifact(),
        Err(source) => Err(ShareError::BuildFailed {
            target: job.share_key.clone(),
            source,
        }),
    };

    let transition = match &outcome {
        Ok(artifact) => {
            obs::emit_job_succeeded(
                &id,
                &artifact.emitted_filename,
                started.elapsed().as_millis() as u64,
            );
            job.succeed(artifact.clone())
        }
        Err(e) => {
            obs::emit_job_failed(&id, e);
            job.fail(e.to_string())
        }
    };
    if let Err(e) = transition {
        return (job, Err(e));
    }
    (job, outcome)
}

/// Emits the fallback manifest into the host compilation.
#[derive(Debug)]
struct ManifestEmitter {
    manifest: FallbackManifest,
}

impl ProcessAssetsHook for ManifestEmitter {
    fn name(&self) -> &str {
        "injectReferenceExports"
    }

    fn stage(&self) -> AssetStage {
        AssetStage::OptimizeTransfer
    }

    fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()> {
        compilation.emit_asset(INDEPENDENT_SHARE_BUILD_ASSETS, self.manifest.to_json()?);
        Ok(())
    }
}

/// Read a fallback manifest written by a previous run.
pub fn read_manifest(path: &Path) -> ShareResult<FallbackManifest> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
