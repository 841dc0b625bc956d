//! End-to-end orchestration tests against the in-memory engine.

use independent_share::fakes::MemoryEngine;
use independent_share::orchestrator::{
    OPTIMIZE_REFERENCED_EXPORTS_PLUGIN, VIRTUAL_ENTRY, VIRTUAL_ENTRY_NAME, VIRTUAL_MODULES_PLUGIN,
};
use independent_share::{
    read_manifest, BuildConfig, BuildHandle, FileSystem, FileSystems,
    IndependentShareOrchestrator, JobState, MemoryFileSystem, PluginDescriptor, SchedulingContext,
    ShareConfig, ShareError, SharedConfig, SharedEntry, INDEPENDENT_SHARE_BUILD_ASSETS,
    SHARE_CONTAINER_PLUGIN,
};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LIB_CONTAINER: &str = "independent-share/lib@1.0.0/host.container.js";

fn treeshaken() -> SharedConfig {
    SharedConfig {
        treeshake: true,
        ..SharedConfig::default()
    }
}

fn host(fs: &Arc<MemoryFileSystem>) -> BuildConfig {
    let mut host = BuildConfig::new("/project");
    host.output.path = PathBuf::from("/project/dist");
    host.file_systems = FileSystems::uniform(fs.clone());
    host.plugins = vec![
        PluginDescriptor::new("DefinePlugin", json!({ "DEBUG": "false" })),
        PluginDescriptor::host_only("ModuleFederationPlugin", json!({ "name": "host" })),
    ];
    host
}

/// `lib` is tree-shaken, `react` is shared normally.
fn share_config() -> ShareConfig {
    let mut config = ShareConfig::new("host").with_shared("lib", treeshaken());
    config.shared.insert(
        "react".to_string(),
        SharedEntry::Shorthand("^18.0.0".to_string()),
    );
    config
}

fn base_engine() -> MemoryEngine {
    MemoryEngine::new()
        .with_package("lib", "node_modules/lib/index.js", Some("1.0.0"))
        .with_package("react", "node_modules/react/index.js", Some("18.2.0"))
}

fn orchestrator(engine: &Arc<MemoryEngine>, config: ShareConfig) -> IndependentShareOrchestrator {
    IndependentShareOrchestrator::new(engine.clone(), config).expect("valid config")
}

fn setup_error(config: ShareConfig) -> ShareError {
    match IndependentShareOrchestrator::new(Arc::new(MemoryEngine::new()), config) {
        Ok(_) => panic!("configuration should be rejected"),
        Err(e) => e,
    }
}

/// Test: a single tree-shaken key produces one manifest entry and one file
#[tokio::test]
async fn test_single_version_manifest() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine());
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .expect("orchestration failed");

    assert_eq!(
        manifest.to_json().unwrap(),
        format!(r#"{{"lib":[["{LIB_CONTAINER}","1.0.0"]]}}"#)
    );
    assert!(fs.exists(
        &Path::new("/project/dist/independent-packages/lib/1.0.0").join(LIB_CONTAINER)
    ));

    let jobs = ctx.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id(), "lib@1.0.0");
    assert!(matches!(jobs[0].state, JobState::Succeeded { .. }));
    assert!(jobs[0].started_at.is_some() && jobs[0].finished_at.is_some());

    let status = ctx.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "lib@1.0.0");
    assert!(!status[0].is_running);

    let results = ctx.results();
    assert_eq!(
        results[0].output_path,
        PathBuf::from("/project/dist/independent-packages/lib/1.0.0")
    );
    assert_eq!(results[0].entry[VIRTUAL_ENTRY_NAME], VIRTUAL_ENTRY);
}

/// Test: an empty discovered version reaches the manifest unchanged
#[tokio::test]
async fn test_empty_version_is_kept_in_manifest() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(MemoryEngine::new().with_discovery_artifact(
        r#"{"lib":{"shareScope":"default","requests":[["node_modules/lib/index.js",""]]}}"#,
    ));
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .expect("orchestration failed");

    let container = "independent-share/lib@0.0.0/host.container.js";
    assert_eq!(
        manifest.to_json().unwrap(),
        format!(r#"{{"lib":[["{container}",""]]}}"#)
    );
    assert!(fs.exists(&Path::new("/project/dist/independent-packages/lib/0.0.0").join(container)));
    assert_eq!(ctx.jobs()[0].version, "");
}

/// Test: every discovered version gets its own build and output directory
#[tokio::test]
async fn test_every_version_gets_one_entry() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine().with_package(
        "lib",
        "node_modules/app/node_modules/lib/index.js",
        Some("2.0.0"),
    ));
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .expect("orchestration failed");

    let mut versions: Vec<String> = manifest
        .get("lib")
        .expect("lib entries")
        .iter()
        .map(|(_, version)| version.clone())
        .collect();
    versions.sort();
    assert_eq!(versions, vec!["1.0.0", "2.0.0"]);

    let outputs: HashSet<PathBuf> = ctx.results().into_iter().map(|r| r.output_path).collect();
    assert_eq!(outputs.len(), 2, "output directories must be disjoint");
}

/// Test: keys that are not tree-shaken are discovered but never built
#[tokio::test]
async fn test_non_treeshake_keys_get_no_jobs() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine());
    let ctx = SchedulingContext::new();
    let orch = orchestrator(&engine, share_config());

    let requests = orch.discover(&host(&fs)).await.expect("discovery failed");
    assert!(requests.contains_key("react"));

    let manifest = orch.run(&ctx, &host(&fs)).await.expect("orchestration failed");
    assert!(manifest.get("react").is_none());
    assert!(engine
        .handles()
        .iter()
        .all(|h| h.share_key().as_deref() != Some("react")));
}

/// Test: discovery is repeatable and yields identical results
#[tokio::test]
async fn test_discovery_is_idempotent() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine());
    let orch = orchestrator(&engine, share_config());

    let first = orch.discover(&host(&fs)).await.unwrap();
    let second = orch.discover(&host(&fs)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first["lib"].requests,
        vec![("node_modules/lib/index.js".to_string(), "1.0.0".to_string())]
    );
}

/// Test: a second request resolving to the same version is not rebuilt
#[tokio::test]
async fn test_duplicate_version_is_built_once() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(
        base_engine().with_package("lib", "node_modules/lib/index.mjs", Some("1.0.0")),
    );
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .unwrap();

    assert_eq!(manifest.entry_count(), 1);
    assert_eq!(ctx.jobs().len(), 1);
}

/// Test: requests without a determinable version are skipped
#[tokio::test]
async fn test_unknown_version_schedules_nothing() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine =
        Arc::new(MemoryEngine::new().with_package("lib", "node_modules/lib/index.js", None));
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .unwrap();

    assert!(manifest.is_empty());
    assert!(ctx.is_empty());
    assert_eq!(engine.handles().len(), 1, "only the discovery build runs");
}

/// Test: extra eligible files violate the output-shape policy
#[tokio::test]
async fn test_multiple_files_fail_the_job() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine().with_extra_file("lib", "lib.vendor.js"));
    let ctx = SchedulingContext::new();

    let err = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .unwrap_err();

    let ShareError::OrchestrationFailed { first, succeeded } = err else {
        panic!("expected OrchestrationFailed");
    };
    assert!(first.to_string().contains("should not have multiple files"));
    assert!(first.to_string().contains("lib.vendor.js"));
    assert!(succeeded.is_empty());
    assert!(matches!(ctx.jobs()[0].state, JobState::Failed { .. }));
}

/// Test: an entrypoint without eligible files fails the job
#[tokio::test]
async fn test_missing_container_file_fails_the_job() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine().without_container_file("lib"));
    let ctx = SchedulingContext::new();

    let err = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no files found for shared lib chunk"));
}

/// Test: discovery without its artifact aborts before any sub-build
#[tokio::test]
async fn test_missing_discovery_artifact() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine().without_discovery_artifact());
    let ctx = SchedulingContext::new();

    let err = orchestrator(&engine, share_config())
        .run(&ctx, &host(&fs))
        .await
        .unwrap_err();

    assert!(matches!(err, ShareError::BuildFailed { .. }));
    assert!(err.to_string().contains("Can not get collect-share-entries.json"));
    assert_eq!(engine.handles().len(), 1);
    assert!(ctx.is_empty());
}

/// Test: one failing job does not stop its siblings
#[tokio::test]
async fn test_failure_keeps_succeeded_siblings() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(
        base_engine()
            .with_package("ui", "node_modules/ui/index.js", Some("3.1.0"))
            .failing("ui")
            .with_delay("lib", Duration::from_millis(30)),
    );
    let ctx = SchedulingContext::new();
    let config = share_config().with_shared("ui", treeshaken());

    let err = orchestrator(&engine, config)
        .run(&ctx, &host(&fs))
        .await
        .unwrap_err();

    let ShareError::OrchestrationFailed { first, succeeded } = err else {
        panic!("expected OrchestrationFailed");
    };
    assert!(first.to_string().contains("ui build failed"));
    assert!(first.to_string().contains("Can't resolve"));
    assert_eq!(succeeded.get("lib").map(<[_]>::len), Some(1));
    assert!(succeeded.get("ui").is_none());

    let jobs = ctx.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.state.is_terminal()));
    let lib = engine
        .handles()
        .into_iter()
        .find(|h| h.share_key().as_deref() == Some("lib"))
        .unwrap();
    assert_eq!(lib.run_count(), 1);
}

/// Test: shutdown closes every watching handle exactly once
#[tokio::test]
async fn test_shutdown_closes_watching_builds() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(
        base_engine()
            .with_package("ui", "node_modules/ui/index.js", Some("3.1.0"))
            .watching(),
    );
    let ctx = SchedulingContext::new();
    let config = share_config().with_shared("ui", treeshaken());

    orchestrator(&engine, config)
        .run(&ctx, &host(&fs))
        .await
        .unwrap();
    assert!(ctx.status().iter().all(|s| s.is_watching));

    assert_eq!(ctx.shutdown().await, 2);
    assert!(ctx.is_empty());
    assert_eq!(ctx.shutdown().await, 0);

    for handle in engine.handles() {
        assert_eq!(handle.close_count(), 1, "discovery and sub-builds close once");
        assert!(!handle.is_watching());
    }
}

/// Test: max_concurrency bounds the number of running sub-builds
#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let fs = Arc::new(MemoryFileSystem::new());
    let mut engine = MemoryEngine::new();
    let mut config = ShareConfig::new("host");
    for key in ["a", "b", "c", "d"] {
        engine = engine
            .with_package(key, &format!("node_modules/{key}/index.js"), Some("1.0.0"))
            .with_delay(key, Duration::from_millis(20));
        config = config.with_shared(key, treeshaken());
    }
    config.max_concurrency = Some(2);
    let engine = Arc::new(engine);
    let ctx = SchedulingContext::new();

    let manifest = orchestrator(&engine, config)
        .run(&ctx, &host(&fs))
        .await
        .unwrap();

    assert_eq!(manifest.entry_count(), 4);
    assert!(engine.peak_concurrency() <= 2);
    assert!(engine.peak_concurrency() >= 1);
}

/// Test: without a limit every sub-build runs at once
#[tokio::test]
async fn test_unbounded_fan_out() {
    let fs = Arc::new(MemoryFileSystem::new());
    let mut engine = MemoryEngine::new();
    let mut config = ShareConfig::new("host");
    for key in ["a", "b", "c"] {
        engine = engine
            .with_package(key, &format!("node_modules/{key}/index.js"), Some("1.0.0"))
            .with_delay(key, Duration::from_millis(50));
        config = config.with_shared(key, treeshaken());
    }
    let engine = Arc::new(engine);

    orchestrator(&engine, config)
        .run(&SchedulingContext::new(), &host(&fs))
        .await
        .unwrap();
    assert_eq!(engine.peak_concurrency(), 3);
}

/// Test: sub-build configuration is derived from the host
#[tokio::test]
async fn test_derived_sub_build_config() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine());
    let host = host(&fs);
    let mut config = share_config();
    config.additional_plugins = vec![PluginDescriptor::new("BannerPlugin", json!("/* lib */"))];

    orchestrator(&engine, config)
        .run(&SchedulingContext::new(), &host)
        .await
        .unwrap();

    let sub = engine
        .handles()
        .into_iter()
        .find(|h| h.share_key().is_some())
        .unwrap();
    let derived = sub.config();

    assert!(!derived.optimization.split_chunks);
    assert!(derived.output.clean);
    assert_eq!(derived.mode.as_deref(), Some("development"));
    assert!(derived.file_systems.shares_handles_with(&host.file_systems));
    assert_eq!(derived.context, host.context);

    let names: Vec<&str> = derived.plugins.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"DefinePlugin"));
    assert!(!names.contains(&"ModuleFederationPlugin"));
    assert!(names.contains(&"BannerPlugin"));
    assert!(names.contains(&SHARE_CONTAINER_PLUGIN));
    assert!(names.contains(&OPTIMIZE_REFERENCED_EXPORTS_PLUGIN));

    let modules = derived.plugin(VIRTUAL_MODULES_PLUGIN).unwrap();
    assert_eq!(
        modules.options[VIRTUAL_ENTRY],
        "import shared_0 from 'node_modules/lib/index.js';\n"
    );
    let exports = derived.plugin(OPTIMIZE_REFERENCED_EXPORTS_PLUGIN).unwrap();
    assert_eq!(exports.options["shared"][0]["shareKey"], "lib");
}

/// Test: keys whose container names collide are rejected before building
#[tokio::test]
async fn test_container_name_collision() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(
        MemoryEngine::new()
            .with_package("a-b", "node_modules/a-b/index.js", Some("1.0.0"))
            .with_package("a_b", "node_modules/a_b/index.js", Some("1.0.0")),
    );
    let config = ShareConfig::new("host")
        .with_shared("a-b", treeshaken())
        .with_shared("a_b", treeshaken());
    let ctx = SchedulingContext::new();

    let err = orchestrator(&engine, config)
        .run(&ctx, &host(&fs))
        .await
        .unwrap_err();

    assert!(matches!(err, ShareError::ContainerNameCollision { .. }));
    assert_eq!(engine.handles().len(), 1);
    assert!(ctx.is_empty());
}

/// Test: treeshake mode emits the manifest into the host output
#[tokio::test]
async fn test_build_host_emits_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(base_engine());
    let mut host = BuildConfig::new(dir.path());
    host.output.path = PathBuf::from("dist");
    host.file_systems = FileSystems::native();
    let mut config = share_config();
    config.treeshake = true;

    let (manifest, stats) = orchestrator(&engine, config)
        .build_host(&SchedulingContext::new(), host)
        .await
        .expect("host build failed");

    assert!(stats.emitted.contains(&INDEPENDENT_SHARE_BUILD_ASSETS.to_string()));
    let written = read_manifest(&dir.path().join("dist").join(INDEPENDENT_SHARE_BUILD_ASSETS))
        .expect("manifest readable");
    assert_eq!(written, manifest);
    assert!(dir
        .path()
        .join("dist/independent-packages/lib/1.0.0")
        .join(LIB_CONTAINER)
        .exists());
}

/// Test: without treeshake mode the host gets no manifest asset
#[tokio::test]
async fn test_build_host_without_treeshake_mode() {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine = Arc::new(base_engine());

    let (manifest, _) = orchestrator(&engine, share_config())
        .build_host(&SchedulingContext::new(), host(&fs))
        .await
        .unwrap();

    assert_eq!(manifest.entry_count(), 1);
    assert!(!fs.exists(&Path::new("/project/dist").join(INDEPENDENT_SHARE_BUILD_ASSETS)));
}

/// Test: invalid configurations fail before any build starts
#[test]
fn test_setup_errors() {
    assert!(matches!(
        setup_error(ShareConfig::new("host")),
        ShareError::MissingShared
    ));
    assert!(matches!(
        setup_error(ShareConfig::new("").with_shared("lib", treeshaken())),
        ShareError::MissingHostName
    ));

    let mut config = ShareConfig::new("host");
    config.shared.insert(
        "lib".to_string(),
        SharedEntry::List(vec![json!("lib")]),
    );
    let err = setup_error(config);
    assert!(err.to_string().contains("unexpected array"));
}
