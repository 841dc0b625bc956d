//! The build engine seam.
//!
//! Module resolution, code generation and chunking belong to the engine.
//! This crate only describes builds ([`BuildConfig`]), hands the engine
//! declarative plugin options ([`PluginDescriptor`]), and observes each
//! compilation through [`ProcessAssetsHook`]s at fixed lifecycle stages.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, ShareResult};
use crate::fs::FileSystems;

/// Declarative plugin handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub options: Value,
    /// Safe to copy into an isolated sub-build. Plugins that only make sense
    /// once per host build (federation, sharing, global metadata) say `false`.
    #[serde(default = "default_inheritable")]
    pub inheritable: bool,
}

fn default_inheritable() -> bool {
    true
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
            inheritable: true,
        }
    }

    /// A plugin that must not be copied into sub-builds.
    pub fn host_only(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
            inheritable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    pub path: PathBuf,
    /// Remove the output directory before writing.
    pub clean: bool,
    pub public_path: String,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dist"),
            clean: false,
            public_path: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Optimization {
    pub split_chunks: bool,
    /// Engine-specific optimization settings passed through untouched.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Optimization {
    fn default() -> Self {
        Self {
            split_chunks: true,
            extra: BTreeMap::new(),
        }
    }
}

/// Complete description of one compilation.
///
/// Hooks and file system handles are runtime-only; a deserialized config
/// starts with no hooks and the native file system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub mode: Option<String>,
    /// Directory requests and relative output paths resolve against.
    pub context: PathBuf,
    /// Entry name to module request.
    #[serde(default)]
    pub entry: BTreeMap<String, String>,
    #[serde(default)]
    pub output: OutputOptions,
    #[serde(default)]
    pub optimization: Optimization,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    #[serde(skip)]
    pub hooks: Vec<Arc<dyn ProcessAssetsHook>>,
    #[serde(skip)]
    pub file_systems: FileSystems,
}

impl BuildConfig {
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            mode: None,
            context: context.into(),
            entry: BTreeMap::new(),
            output: OutputOptions::default(),
            optimization: Optimization::default(),
            plugins: Vec::new(),
            hooks: Vec::new(),
            file_systems: FileSystems::default(),
        }
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

/// Lifecycle points inside the asset-processing phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStage {
    Additional,
    OptimizeTransfer,
    /// Every asset exists; nothing has been written yet.
    Summarize,
    Report,
}

/// Observer/mutator invoked by the engine while a compilation's assets are
/// processed. Module resolution is final at this point and no output file
/// has been written.
pub trait ProcessAssetsHook: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn stage(&self) -> AssetStage;
    fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()>;
}

/// Assets and entrypoints of a compilation, before files are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compilation {
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    /// Entry name to the files its chunk emitted.
    #[serde(default)]
    pub entrypoints: BTreeMap<String, Vec<String>>,
}

impl Compilation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_asset(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.assets.insert(name.into(), source.into());
    }

    pub fn get_asset(&self, name: &str) -> Option<&str> {
        self.assets.get(name).map(String::as_str)
    }

    pub fn add_entrypoint_file(&mut self, entry: impl Into<String>, file: impl Into<String>) {
        self.entrypoints.entry(entry.into()).or_default().push(file.into());
    }

    pub fn entrypoint_files(&self, entry: &str) -> Option<&[String]> {
        self.entrypoints.get(entry).map(Vec::as_slice)
    }
}

/// Summary returned by a finished build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub output_path: PathBuf,
    pub emitted: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BuildStats {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A runnable compilation created by a [`BuildEngine`].
#[async_trait]
pub trait BuildHandle: Send + Sync {
    /// Run the compilation once.
    async fn run(&self) -> Result<BuildStats, EngineError>;

    fn is_running(&self) -> bool;

    /// Whether the handle is in watch mode and must be closed.
    fn is_watching(&self) -> bool;

    /// Stop watching.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Factory for build handles.
pub trait BuildEngine: Send + Sync {
    fn create(&self, config: BuildConfig) -> ShareResult<Arc<dyn BuildHandle>>;
}

/// Run `hooks` in stage order over `compilation`, then write its assets
/// beneath `config.output.path` through the output file system.
///
/// Engines call this once code generation has produced the compilation.
pub fn finish_compilation(
    config: &BuildConfig,
    mut compilation: Compilation,
) -> Result<BuildStats, EngineError> {
    let mut hooks: Vec<&Arc<dyn ProcessAssetsHook>> = config.hooks.iter().collect();
    hooks.sort_by_key(|hook| hook.stage());
    for hook in hooks {
        debug!(hook = hook.name(), stage = ?hook.stage(), "process assets");
        hook.process_assets(&mut compilation)?;
    }

    let output = resolve_output_path(config);
    let fs = &config.file_systems.output;
    if config.output.clean {
        fs.remove_dir_all(&output)?;
    }
    fs.create_dir_all(&output)?;

    let mut emitted = Vec::with_capacity(compilation.assets.len());
    for (name, source) in &compilation.assets {
        fs.write(&output.join(name), source.as_bytes())?;
        emitted.push(name.clone());
    }

    Ok(BuildStats {
        output_path: output,
        emitted,
        warnings: Vec::new(),
        errors: Vec::new(),
    })
}

/// Absolute output directory of a build.
pub fn resolve_output_path(config: &BuildConfig) -> PathBuf {
    join_context(&config.context, &config.output.path)
}

fn join_context(context: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        context.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShareError;
    use crate::fs::{FileSystem, MemoryFileSystem};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        stage: AssetStage,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl ProcessAssetsHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> AssetStage {
            self.stage
        }

        fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(ShareError::NoFilesFound {
                    share_key: self.name.to_string(),
                });
            }
            compilation.emit_asset(format!("{}.txt", self.name), self.name);
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        stage: AssetStage,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn ProcessAssetsHook> {
        Arc::new(Recorder {
            name,
            stage,
            log: log.clone(),
            fail: false,
        })
    }

    fn config_with(
        hooks: Vec<Arc<dyn ProcessAssetsHook>>,
        fs: Arc<MemoryFileSystem>,
    ) -> BuildConfig {
        let mut config = BuildConfig::new("/project");
        config.output.path = PathBuf::from("dist");
        config.hooks = hooks;
        config.file_systems = FileSystems::uniform(fs);
        config
    }

    #[test]
    fn test_hooks_run_in_stage_order_and_assets_are_written() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fs = Arc::new(MemoryFileSystem::new());
        let hooks: Vec<Arc<dyn ProcessAssetsHook>> = vec![
            recorder("report", AssetStage::Report, &log),
            recorder("additional", AssetStage::Additional, &log),
            recorder("summarize", AssetStage::Summarize, &log),
        ];
        let config = config_with(hooks, fs.clone());

        let stats = finish_compilation(&config, Compilation::new()).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["additional", "summarize", "report"]);
        assert_eq!(stats.output_path, PathBuf::from("/project/dist"));
        assert_eq!(stats.emitted.len(), 3);
        assert!(fs.exists(Path::new("/project/dist/summarize.txt")));
    }

    #[test]
    fn test_failing_hook_stops_before_write() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fs = Arc::new(MemoryFileSystem::new());
        let hooks: Vec<Arc<dyn ProcessAssetsHook>> = vec![Arc::new(Recorder {
            name: "broken",
            stage: AssetStage::Summarize,
            log,
            fail: true,
        })];
        let config = config_with(hooks, fs.clone());

        let mut compilation = Compilation::new();
        compilation.emit_asset("main.js", "x");
        let err = finish_compilation(&config, compilation).unwrap_err();

        assert!(err.to_string().contains("no files found"));
        assert!(fs.paths().is_empty());
    }

    #[test]
    fn test_clean_output_removes_previous_files() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(Path::new("/project/dist/stale.js"), b"old").unwrap();
        let mut config = config_with(Vec::new(), fs.clone());
        config.output.clean = true;

        finish_compilation(&config, Compilation::new()).unwrap();
        assert!(!fs.exists(Path::new("/project/dist/stale.js")));
    }

    #[test]
    fn test_build_config_from_json_fills_defaults() {
        let config: BuildConfig = serde_json::from_str(
            r#"{"context":"/app","output":{"path":"build"},"plugins":[{"name":"DefinePlugin"}]}"#,
        )
        .unwrap();
        assert_eq!(config.output.public_path, "auto");
        assert!(config.optimization.split_chunks);
        assert!(config.hooks.is_empty());
        assert_eq!(resolve_output_path(&config), PathBuf::from("/app/build"));
    }

    #[test]
    fn test_plugin_descriptor_defaults_to_inheritable() {
        let plugin: PluginDescriptor =
            serde_json::from_str(r#"{"name":"DefinePlugin","options":{"X":"1"}}"#).unwrap();
        assert!(plugin.inheritable);
        assert!(!PluginDescriptor::host_only("ModuleFederationPlugin", Value::Null).inheritable);
    }
}
