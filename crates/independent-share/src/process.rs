//! External bundler process as a build engine.
//!
//! [`CommandEngine`] spawns the configured program once per build, writes
//! the serialized [`BuildConfig`] to its stdin and reads a [`BuildReport`]
//! from its stdout. Process-assets hooks then run in-process and the assets
//! are written through the build's output file system.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::engine::{
    finish_compilation, resolve_output_path, BuildConfig, BuildEngine, BuildHandle, BuildStats,
    Compilation,
};
use crate::error::{EngineError, ShareResult};

/// What the bundler prints on stdout when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    #[serde(flatten)]
    pub compilation: Compilation,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Engine backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kill builds that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl BuildEngine for CommandEngine {
    fn create(&self, config: BuildConfig) -> ShareResult<Arc<dyn BuildHandle>> {
        Ok(Arc::new(CommandBuildHandle {
            engine: self.clone(),
            config,
            running: AtomicBool::new(false),
        }))
    }
}

/// One build run through [`CommandEngine`]. Never watches.
#[derive(Debug)]
pub struct CommandBuildHandle {
    engine: CommandEngine,
    config: BuildConfig,
    running: AtomicBool,
}

impl CommandBuildHandle {
    async fn spawn_and_report(&self) -> Result<BuildReport, EngineError> {
        let input = serde_json::to_vec(&self.config)
            .map_err(|e| EngineError::Engine(format!("cannot serialize build config: {e}")))?;

        let mut child = Command::new(&self.engine.program)
            .args(&self.engine.args)
            .current_dir(&self.config.context)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Engine(format!("cannot spawn {}: {e}", self.engine.program))
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A bundler that ignores its input may exit before reading it.
            match stdin.write_all(&input).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        // Output pipes drain while the config is still being written, so a
        // bundler that logs before reading its input cannot stall the build.
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let output = match self.engine.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                EngineError::Engine(format!(
                    "{} timed out after {} ms",
                    self.engine.program,
                    limit.as_millis()
                ))
            })??,
            None => exchange.await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EngineError::Engine(format!(
                "{} exited with {}: {stderr}",
                self.engine.program,
                output.status.code().unwrap_or(-1)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Engine(format!("malformed build report: {e}")))
    }
}

#[async_trait]
impl BuildHandle for CommandBuildHandle {
    async fn run(&self) -> Result<BuildStats, EngineError> {
        self.running.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let report = self.spawn_and_report().await;
        self.running.store(false, Ordering::SeqCst);

        let report = report?;
        debug!(
            program = %self.engine.program,
            assets = report.compilation.assets.len(),
            errors = report.errors.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "bundler finished"
        );

        if !report.errors.is_empty() {
            return Ok(BuildStats {
                output_path: resolve_output_path(&self.config),
                emitted: Vec::new(),
                warnings: report.warnings,
                errors: report.errors,
            });
        }

        let mut stats = finish_compilation(&self.config, report.compilation)?;
        stats.warnings = report.warnings;
        Ok(stats)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_watching(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
