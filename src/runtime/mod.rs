//! Sandbox runtime abstraction.
//!
//! A runtime opens one isolated execution environment per session and hands
//! back a [`RuntimeHandle`] that runs code, moves files in and out, and runs
//! shell commands. The session layer only talks to these traits; the
//! actual isolation lives in the backends.

mod docker;
#[cfg(test)]
pub(crate) mod mock;
mod process;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::Config;
use crate::language::Language;

/// Errors reported by runtime backends.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The run primitive exceeded its timeout.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// A path requested from the environment does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Output of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Figures captured separately from the process output.
    pub artifacts: Vec<VisualArtifact>,
}

/// An image captured by the runtime, carried as base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualArtifact {
    pub content_base64: String,
    /// File extension of the encoded image (e.g. "png").
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
}

/// Output of a shell command.
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// An execution environment as seen by the stale-resource sweep.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub running: bool,
}

/// Live binding to one execution environment. Owned by exactly one session.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Working directory path, as addressed by `copy_in`, `copy_out` and
    /// shell commands.
    fn workdir(&self) -> &str;

    /// Run `code` with `args`. Exceeding `timeout` yields
    /// [`RuntimeError::Timeout`].
    async fn run(
        &self,
        code: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionOutput, RuntimeError>;

    /// Copy a host file into the environment.
    async fn copy_in(&self, local: &Path, remote: &str) -> Result<(), RuntimeError>;

    /// Copy a file out of the environment. A missing source yields
    /// [`RuntimeError::NotFound`].
    async fn copy_out(&self, remote: &str, local: &Path) -> Result<(), RuntimeError>;

    /// Run a shell command in the working directory.
    async fn execute_shell(&self, command: &str) -> Result<ShellOutput, RuntimeError>;

    /// Tear the environment down.
    async fn close(&self) -> Result<(), RuntimeError>;
}

/// Factory for execution environments.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Create an environment for `session_id`, blocking until it is ready.
    async fn open(
        &self,
        session_id: &str,
        language: Language,
        workdir: &str,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError>;

    /// Environments this runtime manages, including ones left behind by
    /// earlier processes.
    async fn list_environments(&self) -> Result<Vec<EnvironmentInfo>, RuntimeError>;

    /// Forcefully remove one environment.
    async fn remove_environment(&self, id: &str) -> Result<(), RuntimeError>;

    /// Whether the startup sweep should filter this runtime's environments
    /// by image. Runtimes whose listing holds only their own environments
    /// return `false`.
    fn filters_by_image(&self) -> bool {
        true
    }
}

/// Constructor registered under a backend name.
pub type RuntimeFactory = fn(&Config) -> Result<Arc<dyn SandboxRuntime>>;

/// Backend name → constructor.
pub struct RuntimeRegistry {
    factories: BTreeMap<&'static str, RuntimeFactory>,
}

impl RuntimeRegistry {
    pub const fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `docker` and `process` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("docker", |config| {
            Ok(Arc::new(DockerRuntime::new(config)?) as Arc<dyn SandboxRuntime>)
        });
        registry.register("process", |config| {
            Ok(Arc::new(ProcessRuntime::new(config)) as Arc<dyn SandboxRuntime>)
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: RuntimeFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Build the backend registered as `name`.
    pub fn create(&self, name: &str, config: &Config) -> Result<Arc<dyn SandboxRuntime>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow::anyhow!("Unknown sandbox backend '{name}'. Available: {:?}", self.names())
        })?;
        factory(config)
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Parse `plot-<n>-<w>x<h>-<dpi>.<ext>` into an artifact around `content_base64`.
/// Unrecognised names still yield an artifact, without dimensions.
pub(crate) fn artifact_from_plot_file(file_name: &str, content_base64: String) -> VisualArtifact {
    let (stem, format) = file_name
        .rsplit_once('.')
        .unwrap_or((file_name, "png"));

    let mut artifact = VisualArtifact {
        content_base64,
        format: format.to_ascii_lowercase(),
        width: None,
        height: None,
        dpi: None,
    };

    let mut parts = stem.split('-');
    if let (Some("plot"), Some(_), Some(size), Some(dpi)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    {
        if let Some((w, h)) = size.split_once('x') {
            artifact.width = w.parse().ok();
            artifact.height = h.parse().ok();
        }
        artifact.dpi = dpi.parse().ok();
    }
    artifact
}

/// Decode `<name>|<base64>` lines emitted by a plot collection command.
pub(crate) fn parse_plot_listing(output: &str) -> Vec<VisualArtifact> {
    let mut names_and_payloads: Vec<(&str, &str)> = output
        .lines()
        .filter_map(|line| line.trim_end().split_once('|'))
        .filter(|(name, payload)| !name.is_empty() && !payload.is_empty())
        .collect();
    names_and_payloads.sort_by_key(|(name, _)| plot_index(name));
    names_and_payloads
        .into_iter()
        .map(|(name, payload)| artifact_from_plot_file(name, payload.to_string()))
        .collect()
}

fn plot_index(name: &str) -> u32 {
    name.split('-').nth(1).and_then(|n| n.parse().ok()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plot_names_carry_dimensions() {
        let artifact = artifact_from_plot_file("plot-0-640x480-100.png", "AAAA".into());
        assert_eq!(artifact.format, "png");
        assert_eq!(artifact.width, Some(640));
        assert_eq!(artifact.height, Some(480));
        assert_eq!(artifact.dpi, Some(100));
    }

    #[test]
    fn unknown_plot_names_have_no_dimensions() {
        let artifact = artifact_from_plot_file("figure.SVG", "AAAA".into());
        assert_eq!(artifact.format, "svg");
        assert_eq!(artifact.width, None);
        assert_eq!(artifact.dpi, None);
    }

    #[test]
    fn plot_listing_is_ordered_by_index() {
        let out = "plot-10-1x1-72.png|BBBB\nplot-2-1x1-72.png|AAAA\nbroken\n";
        let artifacts = parse_plot_listing(out);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].content_base64, "AAAA");
        assert_eq!(artifacts[1].content_base64, "BBBB");
    }

    #[test]
    fn registry_lists_builtin_backends() {
        let registry = RuntimeRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["docker", "process"]);
    }

    #[test]
    fn registry_rejects_unknown_backend() {
        let registry = RuntimeRegistry::with_defaults();
        let err = registry.create("firecracker", &Config::default()).err().unwrap();
        assert!(err.to_string().contains("Unknown sandbox backend 'firecracker'"));
    }

    #[test]
    fn registry_accepts_custom_factories() {
        let mut registry = RuntimeRegistry::empty();
        registry.register("process", |config| {
            Ok(Arc::new(ProcessRuntime::new(config)) as Arc<dyn SandboxRuntime>)
        });
        let runtime = registry.create("process", &Config::default()).unwrap();
        assert_eq!(runtime.name(), "process");
    }
}
