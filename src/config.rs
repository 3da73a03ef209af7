//! Process configuration.
//!
//! A base configuration can be passed as JSON in the `CI_CONFIG` environment
//! variable; individual `CI_<FIELD>` variables then override scalar fields.
//! Everything has a default, so an empty environment yields a usable config.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::language::Language;

/// Top-level configuration for the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the sandbox runtime backend ("docker" or "process").
    pub backend: String,

    /// Root directory for stored files (one subdirectory per session).
    pub file_storage_path: PathBuf,

    /// Working directory inside each sandbox.
    pub sandbox_workdir: String,

    /// Timeout applied when a run does not request one.
    pub default_run_timeout_seconds: u64,

    /// Upper bound for any run's timeout.
    pub max_run_timeout_seconds: u64,

    /// Sessions older than this are removed by the cleanup task.
    pub session_ttl_minutes: u64,

    /// Interval between cleanup sweeps.
    pub cleanup_interval_seconds: u64,

    /// Languages accepted by the proxy.
    pub supported_languages: Vec<Language>,

    pub max_file_size_bytes: u64,
    pub max_files_per_session: usize,
    pub max_files_per_run: usize,

    /// Image name prefixes identifying sandbox environments for the
    /// startup sweep. An empty list matches every managed environment.
    pub sandbox_image_prefixes: Vec<String>,

    /// `key=value` label attached to (and used to find) managed environments.
    pub sandbox_label: String,

    /// Remove stale environments left by earlier processes on startup.
    pub sandbox_sweep_on_startup: bool,

    /// Files in the working directory whose names match this pattern are
    /// treated as engine scratch files and never exported.
    pub scratch_file_pattern: String,

    /// Capture matplotlib figures from Python runs.
    pub enable_plotting: bool,

    pub docker: DockerConfig,
    pub process: ProcessConfig,
}

/// Settings for the Docker CLI runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Container CLI binary.
    pub cli: String,

    /// Memory limit per container in megabytes.
    pub memory_mb: u64,

    /// Network mode passed to `--network` (Docker default when unset).
    pub network: Option<String>,

    /// Container name prefix; names are `<prefix>-<session>-<suffix>`.
    pub container_prefix: String,

    /// Image per language.
    pub images: HashMap<Language, String>,
}

/// Settings for the host-process runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Directory holding one scratch directory per session.
    pub root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "docker".into(),
            file_storage_path: PathBuf::from("/data/code-interpreter"),
            sandbox_workdir: "/sandbox".into(),
            default_run_timeout_seconds: 30,
            max_run_timeout_seconds: 30,
            session_ttl_minutes: 60,
            cleanup_interval_seconds: 60,
            supported_languages: Language::ALL.to_vec(),
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files_per_session: 100,
            max_files_per_run: 10,
            sandbox_image_prefixes: vec!["ghcr.io/vndee/sandbox-".into()],
            sandbox_label: "code-interpreter-proxy.managed=true".into(),
            sandbox_sweep_on_startup: true,
            scratch_file_pattern: r"^[0-9a-f]{32}\.\w+".into(),
            enable_plotting: true,
            docker: DockerConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        let images = [
            (Language::Python, "ghcr.io/vndee/sandbox-python-311-bullseye"),
            (Language::JavaScript, "ghcr.io/vndee/sandbox-node-22-bullseye"),
            (Language::Java, "ghcr.io/vndee/sandbox-java-11-bullseye"),
            (Language::Cpp, "ghcr.io/vndee/sandbox-cpp-11-bullseye"),
            (Language::Go, "ghcr.io/vndee/sandbox-go-123-bullseye"),
            (Language::R, "ghcr.io/vndee/sandbox-r-451-bullseye"),
        ]
        .into_iter()
        .map(|(lang, image)| (lang, image.to_string()))
        .collect();

        Self {
            cli: "docker".into(),
            memory_mb: 512,
            network: None,
            container_prefix: "ci-sandbox".into(),
            images,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("code-interpreter-proxy"),
        }
    }
}

impl Config {
    /// Load configuration from `CI_CONFIG` and `CI_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CI_CONFIG") {
            Ok(json) => serde_json::from_str(&json).context("Failed to parse CI_CONFIG")?,
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Create a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply `CI_<FIELD>` overrides obtained through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CI_BACKEND") {
            self.backend = v;
        }
        if let Some(v) = lookup("CI_FILE_STORAGE_PATH") {
            self.file_storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CI_SANDBOX_WORKDIR") {
            self.sandbox_workdir = v;
        }
        if let Some(v) = lookup("CI_SANDBOX_LABEL") {
            self.sandbox_label = v;
        }
        if let Some(v) = lookup("CI_SCRATCH_FILE_PATTERN") {
            self.scratch_file_pattern = v;
        }
        if let Some(v) = lookup("CI_SANDBOX_IMAGE_PREFIXES") {
            self.sandbox_image_prefixes = split_list(&v).map(String::from).collect();
        }
        if let Some(v) = lookup("CI_SUPPORTED_LANGUAGES") {
            self.supported_languages = split_list(&v)
                .map(str::parse)
                .collect::<Result<_, _>>()
                .context("Invalid CI_SUPPORTED_LANGUAGES")?;
        }

        override_parsed(&lookup, "CI_DEFAULT_RUN_TIMEOUT_SECONDS", &mut self.default_run_timeout_seconds)?;
        override_parsed(&lookup, "CI_MAX_RUN_TIMEOUT_SECONDS", &mut self.max_run_timeout_seconds)?;
        override_parsed(&lookup, "CI_SESSION_TTL_MINUTES", &mut self.session_ttl_minutes)?;
        override_parsed(&lookup, "CI_CLEANUP_INTERVAL_SECONDS", &mut self.cleanup_interval_seconds)?;
        override_parsed(&lookup, "CI_MAX_FILE_SIZE_BYTES", &mut self.max_file_size_bytes)?;
        override_parsed(&lookup, "CI_MAX_FILES_PER_SESSION", &mut self.max_files_per_session)?;
        override_parsed(&lookup, "CI_MAX_FILES_PER_RUN", &mut self.max_files_per_run)?;
        override_parsed(&lookup, "CI_SANDBOX_SWEEP_ON_STARTUP", &mut self.sandbox_sweep_on_startup)?;
        override_parsed(&lookup, "CI_ENABLE_PLOTTING", &mut self.enable_plotting)?;
        Ok(())
    }

    /// Reject configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_run_timeout_seconds > 0,
            "max_run_timeout_seconds must be positive"
        );
        anyhow::ensure!(
            self.default_run_timeout_seconds > 0,
            "default_run_timeout_seconds must be positive"
        );
        anyhow::ensure!(self.session_ttl_minutes > 0, "session_ttl_minutes must be positive");
        anyhow::ensure!(
            self.cleanup_interval_seconds > 0,
            "cleanup_interval_seconds must be positive"
        );
        anyhow::ensure!(
            !self.supported_languages.is_empty(),
            "supported_languages must not be empty"
        );
        anyhow::ensure!(
            self.sandbox_workdir.starts_with('/'),
            "sandbox_workdir must be an absolute path"
        );
        self.scratch_pattern()?;
        Ok(())
    }

    /// Compiled scratch-file pattern.
    pub fn scratch_pattern(&self) -> Result<Regex> {
        Regex::new(&self.scratch_file_pattern)
            .with_context(|| format!("Invalid scratch_file_pattern '{}'", self.scratch_file_pattern))
    }

    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }

    pub fn is_supported(&self, language: Language) -> bool {
        self.supported_languages.contains(&language)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key} ('{raw}'): {e}"))?;
        debug!(key, value = %raw, "Applied config override");
    }
    Ok(())
}
