//! Sandbox sessions.
//!
//! A session binds one caller-chosen id and one language to at most one
//! runtime handle. The handle is opened lazily on the first run and closed
//! exactly once. Every operation that touches the handle or the working
//! directory holds the session's state lock, so runs against one session
//! never interleave with each other or with `close`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::language::{Language, PLOT_SETUP_MESSAGE};
use crate::runtime::{RuntimeError, RuntimeHandle, SandboxRuntime, VisualArtifact};
use crate::snapshot::{changed_files, listing_command, parse_listing, DirSnapshot, ScratchFilter};
use crate::storage::{FileStore, StoredFile};

/// Parsed session settings with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions older than this are expired.
    pub ttl: Duration,

    /// Timeout used when a run does not request one.
    pub default_run_timeout: Duration,

    /// Upper bound for every run.
    pub max_run_timeout: Duration,

    /// Working directory inside the sandbox.
    pub workdir: String,

    pub scratch: ScratchFilter,

    /// Interval between expiry sweeps.
    pub cleanup_interval: Duration,

    pub max_files_per_run: usize,

    pub supported_languages: Vec<Language>,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            ttl: config.session_ttl(),
            default_run_timeout: Duration::from_secs(config.default_run_timeout_seconds),
            max_run_timeout: Duration::from_secs(config.max_run_timeout_seconds),
            workdir: config.sandbox_workdir.clone(),
            scratch: ScratchFilter::new(config.scratch_pattern()?),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            max_files_per_run: config.max_files_per_run,
            supported_languages: config.supported_languages.clone(),
        })
    }

    /// `min(requested or default, maximum)`.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_run_timeout)
            .min(self.max_run_timeout)
    }
}

/// Reference to a stored file used as run input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub id: String,
    /// Owning session; the run's own session when absent.
    pub session_id: Option<String>,
}

/// One code execution request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    pub language: Language,
    pub code: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub files: Vec<FileRef>,
}

impl RunRequest {
    pub fn new(session_id: impl Into<String>, language: Language, code: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            language,
            code: code.into(),
            args: Vec::new(),
            timeout: None,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunStats {
    pub cpu_time_seconds: f64,
    pub wall_time_seconds: f64,
    pub memory_bytes: u64,
}

/// A stored file produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
}

impl From<StoredFile> for RunFile {
    fn from(file: StoredFile) -> Self {
        Self {
            id: file.id,
            name: file.filename,
            size: file.size,
            mime_type: file.mime_type,
            created_at: file.created_at,
            width: None,
            height: None,
            dpi: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub stats: RunStats,
    pub files: Vec<RunFile>,
}

/// Listing entry for an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub age_minutes: f64,
    pub expired: bool,
}

pub(crate) struct SessionState {
    handle: Option<Box<dyn RuntimeHandle>>,
    closed: bool,
}

/// A sandbox session bound to one id and one language.
pub struct SandboxSession {
    id: String,
    language: Language,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    state: Arc<Mutex<SessionState>>,
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<FileStore>,
    config: Arc<SessionConfig>,
}

impl SandboxSession {
    pub(crate) fn new(
        id: impl Into<String>,
        language: Language,
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<FileStore>,
        config: Arc<SessionConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            language,
            created_at: now,
            last_activity: Mutex::new(now),
            state: Arc::new(Mutex::new(SessionState {
                handle: None,
                closed: false,
            })),
            runtime,
            store,
            config,
        }
    }

    /// Backdate the session, for expiry tests.
    #[cfg(test)]
    pub(crate) fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn language(&self) -> Language {
        self.language
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().await
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Utc::now();
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// True once the session has lived longer than the TTL.
    pub fn is_expired(&self) -> bool {
        self.age() > self.config.ttl
    }

    pub async fn info(&self) -> SessionInfo {
        let age = self.age();
        SessionInfo {
            id: self.id.clone(),
            language: self.language,
            created_at: self.created_at,
            last_activity: self.last_activity().await,
            age_minutes: age.as_secs_f64() / 60.0,
            expired: age > self.config.ttl,
        }
    }

    /// Hold the session lock without running anything. Used to keep callers
    /// out while a replaced session's files are cleaned up. The guard is owned
    /// so it can be handed to a teardown task.
    pub(crate) async fn lock_state(&self) -> OwnedMutexGuard<SessionState> {
        Arc::clone(&self.state).lock_owned().await
    }

    /// Create the runtime handle if there is none yet.
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state).await
    }

    async fn open_locked(&self, state: &mut SessionState) -> Result<()> {
        if state.closed {
            return Err(ProxyError::Closed(self.id.clone()));
        }
        if state.handle.is_none() {
            let handle = self
                .runtime
                .open(&self.id, self.language, &self.config.workdir)
                .await
                .map_err(|e| execution_error(e, "Failed to open sandbox"))?;
            info!(session = %self.id, language = %self.language, runtime = self.runtime.name(), "Sandbox session opened");
            state.handle = Some(handle);
        }
        Ok(())
    }

    /// Shut the runtime handle down. Idempotent; waits for an in-flight run.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let Some(handle) = state.handle.take() else {
            debug!(session = %self.id, "Session already closed or never opened");
            return Ok(());
        };
        handle
            .close()
            .await
            .map_err(|e| execution_error(e, "Failed to close sandbox"))?;
        info!(session = %self.id, "Sandbox session closed");
        Ok(())
    }

    /// Execute `request` with `inputs` staged into the working directory.
    ///
    /// A runtime timeout is returned as [`ProxyError::Timeout`] and leaves the
    /// session usable. Any other error means the handle may be broken.
    #[instrument(skip_all, fields(session = %self.id, language = %self.language))]
    pub async fn run(&self, request: &RunRequest, inputs: &[StoredFile]) -> Result<RunResult> {
        let mut state = self.state.lock().await;
        self.touch().await;
        let timeout = self.config.effective_timeout(request.timeout);

        self.open_locked(&mut state).await?;
        let handle = state
            .handle
            .as_deref()
            .ok_or_else(|| ProxyError::Closed(self.id.clone()))?;

        for file in inputs {
            let remote = remote_path(handle, &file.filename);
            handle
                .copy_in(&file.path, &remote)
                .await
                .map_err(|e| execution_error(e, "Failed to copy input file"))?;
            debug!(file = %file.id, remote = %remote, "Staged input file");
        }

        let before = self.snapshot(handle).await?;

        let started = Instant::now();
        let output = match handle.run(&request.code, &request.args, timeout).await {
            Ok(output) => output,
            Err(RuntimeError::Timeout(_)) => {
                warn!(timeout = timeout.as_secs(), "Execution timed out");
                return Err(ProxyError::Timeout(timeout));
            }
            Err(e) => return Err(execution_error(e, "Execution failed")),
        };
        let wall_time = started.elapsed().as_secs_f64();

        let after = self.snapshot(handle).await?;
        let mut files = self.export_changed(handle, &before, &after).await?;
        if !output.artifacts.is_empty() {
            info!(plots = output.artifacts.len(), "Captured plots");
            files.extend(self.persist_artifacts(&output.artifacts).await);
        }

        let result = RunResult {
            stdout: finalize_stdout(&output.stdout, output.artifacts.len()),
            stderr: output.stderr,
            exit_code: output.exit_code,
            stats: RunStats {
                cpu_time_seconds: wall_time,
                wall_time_seconds: wall_time,
                memory_bytes: 0,
            },
            files,
        };
        debug!(exit_code = result.exit_code, files = result.files.len(), "Run completed");
        Ok(result)
    }

    async fn snapshot(&self, handle: &dyn RuntimeHandle) -> Result<DirSnapshot> {
        let output = handle
            .execute_shell(&listing_command(handle.workdir()))
            .await
            .map_err(|e| execution_error(e, "Failed to list working directory"))?;
        if output.exit_code != 0 {
            warn!(session = %self.id, exit_code = output.exit_code, "Working directory listing failed");
            return Ok(DirSnapshot::new());
        }
        Ok(parse_listing(&output.stdout))
    }

    /// Copy every new or modified working-directory file into the store.
    async fn export_changed(
        &self,
        handle: &dyn RuntimeHandle,
        before: &DirSnapshot,
        after: &DirSnapshot,
    ) -> Result<Vec<RunFile>> {
        let mut exported = Vec::new();
        for name in changed_files(before, after, &self.config.scratch) {
            let (file_id, path) = match self.store.allocate_runtime_file(&self.id, &name).await {
                Ok(slot) => slot,
                Err(ProxyError::Validation(reason)) => {
                    warn!(session = %self.id, file = %name, %reason, "Skipping output file");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match handle.copy_out(&remote_path(handle, &name), &path).await {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => {
                    debug!(session = %self.id, file = %name, "Output file vanished before export");
                    self.store.release_slot(&path).await;
                    continue;
                }
                Err(e) => {
                    self.store.release_slot(&path).await;
                    return Err(execution_error(e, "Failed to export output file"));
                }
            }

            let stored = self.store.metadata(&self.id, &file_id, &path).await?;
            debug!(session = %self.id, file = %file_id, name = %name, size = stored.size, "Exported output file");
            exported.push(stored.into());
        }
        Ok(exported)
    }

    /// Persist captured plots. Failures are logged and skipped.
    async fn persist_artifacts(&self, artifacts: &[VisualArtifact]) -> Vec<RunFile> {
        let mut persisted = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            match self.persist_artifact(artifact).await {
                Ok(file) => persisted.push(file),
                Err(e) => {
                    warn!(session = %self.id, error = %e, "Failed to persist captured plot");
                }
            }
        }
        persisted
    }

    async fn persist_artifact(&self, artifact: &VisualArtifact) -> Result<RunFile> {
        let content = base64::engine::general_purpose::STANDARD
            .decode(artifact.content_base64.trim())
            .context("Invalid base64 plot payload")
            .map_err(ProxyError::Execution)?;

        let filename = format!("{}.{}", Uuid::new_v4().simple(), artifact.format);
        let (file_id, path) = self.store.allocate_runtime_file(&self.id, &filename).await?;
        if let Err(e) = tokio::fs::write(&path, &content).await {
            self.store.release_slot(&path).await;
            return Err(e.into());
        }

        let stored = self.store.metadata(&self.id, &file_id, &path).await?;
        Ok(RunFile {
            width: artifact.width,
            height: artifact.height,
            dpi: artifact.dpi,
            ..stored.into()
        })
    }
}

fn remote_path(handle: &dyn RuntimeHandle, name: &str) -> String {
    format!("{}/{name}", handle.workdir().trim_end_matches('/'))
}

fn execution_error(error: RuntimeError, context: &'static str) -> ProxyError {
    match error {
        RuntimeError::Timeout(timeout) => ProxyError::Timeout(timeout),
        RuntimeError::NotFound(path) => {
            ProxyError::Execution(anyhow::anyhow!("{path} not found").context(context))
        }
        RuntimeError::Other(e) => ProxyError::Execution(e.context(context)),
    }
}

/// Drop the plot setup marker; describe plots when nothing else was printed.
fn finalize_stdout(stdout: &str, plot_count: usize) -> String {
    let stdout = if stdout.contains(PLOT_SETUP_MESSAGE) {
        stdout.replace(PLOT_SETUP_MESSAGE, "").trim_start_matches('\n').to_string()
    } else {
        stdout.to_string()
    };

    if stdout.trim().is_empty() && plot_count > 0 {
        let noun = if plot_count == 1 { "plot" } else { "plots" };
        return format!("Generated {plot_count} {noun}");
    }
    stdout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::storage::StorageLimits;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<MockRuntime>,
        store: Arc<FileStore>,
        config: Arc<SessionConfig>,
    }

    impl Fixture {
        async fn new(max_files: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let store = FileStore::open(
                dir.path(),
                StorageLimits {
                    max_file_size_bytes: 1024 * 1024,
                    max_files_per_session: max_files,
                },
            )
            .await
            .unwrap();
            Self {
                _dir: dir,
                runtime: Arc::new(MockRuntime::new()),
                store: Arc::new(store),
                config: Arc::new(SessionConfig::from_config(&Config::default()).unwrap()),
            }
        }

        fn session(&self, id: &str) -> SandboxSession {
            SandboxSession::new(
                id,
                Language::Python,
                Arc::clone(&self.runtime) as Arc<dyn SandboxRuntime>,
                Arc::clone(&self.store),
                Arc::clone(&self.config),
            )
        }
    }

    fn request(code: &str) -> RunRequest {
        RunRequest::new("s1", Language::Python, code)
    }

    #[test]
    fn effective_timeout_is_capped() {
        let config = SessionConfig {
            max_run_timeout: Duration::from_secs(30),
            default_run_timeout: Duration::from_secs(10),
            ..SessionConfig::from_config(&Config::default()).unwrap()
        };
        assert_eq!(config.effective_timeout(None), Duration::from_secs(10));
        assert_eq!(config.effective_timeout(Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(config.effective_timeout(Some(Duration::from_secs(300))), Duration::from_secs(30));
    }

    #[test]
    fn stdout_marker_is_stripped() {
        let out = format!("{PLOT_SETUP_MESSAGE}\n\nhello\n");
        assert_eq!(finalize_stdout(&out, 0), "hello\n");
        assert_eq!(finalize_stdout("plain\n", 0), "plain\n");
    }

    #[test]
    fn empty_stdout_with_plots_gets_placeholder() {
        assert_eq!(finalize_stdout("", 1), "Generated 1 plot");
        assert_eq!(finalize_stdout(&format!("{PLOT_SETUP_MESSAGE}\n"), 3), "Generated 3 plots");
        assert_eq!(finalize_stdout("  \n", 0), "  \n");
    }

    #[tokio::test]
    async fn open_and_close_are_idempotent() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        session.open().await.unwrap();
        session.open().await.unwrap();
        assert_eq!(fx.runtime.state.opens(), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(fx.runtime.state.closes(), 1);

        assert!(matches!(session.open().await, Err(ProxyError::Closed(_))));
    }

    #[tokio::test]
    async fn run_exports_new_files_once() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let result = session.run(&request("write report.csv a,b,c\nprint done"), &[]).await.unwrap();
        assert_eq!(result.stdout, "done\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "report.csv");
        assert_eq!(result.files[0].size, 5);
        assert_eq!(result.files[0].mime_type, "text/csv");

        let stored = fx.store.get_file("s1", &result.files[0].id).await.unwrap();
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), b"a,b,c");

        // untouched files are not exported again
        let again = session.run(&request("print nothing new"), &[]).await.unwrap();
        assert!(again.files.is_empty());
    }

    #[tokio::test]
    async fn rewritten_files_are_exported_again() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        session.run(&request("write out.txt one"), &[]).await.unwrap();
        let second = session.run(&request("write out.txt one"), &[]).await.unwrap();
        assert_eq!(second.files.len(), 1);
        assert_eq!(fx.store.list_files("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn scratch_files_are_not_exported() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let result = session
            .run(&request("write 0123456789abcdef0123456789abcdef.tmp x"), &[])
            .await
            .unwrap();
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn input_files_are_staged_and_not_reexported() {
        let fx = Fixture::new(10).await;
        let input = fx.store.save_file("s1", "data.csv", b"1,2").await.unwrap();
        let session = fx.session("s1");

        let result = session.run(&request("print ok"), &[input]).await.unwrap();
        assert!(result.files.is_empty());
        assert_eq!(fx.store.list_files("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn vanished_files_are_skipped() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let result = session.run(&request("vanish temp.txt\nwrite kept.txt k"), &[]).await.unwrap();
        let names: Vec<_> = result.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["kept.txt"]);
        assert_eq!(fx.store.list_files("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn outputs_beyond_capacity_are_skipped() {
        let fx = Fixture::new(2).await;
        let session = fx.session("s1");

        let result = session
            .run(&request("write a.txt 1\nwrite b.txt 2\nwrite c.txt 3"), &[])
            .await
            .unwrap();
        assert_eq!(result.files.len(), 2);
        assert_eq!(fx.store.list_files("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn plots_are_persisted_with_dimensions() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let result = session.run(&request("marker\nplot 640 480\nbadplot"), &[]).await.unwrap();
        assert_eq!(result.stdout, "Generated 2 plots");
        assert_eq!(result.files.len(), 1);

        let plot = &result.files[0];
        assert_eq!(plot.mime_type, "image/png");
        assert_eq!(plot.width, Some(640));
        assert_eq!(plot.height, Some(480));
        assert_eq!(plot.dpi, Some(100));
        assert_eq!(plot.name.len(), 32 + ".png".len());
    }

    #[tokio::test]
    async fn timeout_is_reported_distinctly() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let mut slow = request("sleep 500");
        slow.timeout = Some(Duration::from_millis(50));
        let err = session.run(&slow, &[]).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(d) if d == Duration::from_millis(50)));

        let result = session.run(&request("print still alive"), &[]).await.unwrap();
        assert_eq!(result.stdout, "still alive\n");
        assert_eq!(fx.runtime.state.opens(), 1);
    }

    #[tokio::test]
    async fn unexpected_failure_is_an_execution_error() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");

        let err = session.run(&request("crash"), &[]).await.unwrap_err();
        assert!(matches!(err, ProxyError::Execution(_)));
        assert!(err.to_string().contains("sandbox crashed"));
    }

    #[tokio::test]
    async fn expiry_follows_creation_time() {
        let fx = Fixture::new(10).await;
        let fresh = fx.session("fresh");
        let old = fx.session("old").with_created_at(Utc::now() - chrono::Duration::minutes(61));

        assert!(!fresh.is_expired());
        assert!(old.is_expired());

        let info = old.info().await;
        assert!(info.expired);
        assert!(info.age_minutes >= 61.0);
    }

    #[tokio::test]
    async fn run_updates_last_activity() {
        let fx = Fixture::new(10).await;
        let session = fx.session("s1");
        let before = session.last_activity().await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        session.run(&request("print hi"), &[]).await.unwrap();
        assert!(session.last_activity().await > before);
    }
}
