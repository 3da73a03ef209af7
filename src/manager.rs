//! Session manager: session id → [`SandboxSession`].
//!
//! The map lock protects only the mapping and is never held across a run.
//! Runs against one session are serialized by that session's own lock, so
//! unrelated sessions execute in parallel.
//!
//! Closing a sandbox and removing its files happens on a spawned task that
//! the caller awaits. Dropping the caller's future therefore never leaves a
//! session removed from the map with its sandbox still open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::language::Language;
use crate::runtime::SandboxRuntime;
use crate::session::{
    FileRef, RunRequest, RunResult, SandboxSession, SessionConfig, SessionInfo, SessionState,
};
use crate::storage::{FileStore, StoredFile};

/// Background expiry sweep and the channel that stops it.
struct CleanupTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Owns every live session and the background expiry sweep.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SandboxSession>>>,
    cleanup_task: Mutex<Option<CleanupTask>>,
    config: Arc<SessionConfig>,
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<FileStore>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, runtime: Arc<dyn SandboxRuntime>, store: Arc<FileStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cleanup_task: Mutex::new(None),
            config: Arc::new(config),
            runtime,
            store,
        }
    }

    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<FileStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(SessionConfig::from_config(config)?, runtime, store))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Look up a live session.
    pub async fn get(&self, session_id: &str) -> Option<Arc<SandboxSession>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Return the session for `session_id`, creating it if needed.
    ///
    /// A session bound to a different language is closed, its files are
    /// removed, and a fresh session takes its place under the same id.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        language: Language,
    ) -> Result<Arc<SandboxSession>> {
        if session_id.is_empty() {
            return Err(ProxyError::validation("Session id must not be empty"));
        }
        if !self.config.supported_languages.contains(&language) {
            return Err(ProxyError::validation(format!(
                "Language '{language}' is not supported"
            )));
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(session_id) {
            if existing.language() == language {
                return Ok(Arc::clone(existing));
            }
        }

        let session = Arc::new(SandboxSession::new(
            session_id,
            language,
            Arc::clone(&self.runtime),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        ));
        let Some(previous) = sessions.insert(session_id.to_string(), Arc::clone(&session)) else {
            drop(sessions);
            info!(session = %session_id, language = %language, "Created session");
            return Ok(session);
        };

        // Keep callers of the new session waiting until the old files are gone.
        let guard = session.lock_state().await;
        drop(sessions);
        info!(
            session = %session_id,
            from = %previous.language(),
            to = %language,
            "Language changed, replacing session"
        );
        self.teardown(previous, true, Some(guard)).await;
        Ok(session)
    }

    /// Resolve file references into stored files, dropping duplicates.
    /// References without a session id belong to `session_id`.
    pub async fn resolve_input_files(
        &self,
        session_id: &str,
        refs: &[FileRef],
    ) -> Result<Vec<StoredFile>> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for file_ref in refs {
            if !seen.insert(file_ref.id.as_str()) {
                continue;
            }
            let owner = file_ref.session_id.as_deref().unwrap_or(session_id);
            let file = self
                .store
                .get_file(owner, &file_ref.id)
                .await
                .ok_or_else(|| ProxyError::not_found(format!("File '{}' not found", file_ref.id)))?;
            files.push(file);
        }
        Ok(files)
    }

    /// Run code in the request's session.
    ///
    /// Timeouts leave the session in place. Any other failure closes the
    /// session and evicts it; the next request for the id starts fresh.
    pub async fn run_code(&self, request: &RunRequest, inputs: &[StoredFile]) -> Result<RunResult> {
        if inputs.len() > self.config.max_files_per_run {
            return Err(ProxyError::validation(format!(
                "Too many files. Max: {}",
                self.config.max_files_per_run
            )));
        }
        if request.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ProxyError::validation("Timeout must be positive"));
        }

        let mut retried = false;
        loop {
            let session = self.get_or_create(&request.session_id, request.language).await?;
            match session.run(request, inputs).await {
                Ok(result) => return Ok(result),
                // closed between lookup and lock by a delete or sweep
                Err(ProxyError::Closed(_)) if !retried => {
                    debug!(session = %request.session_id, "Session closed underneath run, retrying");
                    retried = true;
                }
                Err(e @ ProxyError::Timeout(_)) => return Err(e),
                Err(e) => {
                    warn!(session = %request.session_id, error = %e, "Run failed, evicting session");
                    self.evict(&session).await;
                    return Err(e);
                }
            }
        }
    }

    async fn evict(&self, session: &Arc<SandboxSession>) {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .get(session.id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(session.id());
            }
        }
        self.teardown(Arc::clone(session), false, None).await;
    }

    /// Remove a session, close its sandbox and delete its files.
    /// Returns `false` if no such session exists.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.lock().await.remove(session_id) else {
            return false;
        };
        self.teardown(session, true, None).await;
        info!(session = %session_id, "Deleted session");
        true
    }

    /// Close a session already removed from the map, optionally deleting its
    /// files, then release `successor` (the lock of the session replacing it).
    /// Runs on its own task so it completes even if the caller is dropped.
    async fn teardown(
        &self,
        session: Arc<SandboxSession>,
        remove_files: bool,
        successor: Option<OwnedMutexGuard<SessionState>>,
    ) {
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            if let Err(e) = session.close().await {
                warn!(session = %session.id(), error = %e, "Error closing session");
            }
            if remove_files {
                store.cleanup_session(session.id()).await;
            }
            drop(successor);
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Session teardown task failed");
        }
    }

    /// Active sessions, ordered by creation time.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<SandboxSession>> =
            self.sessions.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Delete every expired session through [`Self::delete_session`].
    /// Returns the number of sessions removed.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.is_expired())
            .map(|s| s.id().to_string())
            .collect();

        let mut removed = 0;
        for id in expired {
            debug!(session = %id, "Session expired");
            if self.delete_session(&id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(count = removed, "Cleaned up expired sessions");
        }
        removed
    }

    /// Start the background expiry sweep. No-op if it is already running.
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let manager = Arc::clone(self);
        let interval = self.config.cleanup_interval;
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Session cleanup sweep");
                        // a sweep in progress runs to completion before stop is seen
                        manager.cleanup_expired().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        *task = Some(CleanupTask { handle, stop });
        info!(interval_secs = interval.as_secs(), "Started session cleanup task");
    }

    /// Stop the background sweep and wait for it to finish. A sweep already
    /// deleting sessions completes first.
    pub async fn stop_cleanup_task(&self) {
        let Some(task) = self.cleanup_task.lock().await.take() else {
            return;
        };
        // the receiver is gone if the task already ended
        let _ = task.stop.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Cleanup task failed");
        }
        info!("Stopped session cleanup task");
    }

    /// Stop the sweep and delete every session.
    pub async fn shutdown(&self) {
        self.stop_cleanup_task().await;
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.delete_session(&id).await;
        }
    }

    #[cfg(test)]
    async fn insert_session(&self, session: SandboxSession) -> Arc<SandboxSession> {
        let session = Arc::new(session);
        self.sessions
            .lock()
            .await
            .insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    #[cfg(test)]
    fn new_session(&self, id: &str, language: Language) -> SandboxSession {
        SandboxSession::new(
            id,
            language,
            Arc::clone(&self.runtime),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        )
    }
}
