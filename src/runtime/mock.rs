//! Scripted in-memory runtime for tests.
//!
//! The "code" is a list of commands, one per line:
//!
//! ```text
//! write NAME CONTENT...   create or overwrite a working-directory file
//! print TEXT...           append a line to stdout
//! marker                  print the plot setup marker
//! sleep MS                wait (counts against the run timeout)
//! plot W H                emit a 1x1 PNG visual artifact named with W/H
//! badplot                 emit an artifact whose payload is not base64
//! vanish NAME             list NAME in the working directory but fail copy_out
//! crash                   fail the run with an unexpected error
//! exit N                  set the exit code
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    artifact_from_plot_file, EnvironmentInfo, ExecutionOutput, RuntimeError, RuntimeHandle,
    SandboxRuntime, ShellOutput,
};
use crate::language::{Language, PLOT_SETUP_MESSAGE};

/// Smallest valid PNG, base64 encoded.
pub(crate) const PNG_1X1: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[derive(Default)]
pub(crate) struct MockState {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub active_runs: AtomicUsize,
    pub max_concurrent_runs: AtomicUsize,
    pub environments: Mutex<Vec<EnvironmentInfo>>,
    pub removed: Mutex<Vec<String>>,
    pub failing_removals: Mutex<HashSet<String>>,
    pub fail_listing: AtomicBool,
}

impl MockState {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockRuntime {
    pub state: Arc<MockState>,
    run_delay: Duration,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            run_delay: Duration::ZERO,
        }
    }

    /// Every run sleeps this long before executing its script.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(
        &self,
        _session_id: &str,
        _language: Language,
        workdir: &str,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.state),
            workdir: workdir.to_string(),
            run_delay: self.run_delay,
            files: Mutex::new(BTreeMap::new()),
            vanishing: Mutex::new(HashSet::new()),
            clock: AtomicU64::new(1_700_000_000),
        }))
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentInfo>, RuntimeError> {
        if self.state.fail_listing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("daemon unavailable").into());
        }
        Ok(self.state.environments.lock().unwrap().clone())
    }

    async fn remove_environment(&self, id: &str) -> Result<(), RuntimeError> {
        if self.state.failing_removals.lock().unwrap().contains(id) {
            return Err(anyhow::anyhow!("removal refused").into());
        }
        self.state.environments.lock().unwrap().retain(|e| e.id != id);
        self.state.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

struct MockHandle {
    state: Arc<MockState>,
    workdir: String,
    run_delay: Duration,
    /// name -> (content, mtime)
    files: Mutex<BTreeMap<String, (Vec<u8>, u64)>>,
    vanishing: Mutex<HashSet<String>>,
    clock: AtomicU64,
}

impl MockHandle {
    fn put(&self, name: &str, content: Vec<u8>) {
        let mtime = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.files.lock().unwrap().insert(name.to_string(), (content, mtime));
    }

    async fn execute_script(&self, code: &str) -> Result<ExecutionOutput, RuntimeError> {
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }

        let mut output = ExecutionOutput::default();
        let mut plots = 0;
        for line in code.lines() {
            let line = line.trim();
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "write" => {
                    let (name, content) = rest.split_once(' ').unwrap_or((rest, ""));
                    self.put(name, content.as_bytes().to_vec());
                }
                "print" => {
                    output.stdout.push_str(rest);
                    output.stdout.push('\n');
                }
                "marker" => {
                    output.stdout.push_str(PLOT_SETUP_MESSAGE);
                    output.stdout.push('\n');
                }
                "sleep" => {
                    let ms = rest.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "plot" => {
                    let (w, h) = rest.split_once(' ').unwrap_or(("640", "480"));
                    let name = format!("plot-{plots}-{w}x{h}-100.png");
                    output.artifacts.push(artifact_from_plot_file(&name, PNG_1X1.into()));
                    plots += 1;
                }
                "badplot" => {
                    let name = format!("plot-{plots}-1x1-72.png");
                    output
                        .artifacts
                        .push(artifact_from_plot_file(&name, "not base64 at all!".into()));
                    plots += 1;
                }
                "vanish" => {
                    self.put(rest, b"gone".to_vec());
                    self.vanishing.lock().unwrap().insert(rest.to_string());
                }
                "crash" => return Err(anyhow::anyhow!("sandbox crashed").into()),
                "exit" => output.exit_code = rest.parse().unwrap_or(1),
                _ => {}
            }
        }
        Ok(output)
    }

    fn file_name(remote: &str) -> &str {
        remote.rsplit('/').next().unwrap_or(remote)
    }
}

#[async_trait]
impl RuntimeHandle for MockHandle {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn run(
        &self,
        code: &str,
        _args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionOutput, RuntimeError> {
        let active = self.state.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent_runs.fetch_max(active, Ordering::SeqCst);

        let result = tokio::time::timeout(timeout, self.execute_script(code)).await;

        self.state.active_runs.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|_| RuntimeError::Timeout(timeout))?
    }

    async fn copy_in(&self, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|e| RuntimeError::Other(e.into()))?;
        self.put(Self::file_name(remote), content);
        Ok(())
    }

    async fn copy_out(&self, remote: &str, local: &Path) -> Result<(), RuntimeError> {
        let name = Self::file_name(remote);
        if self.vanishing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(remote.to_string()));
        }
        let content = self
            .files
            .lock()
            .unwrap()
            .get(name)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| RuntimeError::NotFound(remote.to_string()))?;
        tokio::fs::write(local, content)
            .await
            .map_err(|e| RuntimeError::Other(e.into()))
    }

    async fn execute_shell(&self, _command: &str) -> Result<ShellOutput, RuntimeError> {
        let stdout = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (content, mtime))| format!("{name}|{}|{mtime}.0000000000\n", content.len()))
            .collect();
        Ok(ShellOutput { stdout, exit_code: 0 })
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
