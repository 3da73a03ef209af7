//! Host-process runtime.
//!
//! Each environment is a directory under the configured root holding a
//! `work/` directory (the session working directory) and a `run/` scratch
//! directory for sources and build outputs. Code runs as a plain child
//! process: there is no isolation, so this backend is meant for development
//! and tests.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    artifact_from_plot_file, EnvironmentInfo, ExecutionOutput, RuntimeError, RuntimeHandle,
    SandboxRuntime, ShellOutput, VisualArtifact,
};
use crate::config::Config;
use crate::language::Language;

/// Runtime that executes code as host child processes.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    root: PathBuf,
    enable_plotting: bool,
}

impl ProcessRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.process.root.clone(),
            enable_plotting: config.enable_plotting,
        }
    }

    fn environment_dir(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(anyhow::anyhow!("Invalid environment id '{id}'").into());
        }
        Ok(self.root.join(id))
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn open(
        &self,
        session_id: &str,
        language: Language,
        _workdir: &str,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let safe_session: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(48)
            .collect();
        let id = format!("{safe_session}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let dir = self.environment_dir(&id)?;
        let work = dir.join("work");

        tokio::fs::create_dir_all(&work)
            .await
            .with_context(|| format!("Failed to create {}", work.display()))?;

        debug!(session = %session_id, dir = %dir.display(), "Opened process environment");
        Ok(Box::new(ProcessHandle {
            workdir: work.to_string_lossy().into_owned(),
            scratch: dir.join("run"),
            dir,
            language,
            enable_plotting: self.enable_plotting,
        }))
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentInfo>, RuntimeError> {
        let mut envs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(envs),
            Err(e) => return Err(anyhow::Error::from(e).context("Failed to read runtime root").into()),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read runtime root entry")?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let created = meta.created().or_else(|_| meta.modified()).map_or_else(
                |_| Utc::now(),
                DateTime::<Utc>::from,
            );
            let name = entry.file_name().to_string_lossy().into_owned();
            envs.push(EnvironmentInfo {
                id: name.clone(),
                name,
                image: "process".into(),
                created_at: created,
                running: false,
            });
        }
        Ok(envs)
    }

    async fn remove_environment(&self, id: &str) -> Result<(), RuntimeError> {
        let dir = self.environment_dir(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RuntimeError::NotFound(id.into())),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("Failed to remove {}", dir.display()))
                .into()),
        }
    }

    /// Everything under the root is ours, whatever the image prefixes say.
    fn filters_by_image(&self) -> bool {
        false
    }
}

struct ProcessHandle {
    dir: PathBuf,
    workdir: String,
    scratch: PathBuf,
    language: Language,
    enable_plotting: bool,
}

impl ProcessHandle {
    fn plot_dir(&self) -> PathBuf {
        self.scratch.join("plots")
    }

    async fn reset_scratch(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(&self.scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to clear scratch directory"),
        }
        tokio::fs::create_dir_all(&self.scratch)
            .await
            .context("Failed to create scratch directory")
    }

    async fn collect_plots(&self) -> Vec<VisualArtifact> {
        let mut artifacts = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.plot_dir()).await else {
            return artifacts;
        };
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                    artifacts.push(artifact_from_plot_file(&name, encoded));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read plot"),
            }
        }
        artifacts
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RuntimeHandle for ProcessHandle {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    #[instrument(skip(self, code, args), fields(language = %self.language, timeout = timeout.as_secs()))]
    async fn run(
        &self,
        code: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionOutput, RuntimeError> {
        debug!(code_len = code.len(), "Executing code in host process");

        self.reset_scratch().await?;
        let scratch = self.scratch.to_string_lossy().into_owned();
        let plot_dir = self.plot_dir().to_string_lossy().into_owned();
        let plotting = self.enable_plotting.then_some(plot_dir.as_str());
        let source = self.language.prepare_source(code, plotting);
        let source_path = self.scratch.join(self.language.source_file());
        tokio::fs::write(&source_path, source)
            .await
            .context("Failed to write source file")?;

        let mut cmd = self.shell(&self.language.run_command(&scratch, args));
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().context("Failed to spawn interpreter")?;

        // Take pipe handles out so `child` stays in scope for kill-on-timeout
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let Ok(result) = tokio::time::timeout(timeout, read_all).await else {
            kill_process_group(&mut child).await;
            return Err(RuntimeError::Timeout(timeout));
        };
        let (stdout_buf, stderr_buf) = result?;

        let status = child.wait().await.context("Failed to wait for process")?;
        let artifacts = if self.enable_plotting && self.language == Language::Python {
            self.collect_plots().await
        } else {
            Vec::new()
        };

        let output = ExecutionOutput {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            artifacts,
        };

        debug!(exit_code = output.exit_code, "Execution completed");
        Ok(output)
    }

    async fn copy_in(&self, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let dest = Path::new(remote);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(local, dest)
            .await
            .with_context(|| format!("Failed to copy {} to {remote}", local.display()))?;
        Ok(())
    }

    async fn copy_out(&self, remote: &str, local: &Path) -> Result<(), RuntimeError> {
        match tokio::fs::copy(remote, local).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RuntimeError::NotFound(remote.into())),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("Failed to copy {remote} to {}", local.display()))
                .into()),
        }
    }

    async fn execute_shell(&self, command: &str) -> Result<ShellOutput, RuntimeError> {
        let output = self
            .shell(command)
            .output()
            .await
            .context("Failed to run shell command")?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("Failed to remove {}", self.dir.display()))
                .into()),
        }
    }
}

/// Kill the child and everything it spawned. The child leads its own process
/// group, so the group id equals its pid.
async fn kill_process_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, error = %e, "Failed to kill process group");
            }
        }
    }
    if let Err(e) = child.kill().await {
        // already reaped after the group kill
        if e.kind() != ErrorKind::InvalidInput {
            warn!(error = %e, "Failed to kill child process");
        }
    }
}
