//! Docker runtime: one long-lived container per session, driven through
//! the container CLI.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    parse_plot_listing, EnvironmentInfo, ExecutionOutput, RuntimeError, RuntimeHandle,
    SandboxRuntime, ShellOutput,
};
use crate::config::Config;
use crate::language::Language;

/// Scratch directory inside the container for sources and build outputs.
const RUN_DIR: &str = "/tmp/ci-run";
const PLOT_DIR: &str = "/tmp/ci-run/plots";
const SESSION_LABEL: &str = "code-interpreter-proxy.session";

/// Runtime backed by the Docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    cli: String,
    memory_mb: u64,
    network: Option<String>,
    container_prefix: String,
    label: String,
    images: HashMap<Language, String>,
    enable_plotting: bool,
}

impl DockerRuntime {
    /// Build the runtime. Every supported language needs an image.
    pub fn new(config: &Config) -> Result<Self> {
        let docker = &config.docker;
        for lang in &config.supported_languages {
            anyhow::ensure!(
                docker.images.contains_key(lang),
                "No docker image configured for language '{lang}'"
            );
        }
        Ok(Self {
            cli: docker.cli.clone(),
            memory_mb: docker.memory_mb,
            network: docker.network.clone(),
            container_prefix: docker.container_prefix.clone(),
            label: config.sandbox_label.clone(),
            images: docker.images.clone(),
            enable_plotting: config.enable_plotting,
        })
    }

    fn container_name(&self, session_id: &str) -> String {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(40)
            .collect();
        format!(
            "{}-{safe}-{}",
            self.container_prefix,
            &Uuid::new_v4().simple().to_string()[..8]
        )
    }

    /// Arguments for `docker run` creating a session container.
    fn run_args(&self, name: &str, session_id: &str, image: &str, workdir: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            self.label.clone(),
            "--label".to_string(),
            format!("{SESSION_LABEL}={session_id}"),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            "-w".to_string(),
            workdir.to_string(),
        ];
        if let Some(ref network) = self.network {
            args.push(format!("--network={network}"));
        }
        args.extend([image.to_string(), "sleep".to_string(), "infinity".to_string()]);
        args
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn open(
        &self,
        session_id: &str,
        language: Language,
        workdir: &str,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let image = self
            .images
            .get(&language)
            .with_context(|| format!("No docker image configured for language '{language}'"))?;
        let name = self.container_name(session_id);

        let run_args = self.run_args(&name, session_id, image, workdir);
        let run_args: Vec<&str> = run_args.iter().map(String::as_str).collect();
        let output = docker(&self.cli, &run_args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("docker run failed: {}", stderr.trim()).into());
        }

        let handle = DockerHandle {
            cli: self.cli.clone(),
            container: name,
            workdir: workdir.to_string(),
            language,
            enable_plotting: self.enable_plotting,
        };

        // images do not necessarily ship the working directory
        let mkdir = docker(
            &self.cli,
            &["exec", &handle.container, "mkdir", "-p", workdir],
        )
        .await?;
        if !mkdir.status.success() {
            let _ = handle.close().await;
            let stderr = String::from_utf8_lossy(&mkdir.stderr);
            return Err(anyhow::anyhow!("Failed to create workdir: {}", stderr.trim()).into());
        }

        info!(session = %session_id, container = %handle.container, image = %image, "Started sandbox container");
        Ok(Box::new(handle))
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentInfo>, RuntimeError> {
        let filter = format!("label={}", self.label);
        let output = docker(
            &self.cli,
            &[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}|{{.Image}}|{{.CreatedAt}}|{{.State}}|{{.Names}}",
            ],
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("docker ps failed: {}", stderr.trim()).into());
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }

    async fn remove_environment(&self, id: &str) -> Result<(), RuntimeError> {
        let output = docker(&self.cli, &["rm", "-f", id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Err(anyhow::anyhow!("docker rm failed for {id}: {}", stderr.trim()).into())
    }
}

struct DockerHandle {
    cli: String,
    container: String,
    workdir: String,
    language: Language,
    enable_plotting: bool,
}

impl DockerHandle {
    fn plotting(&self) -> bool {
        self.enable_plotting && self.language == Language::Python
    }

    async fn write_source(&self, source: &str) -> Result<()> {
        let script = format!(
            "rm -rf {RUN_DIR} && mkdir -p {RUN_DIR} && cat > {RUN_DIR}/{}",
            self.language.source_file()
        );
        let mut child = Command::new(&self.cli)
            .args(["exec", "-i", &self.container, "sh", "-c", &script])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.cli))?;

        let mut stdin = child.stdin.take().context("Failed to open stdin")?;
        stdin
            .write_all(source.as_bytes())
            .await
            .context("Failed to write source to container")?;
        drop(stdin); // Close stdin to signal EOF

        let output = child.wait_with_output().await.context("Failed to wait for docker exec")?;
        anyhow::ensure!(
            output.status.success(),
            "Failed to write source: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }

    async fn collect_plots(&self) -> Vec<super::VisualArtifact> {
        let script = format!(
            "cd {PLOT_DIR} 2>/dev/null || exit 0; \
             for f in *; do [ -f \"$f\" ] && printf '%s|%s\\n' \"$f\" \"$(base64 -w0 \"$f\")\"; done; true"
        );
        match docker(&self.cli, &["exec", &self.container, "sh", "-c", &script]).await {
            Ok(output) if output.status.success() => {
                parse_plot_listing(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(
                    container = %self.container,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Plot collection failed"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(container = %self.container, error = %e, "Plot collection failed");
                Vec::new()
            }
        }
    }

    /// Stop whatever the timed-out run left behind. PID 1 (`sleep infinity`)
    /// survives, so the container stays usable.
    async fn kill_stragglers(&self) {
        let result = docker(&self.cli, &["exec", &self.container, "sh", "-c", "kill -9 -1"]).await;
        if let Err(e) = result {
            warn!(container = %self.container, error = %e, "Failed to stop timed-out processes");
        }
    }
}

#[async_trait]
impl RuntimeHandle for DockerHandle {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    #[instrument(skip(self, code, args), fields(container = %self.container, timeout = timeout.as_secs()))]
    async fn run(
        &self,
        code: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionOutput, RuntimeError> {
        debug!(code_len = code.len(), "Executing code in container");

        let source = self
            .language
            .prepare_source(code, self.plotting().then_some(PLOT_DIR));
        self.write_source(&source).await?;

        let command = self.language.run_command(RUN_DIR, args);
        let mut child = Command::new(&self.cli)
            .args(["exec", "-w", &self.workdir, &self.container, "sh", "-c", &command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.cli))?;

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
            let _ = child.kill().await;
            self.kill_stragglers().await;
            return Err(RuntimeError::Timeout(timeout));
        };
        let (stdout_buf, stderr_buf) = result?;
        let status = child.wait().await.context("Failed to wait for docker exec")?;

        let artifacts = if self.plotting() {
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
        debug!(exit_code = output.exit_code, plots = output.artifacts.len(), "Execution completed");
        Ok(output)
    }

    async fn copy_in(&self, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let local = local.to_string_lossy();
        let target = format!("{}:{remote}", self.container);
        let output = docker(&self.cli, &["cp", &local, &target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("docker cp into {target} failed: {}", stderr.trim()).into());
        }
        Ok(())
    }

    async fn copy_out(&self, remote: &str, local: &Path) -> Result<(), RuntimeError> {
        let source = format!("{}:{remote}", self.container);
        let local = local.to_string_lossy();
        let output = docker(&self.cli, &["cp", &source, &local]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_path_error(&stderr) {
            return Err(RuntimeError::NotFound(remote.to_string()));
        }
        Err(anyhow::anyhow!("docker cp from {source} failed: {}", stderr.trim()).into())
    }

    async fn execute_shell(&self, command: &str) -> Result<ShellOutput, RuntimeError> {
        let output = docker(
            &self.cli,
            &["exec", "-w", &self.workdir, &self.container, "sh", "-c", command],
        )
        .await?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        let output = docker(&self.cli, &["rm", "-f", &self.container]).await?;
        if output.status.success() {
            debug!(container = %self.container, "Removed sandbox container");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(anyhow::anyhow!("docker rm failed for {}: {}", self.container, stderr.trim()).into())
    }
}

async fn docker(cli: &str, args: &[&str]) -> Result<Output> {
    Command::new(cli)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {cli}"))
}

fn is_missing_path_error(stderr: &str) -> bool {
    stderr.contains("Could not find the file") || stderr.contains("No such file or directory")
}

/// Parse one `docker ps --format '{{.ID}}|{{.Image}}|{{.CreatedAt}}|{{.State}}|{{.Names}}'` line.
fn parse_ps_line(line: &str) -> Option<EnvironmentInfo> {
    let mut parts = line.trim().splitn(5, '|');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let image = parts.next()?;
    let created = parts.next()?;
    let state = parts.next()?;
    let name = parts.next().unwrap_or(id);

    let Some(created_at) = parse_created_at(created) else {
        warn!(container = %id, created = %created, "Unparseable container creation time");
        return None;
    };

    Some(EnvironmentInfo {
        id: id.to_string(),
        name: name.to_string(),
        image: image.to_string(),
        created_at,
        running: state.eq_ignore_ascii_case("running"),
    })
}

/// Docker prints creation times as `2024-11-14 14:32:15 +0000 UTC`.
fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    let mut tokens = value.split_whitespace();
    let (date, time, offset) = (tokens.next()?, tokens.next()?, tokens.next()?);
    DateTime::parse_from_str(&format!("{date} {time} {offset}"), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
