//! Docker backend, driven through the docker CLI with `tokio::process`.
//!
//! Containers are named `berth-<session>` and tagged with a
//! `berth.session` label so `list` only sees sandboxes this system owns.
//! The per-session working copy is bind-mounted at `/workspace`; agent
//! state lives in a named volume `berth-<session>-data` that survives
//! container replacement unless the caller asks for deletion.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{Error, Result, SessionId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use crate::types::{
    AttachOpts, CreateOpts, ExecOutput, SandboxInfo, SandboxStatus, VolumePolicy, AGENT_PORT,
};
use crate::{SandboxProvider, SandboxPty, SandboxStream};

const SECRET_ENV: &str = "BERTH_AGENT_SECRET";
const SESSION_LABEL: &str = "berth.session";

pub struct DockerSandboxProvider {
    image: String,
}

impl DockerSandboxProvider {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    fn container_name(session_id: SessionId) -> String {
        format!("berth-{session_id}")
    }

    fn volume_name(session_id: SessionId) -> String {
        format!("berth-{session_id}-data")
    }

    async fn docker(args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to spawn docker: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") || stderr.contains("No such object") {
                return Err(Error::NotFound(format!("docker {}", args.join(" "))));
            }
            if stderr.contains("is already in use") {
                return Err(Error::Conflict(stderr.trim().to_string()));
            }
            return Err(Error::Sandbox(format!(
                "docker {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(session_id: SessionId) -> Result<serde_json::Value> {
        let name = Self::container_name(session_id);
        let raw = Self::docker(&["inspect", &name]).await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| Error::Sandbox(format!("unparseable docker inspect output: {e}")))?;
        parsed
            .get(0)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox {session_id}")))
    }

    fn info_from_inspect(session_id: SessionId, doc: &serde_json::Value) -> SandboxInfo {
        let state = doc.pointer("/State/Status").and_then(|v| v.as_str());
        let exit_code = doc
            .pointer("/State/ExitCode")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let status = match state {
            Some("running") | Some("paused") | Some("restarting") => SandboxStatus::Running,
            Some("created") => SandboxStatus::Created,
            Some("exited") if exit_code == 0 => SandboxStatus::Stopped,
            Some("exited") | Some("dead") => SandboxStatus::Failed,
            _ => SandboxStatus::Failed,
        };

        let image = doc
            .pointer("/Config/Image")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let agent_port = doc
            .pointer(&format!("/NetworkSettings/Ports/{AGENT_PORT}~1tcp/0/HostPort"))
            .and_then(|v| v.as_str())
            .and_then(|p| p.parse().ok());

        let labels = doc
            .pointer("/Config/Labels")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let error = doc
            .pointer("/State/Error")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from);

        SandboxInfo {
            session_id,
            status,
            image,
            agent_port,
            labels,
            error,
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create(&self, session_id: SessionId, opts: CreateOpts) -> Result<()> {
        let name = Self::container_name(session_id);
        let volume = Self::volume_name(session_id);
        let session_label = format!("{SESSION_LABEL}={session_id}");
        let secret_env = format!("{SECRET_ENV}={}", opts.shared_secret);
        let workspace_mount = format!("{}:/workspace", opts.workspace_path.display());
        let data_mount = format!("{volume}:/data");
        let publish = format!("127.0.0.1:0:{AGENT_PORT}");

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name,
            "--label".into(),
            session_label,
            "-e".into(),
            secret_env,
            "-p".into(),
            publish,
            "-v".into(),
            workspace_mount,
            "-v".into(),
            data_mount,
        ];

        for (key, value) in &opts.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(source) = &opts.workspace_source {
            args.push("-e".into());
            args.push(format!("BERTH_WORKSPACE_SOURCE={source}"));
        }
        if let Some(commit) = &opts.workspace_commit {
            args.push("-e".into());
            args.push(format!("BERTH_WORKSPACE_COMMIT={commit}"));
        }
        if let Some(timeout) = opts.resources.timeout {
            args.push("-e".into());
            args.push(format!("BERTH_IDLE_TIMEOUT_SECS={}", timeout.as_secs()));
        }
        args.push(self.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::docker(&arg_refs).await?;
        Ok(())
    }

    async fn start(&self, session_id: SessionId) -> Result<()> {
        Self::docker(&["start", &Self::container_name(session_id)]).await?;
        Ok(())
    }

    async fn stop(&self, session_id: SessionId, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().max(1).to_string();
        match Self::docker(&["stop", "-t", &secs, &Self::container_name(session_id)]).await {
            Ok(_) => Ok(()),
            // Stopping a stopped container is success; stopping a missing
            // one is the caller's NotFound to handle.
            Err(Error::NotFound(e)) => Err(Error::NotFound(e)),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, session_id: SessionId, volumes: VolumePolicy) -> Result<()> {
        let name = Self::container_name(session_id);
        match volumes {
            VolumePolicy::Preserve => {
                Self::docker(&["rm", "-f", &name]).await?;
            }
            VolumePolicy::Delete => {
                Self::docker(&["rm", "-f", "-v", &name]).await?;
                // `-v` only covers anonymous volumes; the named data volume
                // goes separately.
                if let Err(e) =
                    Self::docker(&["volume", "rm", &Self::volume_name(session_id)]).await
                {
                    warn!(session = %session_id, error = %e, "data volume removal failed");
                }
            }
        }
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<SandboxInfo> {
        let doc = Self::inspect(session_id).await?;
        Ok(Self::info_from_inspect(session_id, &doc))
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let filter = format!("label={SESSION_LABEL}");
        let out = Self::docker(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;

        let mut infos = Vec::new();
        for name in out.lines().filter(|l| !l.is_empty()) {
            let Some(session_id) = name
                .strip_prefix("berth-")
                .and_then(|s| s.parse::<SessionId>().ok())
            else {
                warn!(container = name, "skipping unparseable sandbox name");
                continue;
            };
            match Self::inspect(session_id).await {
                Ok(doc) => infos.push(Self::info_from_inspect(session_id, &doc)),
                // Removed between ps and inspect.
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(infos)
    }

    async fn exec(&self, session_id: SessionId, cmd: &[String]) -> Result<ExecOutput> {
        let name = Self::container_name(session_id);
        let mut args = vec!["exec".to_string(), name];
        args.extend_from_slice(cmd);

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to spawn docker exec: {e}")))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_stream(
        &self,
        session_id: SessionId,
        cmd: &[String],
    ) -> Result<Box<dyn SandboxStream>> {
        let name = Self::container_name(session_id);
        let mut args = vec!["exec".to_string(), "-i".to_string(), name];
        args.extend_from_slice(cmd);

        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn docker exec: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sandbox("docker exec has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("docker exec has no stdout".into()))?;

        Ok(Box::new(ChildStream {
            _child: child,
            stdin,
            stdout,
        }))
    }

    async fn attach(&self, session_id: SessionId, opts: AttachOpts) -> Result<Box<dyn SandboxPty>> {
        let name = Self::container_name(session_id);
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-e".to_string(),
            "TERM=xterm-256color".to_string(),
            "-e".to_string(),
            format!("COLUMNS={}", opts.cols),
            "-e".to_string(),
            format!("LINES={}", opts.rows),
        ];
        if !opts.user.is_empty() {
            args.push("-u".to_string());
            args.push(opts.user.clone());
        }
        args.push(name.clone());
        args.push("/bin/sh".to_string());
        args.push("-l".to_string());

        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn docker exec: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sandbox("docker exec has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("docker exec has no stdout".into()))?;

        Ok(Box::new(DockerPty {
            container: name,
            child,
            stdin: Some(stdin),
            stdout,
        }))
    }

    async fn get_secret(&self, session_id: SessionId) -> Result<String> {
        let doc = Self::inspect(session_id).await?;
        let env = doc
            .pointer("/Config/Env")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Sandbox("docker inspect has no Config.Env".into()))?;

        env.iter()
            .filter_map(|v| v.as_str())
            .find_map(|entry| entry.strip_prefix(&format!("{SECRET_ENV}=")))
            .map(String::from)
            .ok_or_else(|| Error::Sandbox(format!("sandbox {session_id} has no shared secret")))
    }

    fn image(&self) -> &str {
        &self.image
    }
}

/// A child process's stdin/stdout presented as one bidirectional stream.
struct ChildStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Terminal attached over `docker exec -i`. Resize is best-effort: exec
/// sessions have no controlling tty on the host side, so the new size is
/// pushed into the container with `stty`.
struct DockerPty {
    container: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

#[async_trait]
impl SandboxPty for DockerPty {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stdout.read(buf).await?)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Sandbox("pty is closed".into()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let rows = rows.to_string();
        let cols = cols.to_string();
        let result = Command::new("docker")
            .args([
                "exec",
                &self.container,
                "stty",
                "rows",
                &rows,
                "cols",
                &cols,
            ])
            .output()
            .await;
        if let Err(e) = result {
            warn!(container = %self.container, error = %e, "pty resize failed");
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::Sandbox(format!("wait on docker exec failed: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping stdin sends EOF; the shell exits on its own.
        self.stdin.take();
        Ok(())
    }
}
