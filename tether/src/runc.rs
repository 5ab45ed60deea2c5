//! [`Runtime`] backed by the runc command line.
//!
//! IO and console arguments arrive as reference IDs and are resolved through
//! the [`Registry`]: an `io:<n>` reference hands its child pipe ends to the
//! runc process as stdio, a `console:<n>` reference becomes the
//! `--console-socket` path.

use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tether_proto::{
    CheckpointReq, Container, CreateReq, ExecReq, RestoreReq, Stats, TopResults, Version,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RuncConfig;
use crate::convert;
use crate::io::ChildStdio;
use crate::reference::ReferenceId;
use crate::registry::Registry;
use crate::runtime::{EventStream, Runtime};
use crate::{Error, Result};

/// Queued events per stream.
const EVENT_QUEUE: usize = 32;

/// Default `ps` arguments for [`Runtime::top`].
const DEFAULT_PS_ARGS: &str = "-ef";

/// runc command-line wrapper.
#[derive(Debug, Clone)]
pub struct Runc {
    config: RuncConfig,
    registry: Arc<Registry>,
}

impl Runc {
    /// Creates a wrapper resolving references through `registry`.
    pub const fn new(config: RuncConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    /// A runc command with the global flags applied.
    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--root").arg(&self.config.root);
        if let Some(log) = &self.config.log {
            cmd.arg("--log").arg(log).args(["--log-format", "json"]);
        }
        if self.config.systemd_cgroup {
            cmd.arg("--systemd-cgroup");
        }
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    /// Runs a short-lived command and returns its stdout.
    async fn output(&self, op: &'static str, mut cmd: Command) -> Result<Vec<u8>> {
        debug!(op, "runc");
        let out = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(failure(op, out.status, &out.stderr))
        }
    }

    /// Runs a command whose children may outlive it and inherit its stdio.
    ///
    /// runc's own diagnostics go to a temporary file rather than a pipe, so
    /// a container keeping the descriptor open cannot stall the call.
    /// Returns the exit status together with whatever runc logged.
    async fn run_inherited(
        &self,
        op: &'static str,
        mut cmd: Command,
        stdio: Option<ChildStdio>,
    ) -> Result<(ExitStatus, Vec<u8>)> {
        debug!(op, "runc");
        let mut diagnostics = tempfile::tempfile()?;
        let stdio = stdio.unwrap_or_default();
        cmd.stdin(stdio.stdin.map_or_else(Stdio::null, Stdio::from))
            .stdout(stdio.stdout.map_or_else(Stdio::null, Stdio::from));
        match stdio.stderr {
            Some(fd) => cmd.stderr(Stdio::from(fd)),
            None => cmd.stderr(Stdio::from(diagnostics.try_clone()?)),
        };
        let status = cmd.status().await?;
        // Release our copies of the child pipe ends.
        drop(cmd);

        let mut stderr = Vec::new();
        diagnostics.seek(SeekFrom::Start(0))?;
        diagnostics.read_to_end(&mut stderr)?;
        Ok((status, stderr))
    }

    async fn run(
        &self,
        op: &'static str,
        cmd: Command,
        stdio: Option<ChildStdio>,
    ) -> Result<()> {
        let (status, stderr) = self.run_inherited(op, cmd, stdio).await?;
        if status.success() {
            Ok(())
        } else {
            Err(failure(op, status, &stderr))
        }
    }

    async fn child_stdio(&self, io: Option<&str>) -> Result<Option<ChildStdio>> {
        let Some(io) = io else {
            return Ok(None);
        };
        let id: ReferenceId = io.parse()?;
        let bundle = self.registry.io(&id)?;
        bundle.take_child_stdio().await.map(Some)
    }

    fn console_path(&self, console: Option<&str>) -> Result<Option<std::path::PathBuf>> {
        let Some(console) = console else {
            return Ok(None);
        };
        let id: ReferenceId = console.parse()?;
        Ok(Some(self.registry.console(&id)?.path().to_path_buf()))
    }

    async fn simple(&self, op: &'static str, args: &[&str]) -> Result<()> {
        self.output(op, self.command(args)).await.map(drop)
    }
}

/// Builds a runtime error from runc's diagnostics.
///
/// runc logs `level=error msg="..."` lines (or JSON with `--log-format
/// json`); the last message is the useful one.
fn failure(op: &'static str, status: ExitStatus, stderr: &[u8]) -> Error {
    let text = String::from_utf8_lossy(stderr);
    let message = text
        .lines()
        .rev()
        .find_map(error_message)
        .unwrap_or_else(|| match text.trim() {
            "" => format!("runc exited with {status}"),
            other => other.to_owned(),
        });
    Error::Runtime { op, message }
}

fn error_message(line: &str) -> Option<String> {
    let line = line.trim();
    if line.starts_with('{') {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        return v.get("msg")?.as_str().map(str::to_owned);
    }
    let (_, rest) = line.split_once("msg=")?;
    let msg = rest
        .strip_prefix('"')
        .and_then(|r| r.rfind('"').map(|end| &r[..end]))
        .unwrap_or(rest);
    Some(msg.replace("\\\"", "\""))
}

impl Runtime for Runc {
    async fn create(&self, req: CreateReq) -> Result<()> {
        let console = self.console_path(req.console_socket.as_deref())?;
        let stdio = self.child_stdio(req.io.as_deref()).await?;

        let mut cmd = self.command(["create", "--bundle", req.bundle.as_str()]);
        if let Some(path) = &console {
            cmd.arg("--console-socket").arg(path);
        }
        if let Some(pid_file) = &req.pid_file {
            cmd.args(["--pid-file", pid_file.as_str()]);
        }
        if req.no_pivot {
            cmd.arg("--no-pivot");
        }
        if req.no_new_keyring {
            cmd.arg("--no-new-keyring");
        }
        cmd.arg(&req.id);
        self.run("create", cmd, stdio).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.simple("start", &["start", id]).await
    }

    async fn exec(&self, req: ExecReq) -> Result<Option<i32>> {
        let console = self.console_path(req.console_socket.as_deref())?;
        let stdio = self.child_stdio(req.io.as_deref()).await?;
        let process = tempfile::NamedTempFile::new()?;
        std::fs::write(process.path(), &req.process)?;

        let mut cmd = self.command(["exec", "--process"]);
        cmd.arg(process.path());
        if let Some(path) = &console {
            cmd.arg("--console-socket").arg(path);
        }
        if let Some(pid_file) = &req.pid_file {
            cmd.args(["--pid-file", pid_file.as_str()]);
        }
        if req.detach {
            cmd.arg("--detach");
        }
        cmd.arg(&req.id);

        if req.detach {
            self.run("exec", cmd, stdio).await?;
            return Ok(None);
        }
        // Attached, runc exits with the process's status. A logged error
        // means runc itself failed.
        let (status, stderr) = self.run_inherited("exec", cmd, stdio).await?;
        let logged = String::from_utf8_lossy(&stderr);
        if !status.success() && logged.lines().rev().any(|l| error_message(l).is_some()) {
            return Err(failure("exec", status, &stderr));
        }
        Ok(Some(status.code().unwrap_or(-1)))
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        let signal = signal.to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.extend([id, signal.as_str()]);
        self.simple("kill", &args).await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.simple("pause", &["pause", id]).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.simple("resume", &["resume", id]).await
    }

    async fn ps(&self, id: &str) -> Result<Vec<i32>> {
        let out = self
            .output("ps", self.command(["ps", "--format", "json", id]))
            .await?;
        convert::pids(&out)
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        if force {
            self.simple("delete", &["delete", "--force", id]).await
        } else {
            self.simple("delete", &["delete", id]).await
        }
    }

    async fn update(&self, id: &str, resources: &[u8]) -> Result<()> {
        let mut cmd = self.command(["update", "--resources", "-", id]);
        debug!(op = "update", "runc");
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(resources).await?;
        }
        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(failure("update", out.status, &out.stderr))
        }
    }

    async fn checkpoint(&self, _req: CheckpointReq) -> Result<()> {
        Err(Error::NotImplemented("checkpoint"))
    }

    async fn restore(&self, _req: RestoreReq) -> Result<i32> {
        Err(Error::NotImplemented("restore"))
    }

    async fn state(&self, id: &str) -> Result<Container> {
        let out = self.output("state", self.command(["state", id])).await?;
        convert::container(&out)
    }

    async fn list(&self) -> Result<Vec<Container>> {
        let out = self
            .output("list", self.command(["list", "--format", "json"]))
            .await?;
        convert::containers(&out)
    }

    async fn stats(&self, id: &str) -> Result<Stats> {
        let out = self
            .output("stats", self.command(["events", "--stats", id]))
            .await?;
        convert::stats(out.trim_ascii())
    }

    async fn top(&self, id: &str, ps_options: &[String]) -> Result<TopResults> {
        let mut cmd = self.command(["ps", id]);
        if ps_options.is_empty() {
            cmd.arg(DEFAULT_PS_ARGS);
        } else {
            cmd.args(ps_options);
        }
        let out = self.output("top", cmd).await?;
        convert::top(&String::from_utf8_lossy(&out))
    }

    async fn version(&self) -> Result<Version> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--version").kill_on_drop(true);
        let out = self.output("version", cmd).await?;
        Ok(convert::version(&String::from_utf8_lossy(&out)))
    }

    async fn events(&self, id: &str, interval: Duration) -> Result<EventStream> {
        let mut cmd = self.command(["events"]);
        if !interval.is_zero() {
            cmd.arg(format!("--interval={}ms", interval.as_millis()));
        }
        cmd.arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(op = "events", id, "runc");
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("runc events has no stdout".to_owned()))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let item = match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => convert::event(line.as_bytes()),
                    Ok(None) => break,
                    Err(e) => Err(e.into()),
                };
                if tx.send(item).await.is_err() {
                    // Receiver gone; dropping `child` kills runc.
                    return;
                }
            }
            match child.wait_with_output().await {
                Ok(out) if !out.status.success() => {
                    let _ = tx.send(Err(failure("events", out.status, &out.stderr))).await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "runc events wait failed"),
            }
        });
        Ok(rx)
    }
}
