//! Host strategy (C2): runs a step's command directly on the controller.
//!
//! Subprocess shape mirrors the teacher's agent-backend runner: piped
//! stdout/stderr drained concurrently via `tokio::select!`, `kill_on_drop`
//! on the spawned command so a dropped future (timeout or cancellation)
//! tears down the whole process, and an optional wall-clock timeout wrapping
//! the I/O future.

use ando_core::executor::{ExecRequest, OutputLine, StepExecutor, DEFAULT_STEP_TIMEOUT_SECS};
use ando_core::types::ExecResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

pub struct HostExecutor;

#[async_trait]
impl StepExecutor for HostExecutor {
    async fn exec(&self, req: ExecRequest<'_>, on_line: UnboundedSender<OutputLine>) -> Result<ExecResult> {
        let mut cmd = Command::new(req.command);
        cmd.args(req.args).kill_on_drop(true);
        for (k, v) in req.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = req.cwd {
            cmd.current_dir(cwd);
        }

        if req.interactive {
            cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            let status = cmd.status().await.with_context(|| format!("failed to spawn {}", req.command))?;
            let exit_code = status.code().unwrap_or(-1);
            return Ok(ExecResult { exit_code, success: status.success() });
        }

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", req.command))?;

        let stdout = child.stdout.take().context("missing stdout handle")?;
        let stderr = child.stderr.take().context("missing stderr handle")?;

        let io_future = async move {
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("reading stdout")? {
                            Some(l) => { let _ = on_line.send(OutputLine::Stdout(l)); }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            let _ = on_line.send(OutputLine::Stderr(l));
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                let _ = on_line.send(OutputLine::Stderr(l));
            }

            let status = child.wait().await.context("waiting for child process")?;
            anyhow::Ok(status)
        };

        let timeout_secs = req.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let status = if timeout_secs == 0 {
            io_future.await?
        } else {
            match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), io_future).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(command = req.command, timeout_secs, "step timed out, process tree killed");
                    return Ok(ExecResult { exit_code: -1, success: false });
                }
            }
        };

        Ok(ExecResult { exit_code: status.code().unwrap_or(-1), success: status.success() })
    }

    async fn is_available(&self, command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
