//! Container strategy (C2): runs a step's command inside a warm container via
//! `docker exec`. Same streaming/timeout shape as the host strategy, the
//! difference being the spawned command itself.

use ando_core::executor::{ExecRequest, OutputLine, StepExecutor, DEFAULT_STEP_TIMEOUT_SECS};
use ando_core::types::ExecResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

pub struct ContainerExecutor;

impl ContainerExecutor {
    fn build_command(&self, req: &ExecRequest<'_>) -> Result<Command> {
        let container_name = req.container_name.context("ContainerExecutor requires container_name")?;

        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        if req.interactive {
            cmd.arg("-i");
        }
        for (k, v) in req.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        if let Some(cwd) = req.cwd {
            cmd.arg("-w").arg(cwd);
        }
        cmd.arg(container_name).arg(req.command).args(req.args);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl StepExecutor for ContainerExecutor {
    async fn exec(&self, req: ExecRequest<'_>, on_line: UnboundedSender<OutputLine>) -> Result<ExecResult> {
        let mut cmd = self.build_command(&req)?;

        if req.interactive {
            cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            let status = cmd.status().await.context("failed to spawn docker exec")?;
            return Ok(ExecResult { exit_code: status.code().unwrap_or(-1), success: status.success() });
        }

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker exec")?;

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

            let status = child.wait().await.context("waiting for docker exec")?;
            anyhow::Ok(status)
        };

        let timeout_secs = req.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let status = if timeout_secs == 0 {
            io_future.await?
        } else {
            match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), io_future).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(command = req.command, timeout_secs, "containerized step timed out, process tree killed");
                    return Ok(ExecResult { exit_code: -1, success: false });
                }
            }
        };

        Ok(ExecResult { exit_code: status.code().unwrap_or(-1), success: status.success() })
    }

    async fn is_available(&self, _command: &str) -> bool {
        Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn build_command_requires_container_name() {
        let env = HashMap::new();
        let req = ExecRequest {
            command: "echo",
            args: &[],
            cwd: None,
            env: &env,
            timeout_secs: None,
            interactive: false,
            container_name: None,
        };
        assert!(ContainerExecutor.build_command(&req).is_err());
    }
}
