//! Step Executor contract (C2).
//!
//! The orchestrator depends only on this trait; concrete Host/Container
//! strategies live in the `ando-steps` crate, mirroring how the teacher's
//! `Pipeline` depends on `AgentBackend` while concrete backends live in a
//! sibling crate.

use crate::types::ExecResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;

/// One line of output from a running command, tagged by stream.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Where a command runs. `env` is the overlay applied on top of the process
/// environment (secrets ∪ build metadata); `timeout_secs` of `None` uses the
/// executor's 5-minute default, `Some(0)` means unlimited.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: Option<&'a Path>,
    pub env: &'a HashMap<String, String>,
    pub timeout_secs: Option<u64>,
    /// Inherits console streams and does not capture; used for nested CLI
    /// invocations rather than server-side builds.
    pub interactive: bool,
    /// `Some(name)` runs via `docker exec` against the named warm container
    /// (the Container strategy); `None` runs directly on the controller/CLI
    /// host (the Host strategy). Both strategies are served by whichever
    /// `StepExecutor` the caller wires up, picked per the run target.
    pub container_name: Option<&'a str>,
}

/// Strategy abstraction for running one step's command (C2). Implementations
/// stream output line-by-line via `on_line` as it arrives rather than
/// buffering, so callers can fan lines into the log transport in real time.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn exec(
        &self,
        req: ExecRequest<'_>,
        on_line: mpsc::UnboundedSender<OutputLine>,
    ) -> anyhow::Result<ExecResult>;

    /// Availability probe for `command` (e.g. `which docker`, `docker info`).
    async fn is_available(&self, command: &str) -> bool;
}

/// Five minutes, matching the spec's per-command default.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;
