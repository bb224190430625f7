//! Build Orchestrator (C4): the heart of the core. Owns the build state
//! machine and drives it forward by invoking the Step Executor, the
//! Container Manager, and the Log Transport.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::container::{ContainerConfig, ContainerHandle, ContainerManager};
use crate::db::Db;
use crate::executor::{ExecRequest, OutputLine, StepExecutor};
use crate::log_transport::LogTransport;
use crate::source::SourceProvider;
use crate::steps::StepSource;
use crate::types::{Build, BuildStatus, LogEntryType, Project};
use crate::vault::Vault;

enum StepLoopOutcome {
    AllSucceeded,
    StepFailed(String),
    Cancelled,
}

enum Outcome {
    Success,
    Failed(String),
    TimedOut(String),
    Cancelled,
}

impl Outcome {
    fn status(&self) -> BuildStatus {
        match self {
            Outcome::Success => BuildStatus::Success,
            Outcome::Failed(_) => BuildStatus::Failed,
            Outcome::TimedOut(_) => BuildStatus::TimedOut,
            Outcome::Cancelled => BuildStatus::Cancelled,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match self {
            Outcome::Failed(m) | Outcome::TimedOut(m) => Some(m),
            Outcome::Success | Outcome::Cancelled => None,
        }
    }
}

/// Runs a fallible async operation up to 3 times with a short linear backoff,
/// for the transient runtime errors named in §7 (forge flake, daemon hiccup).
async fn retry_transient<T, F, Fut>(label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < 3 => {
                warn!(attempt, %label, error = %e, "transient error, retrying");
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => return Err(e).with_context(|| format!("{label} failed after {attempt} attempts")),
        }
    }
}

pub struct Orchestrator {
    db: Arc<Db>,
    config: Arc<Config>,
    vault: Arc<Vault>,
    containers: Arc<ContainerManager>,
    executor: Arc<dyn StepExecutor>,
    step_source: Arc<dyn StepSource>,
    source_provider: Arc<dyn SourceProvider>,
    log_transport: Arc<LogTransport>,
    in_flight: Mutex<HashSet<i64>>,
    cancel_signals: Mutex<HashMap<i64, watch::Sender<bool>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        vault: Arc<Vault>,
        containers: Arc<ContainerManager>,
        executor: Arc<dyn StepExecutor>,
        step_source: Arc<dyn StepSource>,
        source_provider: Arc<dyn SourceProvider>,
        log_transport: Arc<LogTransport>,
    ) -> Self {
        Self {
            db,
            config,
            vault,
            containers,
            executor,
            step_source,
            source_provider,
            log_transport,
            in_flight: Mutex::new(HashSet::new()),
            cancel_signals: Mutex::new(HashMap::new()),
        }
    }

    /// One scheduling pass: claim pending work up to `max_concurrent_builds`,
    /// dispatch each as its own task, panic-isolated so one bad build never
    /// kills the scheduler loop (mirrors the teacher's tick-wrapper idiom).
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let available = {
            let in_flight = self.in_flight.lock().await;
            self.config.max_concurrent_builds.saturating_sub(in_flight.len() as u32)
        };
        if available == 0 {
            return Ok(());
        }

        let claimed = self.db.claim_pending_builds(available)?;
        for build in claimed {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(build.id) {
                continue;
            }
            drop(in_flight);

            let this = Arc::clone(self);
            let build_id = build.id;
            let handle = tokio::spawn(async move { this.run_build(build_id).await });
            tokio::spawn(async move {
                if let Err(join_err) = handle.await {
                    error!(build_id, error = %join_err, "build task panicked");
                }
            });
        }
        Ok(())
    }

    /// Re-queues any build left in `Running` from a previous process crash so
    /// the next tick can pick it back up (no row is stuck forever).
    pub fn recover_orphaned_builds(&self) -> Result<()> {
        for build in self.db.list_orphaned_running_builds()? {
            warn!(build_id = build.id, "recovering orphaned running build as queued");
            self.db.finish_build(
                build.id,
                BuildStatus::Failed,
                Some("controller restarted mid-build"),
            )?;
        }
        Ok(())
    }

    pub async fn request_cancel(&self, build_id: i64) -> Result<()> {
        self.db.request_cancel(build_id)?;
        if self.db.dequeue_build(build_id)? {
            return Ok(()); // was still queued, never started (R3-safe, idempotent)
        }
        let signals = self.cancel_signals.lock().await;
        if let Some(tx) = signals.get(&build_id) {
            let _ = tx.send(true);
        }
        Ok(())
    }

    /// Produces a new build with the same commit/branch/metadata but
    /// `trigger = Manual`; only valid from terminal states (never re-runs a
    /// build still in flight).
    pub fn retry(&self, build_id: i64) -> Result<i64> {
        let build = self
            .db
            .get_build(build_id)?
            .with_context(|| format!("build {build_id} not found"))?;
        if !build.status.is_terminal() {
            anyhow::bail!("build {build_id} is not in a terminal state, cannot retry");
        }
        let (new_id, _job_id) = self.db.enqueue_build(&crate::types::NewBuild {
            project_id: build.project_id,
            commit_sha: build.commit_sha,
            branch: build.branch,
            commit_message: build.commit_message,
            commit_author: build.commit_author,
            pull_request_number: build.pull_request_number,
            trigger: crate::types::Trigger::Manual,
        })?;
        Ok(new_id)
    }

    async fn run_build(self: Arc<Self>, build_id: i64) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel_signals.lock().await.insert(build_id, cancel_tx);

        let outcome = match self.execute(build_id, cancel_rx).await {
            Ok(o) => o,
            Err(e) => {
                error!(build_id, error = %e, "orchestrator failed build with a fatal error");
                Outcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.db.finish_build(build_id, outcome.status(), outcome.error_message()) {
            error!(build_id, error = %e, "failed to persist build terminal status");
        }
        let _ = self
            .log_transport
            .append(build_id, LogEntryType::Info, "WorkflowCompleted", None)
            .await;
        self.log_transport.end_build(build_id).await;

        self.in_flight.lock().await.remove(&build_id);
        self.cancel_signals.lock().await.remove(&build_id);
    }

    async fn execute(&self, build_id: i64, mut cancel_rx: watch::Receiver<bool>) -> Result<Outcome> {
        let build = self
            .db
            .get_build(build_id)?
            .with_context(|| format!("build {build_id} disappeared before execution"))?;
        let project = self
            .db
            .get_project(build.project_id)?
            .with_context(|| format!("project {} missing for build {build_id}", build.project_id))?;

        if build.cancel_requested || *cancel_rx.borrow() {
            return Ok(Outcome::Cancelled);
        }

        let env = self.build_env(&build, &project)?;
        self.db.mark_running(build_id)?;
        self.log_transport
            .append(build_id, LogEntryType::Info, format!("build {} started", build.commit_sha), None)
            .await?;

        let clone_url = format!("https://github.com/{}/{}.git", project.owner, project.name);
        let scratch_root = PathBuf::from(&self.config.data_dir).join("checkouts").join(project.id.to_string());
        let source_provider = Arc::clone(&self.source_provider);
        let commit_sha = build.commit_sha.clone();
        let local_root = retry_transient("source checkout", || {
            let source_provider = Arc::clone(&source_provider);
            let clone_url = clone_url.clone();
            let commit_sha = commit_sha.clone();
            let scratch_root = scratch_root.clone();
            async move {
                tokio::task::spawn_blocking(move || source_provider.checkout(&clone_url, &commit_sha, &scratch_root))
                    .await
                    .context("checkout task panicked")?
            }
        })
        .await?;

        let manifest_name = project.profile.clone().unwrap_or_else(|| "ando.toml".to_string());
        let script_path = local_root.join(&manifest_name);
        let script_bytes = std::fs::read(&script_path)
            .with_context(|| format!("reading build manifest {}", script_path.display()))?;

        let cfg = ContainerConfig {
            project_slug: format!("{}-{}", project.owner, project.name),
            image: project.container_image.clone().unwrap_or_else(|| self.config.default_container_image.clone()),
            script_bytes,
            workspace: self.config.container_workspace.clone(),
        };

        let containers = Arc::clone(&self.containers);
        let ensure_cfg = cfg.clone();
        let handle = retry_transient("ensure_container", || {
            let containers = Arc::clone(&containers);
            let cfg = ensure_cfg.clone();
            async move { containers.ensure_container(&cfg).await }
        })
        .await?;

        self.containers.stage_project(&handle, &local_root).await.context("staging project into container")?;
        self.containers.clean_artifacts(&handle).await.context("cleaning artifacts directory")?;

        let steps = self
            .step_source
            .load(&script_path, &local_root)
            .context("loading build steps from manifest")?;
        self.db.set_steps_total(build_id, steps.len() as i64)?;

        let total_budget = Duration::from_secs((project.timeout_minutes.max(1) as u64) * 60);
        let loop_result = tokio::time::timeout(
            total_budget,
            self.run_steps(build_id, &handle, &local_root, &steps, &env, &mut cancel_rx),
        )
        .await;

        let step_loop_outcome = match loop_result {
            Ok(inner) => inner?,
            Err(_) => {
                return Ok(Outcome::TimedOut(format!(
                    "timeout after {} minutes",
                    project.timeout_minutes
                )))
            }
        };

        match step_loop_outcome {
            StepLoopOutcome::Cancelled => Ok(Outcome::Cancelled),
            StepLoopOutcome::StepFailed(msg) => Ok(Outcome::Failed(msg)),
            StepLoopOutcome::AllSucceeded => {
                if let Err(e) = self.collect_artifacts(&build, &project, &handle).await {
                    warn!(build_id, error = %e, "artifact collection failed; build still counts as success");
                }
                Ok(Outcome::Success)
            }
        }
    }

    fn build_env(&self, build: &Build, project: &Project) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        for (name, encrypted) in self.db.list_secrets_raw(project.id)? {
            let plaintext = self.vault.decrypt(&encrypted).context("decrypting project secret")?;
            env.insert(name, plaintext);
        }
        env.insert("ANDO_BUILD_ID".into(), build.id.to_string());
        env.insert("ANDO_COMMIT_SHA".into(), build.commit_sha.clone());
        env.insert("ANDO_BRANCH".into(), build.branch.clone());
        Ok(env)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        build_id: i64,
        handle: &ContainerHandle,
        project_root: &std::path::Path,
        steps: &[crate::types::Step],
        base_env: &HashMap<String, String>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<StepLoopOutcome> {
        for step in steps {
            if *cancel_rx.borrow() {
                return Ok(StepLoopOutcome::Cancelled);
            }

            self.log_transport
                .append(build_id, LogEntryType::StepStarted, step.name.clone(), Some(step.name.clone()))
                .await?;

            let mut env = base_env.clone();
            for (k, v) in &step.env {
                env.insert(k.clone(), v.clone());
            }
            let args: Vec<String> = step
                .args
                .iter()
                .map(|a| self.containers.translate_path(handle, project_root, a))
                .collect();
            let cwd = step
                .working_dir
                .as_deref()
                .map(|wd| std::path::PathBuf::from(self.containers.translate_path(handle, project_root, wd)));

            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
            let log_transport = Arc::clone(&self.log_transport);
            let step_name = step.name.clone();
            let drain_handle = tokio::spawn(async move {
                while let Some(line) = line_rx.recv().await {
                    let message = match line {
                        OutputLine::Stdout(l) | OutputLine::Stderr(l) => l,
                    };
                    let _ = log_transport
                        .append(build_id, LogEntryType::Output, message, Some(step_name.clone()))
                        .await;
                }
            });

            let req = ExecRequest {
                command: &step.command,
                args: &args,
                cwd: cwd.as_deref(),
                env: &env,
                timeout_secs: step.timeout_secs,
                interactive: false,
                container_name: Some(handle.name.as_str()),
            };

            // Dropping the losing branch's future (here, `exec_fut` on
            // cancellation) tears down the spawned child via `kill_on_drop`.
            let exec_fut = self.executor.exec(req, line_tx);
            let result = tokio::select! {
                biased;
                _ = cancel_rx.changed() => None,
                res = exec_fut => Some(res),
            };
            let _ = drain_handle.await;

            let Some(result) = result else {
                return Ok(StepLoopOutcome::Cancelled);
            };

            match result {
                Ok(exec_result) if exec_result.success => {
                    self.log_transport
                        .append(build_id, LogEntryType::StepCompleted, step.name.clone(), Some(step.name.clone()))
                        .await?;
                    self.db.increment_steps_completed(build_id)?;
                }
                Ok(exec_result) => {
                    let msg = format!("step '{}' exited with code {}", step.name, exec_result.exit_code);
                    self.log_transport
                        .append(build_id, LogEntryType::StepFailed, msg.clone(), Some(step.name.clone()))
                        .await?;
                    self.db.increment_steps_failed(build_id)?;
                    return Ok(StepLoopOutcome::StepFailed(msg));
                }
                Err(e) => {
                    let msg = format!("step '{}' errored: {e}", step.name);
                    self.log_transport
                        .append(build_id, LogEntryType::StepFailed, msg.clone(), Some(step.name.clone()))
                        .await?;
                    self.db.increment_steps_failed(build_id)?;
                    return Ok(StepLoopOutcome::StepFailed(msg));
                }
            }
        }
        Ok(StepLoopOutcome::AllSucceeded)
    }

    async fn collect_artifacts(&self, build: &Build, project: &Project, handle: &ContainerHandle) -> Result<()> {
        let host_staging = PathBuf::from(&self.config.artifact_root)
            .join("_staging")
            .join(build.id.to_string());
        let container_artifacts = format!("{}/artifacts", handle.workspace);

        if self.containers.copy_out(handle, &container_artifacts, &host_staging).await.is_err() {
            // No artifacts directory, or it was empty: nothing to collect.
            return Ok(());
        }

        let settings = self.db.get_settings()?;
        let retention = chrono::Duration::days(settings.artifact_retention_days.max(1));
        let now = chrono::Utc::now();

        let mut stack = vec![host_staging.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path.strip_prefix(&host_staging).unwrap_or(&path).to_string_lossy().to_string();
                let meta = entry.metadata().await?;
                let artifact = crate::types::BuildArtifact {
                    id: 0,
                    build_id: build.id,
                    project_id: project.id,
                    name: rel,
                    size_bytes: meta.len() as i64,
                    created_at: now,
                    expires_at: now + retention,
                };
                let dest = artifact.disk_path(&self.config.artifact_root);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&path, &dest).await.context("moving artifact from staging")?;
                self.db.insert_artifact(&artifact)?;
                info!(build_id = build.id, artifact = %artifact.name, "artifact collected");
            }
        }
        let _ = tokio::fs::remove_dir_all(&host_staging).await;
        Ok(())
    }
}
