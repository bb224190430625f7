//! Repository checkout (external collaborator, same spirit as the build
//! script host): the orchestrator needs fresh project files at a commit sha
//! before it can stage them into a container. Grounded in the teacher's `Git`
//! helper — a thin synchronous wrapper over the `git` CLI — generalized from
//! "create a worktree for an agent branch" to "clone/update a bare checkout
//! and materialize one commit into a scratch directory per build."

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct GitExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

fn run(dir: &Path, args: &[&str]) -> Result<GitExecResult> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn git -C {} {}", dir.display(), args.join(" ")))?;
    Ok(GitExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}

/// Materializes one commit of a project into a host-side scratch directory
/// the Container Manager can then stage into a warm container.
pub trait SourceProvider: Send + Sync {
    fn checkout(&self, clone_url: &str, commit_sha: &str, scratch_root: &Path) -> Result<PathBuf>;
}

pub struct GitSourceProvider;

impl SourceProvider for GitSourceProvider {
    fn checkout(&self, clone_url: &str, commit_sha: &str, scratch_root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(scratch_root)
            .with_context(|| format!("creating scratch root {}", scratch_root.display()))?;
        let checkout_dir = scratch_root.join(commit_sha);
        if checkout_dir.exists() {
            std::fs::remove_dir_all(&checkout_dir)
                .with_context(|| format!("clearing stale checkout at {}", checkout_dir.display()))?;
        }

        let clone = Command::new("git")
            .args(["clone", "--no-checkout", clone_url, &checkout_dir.to_string_lossy()])
            .output()
            .context("failed to spawn git clone")?;
        if !clone.status.success() {
            return Err(anyhow!(
                "git clone {clone_url} failed: {}",
                String::from_utf8_lossy(&clone.stderr)
            ));
        }

        let fetch = run(&checkout_dir, &["fetch", "--depth", "1", "origin", commit_sha])?;
        if fetch.success() {
            let checkout = run(&checkout_dir, &["checkout", "FETCH_HEAD"])?;
            if !checkout.success() {
                return Err(anyhow!("git checkout FETCH_HEAD failed: {}", checkout.combined_output()));
            }
        } else {
            // Shallow fetch of the sha can fail against forges that don't
            // allow fetch-by-sha; fall back to a full fetch and direct checkout.
            let fetch_all = run(&checkout_dir, &["fetch", "origin"])?;
            if !fetch_all.success() {
                return Err(anyhow!("git fetch origin failed: {}", fetch_all.combined_output()));
            }
            let checkout = run(&checkout_dir, &["checkout", commit_sha])?;
            if !checkout.success() {
                return Err(anyhow!("git checkout {commit_sha} failed: {}", checkout.combined_output()));
            }
        }

        Ok(checkout_dir)
    }
}
