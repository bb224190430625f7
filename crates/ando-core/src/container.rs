//! Warm container management (C1).
//!
//! One named, long-lived container per `(project, script-content-hash)` pair.
//! Project files are copied in, never bind-mounted, so a build's side effects
//! cannot touch the host except through an explicit `copy_out`. Shells out to
//! the `docker` CLI via `tokio::process::Command`, the same invocation style
//! the teacher's sandbox wrapper uses for its own `docker run` backend.

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Directories never staged into a warm container's workspace.
const STAGE_EXCLUDES: &[&str] = &[
    ".git", "node_modules", "bin", "obj", ".vs", ".idea", "packages", "TestResults", "coverage",
    ".pytest_cache", "__pycache__", "dist", "build", "target",
];

/// Config identifying a warm container: which project, which image, and the
/// content hash of its build script (name rolls over when the script changes).
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub project_slug: String,
    pub image: String,
    pub script_bytes: Vec<u8>,
    /// Mount point of the project workspace inside the container.
    pub workspace: String,
}

impl ContainerConfig {
    /// `ando-<slug>-<md5-8-hex>`, lower case, spaces replaced with `-`.
    pub fn container_name(&self) -> String {
        let slug = self
            .project_slug
            .to_ascii_lowercase()
            .replace(' ', "-");
        let mut hasher = Md5::new();
        hasher.update(&self.script_bytes);
        let digest = hasher.finalize();
        let hex_prefix = hex::encode(digest)[..8].to_string();
        format!("ando-{slug}-{hex_prefix}")
    }
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: String,
    pub workspace: String,
}

/// Paths needed when the controller itself runs inside a container: `docker`
/// commands issued from here run against the *outer* daemon, so `host_root`
/// is the path as that daemon sees it while `local_root` is this process's
/// own view, used for `tar` staging.
#[derive(Debug, Clone)]
pub struct ProjectRoot {
    pub local_root: std::path::PathBuf,
    pub host_root: std::path::PathBuf,
}

pub struct ContainerManager {
    /// Serializes per-container operations; keyed by container name so two
    /// builds sharing a warm container never race on it (§5 container contention).
    locks: Mutex<std::collections::HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl Default for ContainerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerManager {
    pub fn new() -> Self {
        Self { locks: Mutex::new(std::collections::HashMap::new()) }
    }

    async fn lock_for(&self, name: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        std::sync::Arc::clone(
            locks.entry(name.to_string()).or_insert_with(|| std::sync::Arc::new(Mutex::new(()))),
        )
    }

    pub async fn docker_available(&self) -> bool {
        Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn container_state(&self, name: &str) -> Result<Option<bool>> {
        let output = Command::new("docker")
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .context("docker inspect failed to spawn")?;
        if !output.status.success() {
            return Ok(None);
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(Some(running))
    }

    /// Idempotent: reuse a running container, start a stopped one, or create
    /// fresh from `cfg.image` with a long-running no-op command (R2).
    pub async fn ensure_container(&self, cfg: &ContainerConfig) -> Result<ContainerHandle> {
        let name = cfg.container_name();
        let guard = self.lock_for(&name).await;
        let _held = guard.lock().await;

        match self.container_state(&name).await? {
            Some(true) => {
                info!(container = %name, "reusing running warm container");
            }
            Some(false) => {
                info!(container = %name, "starting stopped warm container");
                let status = Command::new("docker")
                    .args(["start", &name])
                    .status()
                    .await
                    .context("docker start failed to spawn")?;
                if !status.success() {
                    bail!("docker start {name} exited with {status}");
                }
            }
            None => {
                info!(container = %name, image = %cfg.image, "creating warm container");
                let status = Command::new("docker")
                    .args([
                        "run",
                        "-d",
                        "--name",
                        &name,
                        "--pids-limit",
                        "256",
                        "-w",
                        &cfg.workspace,
                        &cfg.image,
                        "tail",
                        "-f",
                        "/dev/null",
                    ])
                    .status()
                    .await
                    .context("docker run failed to spawn")?;
                if !status.success() {
                    bail!("docker run {name} exited with {status}");
                }
            }
        }

        Ok(ContainerHandle { name, workspace: cfg.workspace.clone() })
    }

    /// Copy repository files into the container workspace via a `tar` stream
    /// piped into `docker exec ... tar -x`, skipping `STAGE_EXCLUDES`.
    pub async fn stage_project(&self, handle: &ContainerHandle, host_root: &Path) -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        append_dir(&mut builder, host_root, host_root)?;
        let archive = builder.into_inner().context("finalize staging tar archive")?;

        let mut child = Command::new("docker")
            .args(["exec", "-i", &handle.name, "tar", "-x", "-C", &handle.workspace])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("docker exec tar -x failed to spawn")?;

        let mut stdin = child.stdin.take().context("docker exec stdin missing")?;
        stdin.write_all(&archive).await.context("writing staging archive")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("docker exec tar -x wait")?;
        if !output.status.success() {
            bail!(
                "staging project into {} failed: {}",
                handle.name,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    pub async fn clean_artifacts(&self, handle: &ContainerHandle) -> Result<()> {
        let artifacts_dir = format!("{}/artifacts", handle.workspace);
        let status = Command::new("docker")
            .args([
                "exec",
                &handle.name,
                "sh",
                "-c",
                &format!("rm -rf '{artifacts_dir}'/* '{artifacts_dir}'/.[!.]* 2>/dev/null; mkdir -p '{artifacts_dir}'"),
            ])
            .status()
            .await
            .context("docker exec clean artifacts failed to spawn")?;
        if !status.success() {
            warn!(container = %handle.name, "clean_artifacts exited non-zero (directory may not have existed yet)");
        }
        Ok(())
    }

    /// Translate a path argument from host/project space into container space.
    /// Arguments already under the container workspace pass through unchanged;
    /// host-absolute paths inside the project root are rewritten relative to
    /// the workspace; relative paths resolve against the workspace.
    pub fn translate_path(&self, handle: &ContainerHandle, project_root: &Path, arg: &str) -> String {
        if arg.starts_with(&handle.workspace) {
            return arg.to_string();
        }
        let path = Path::new(arg);
        if path.is_absolute() {
            if let Ok(rel) = path.strip_prefix(project_root) {
                return format!("{}/{}", handle.workspace, rel.display());
            }
            return arg.to_string();
        }
        format!("{}/{}", handle.workspace, arg)
    }

    /// Extract a file or directory from the container to the host, fixing
    /// ownership to the invoking user afterward (Unix only).
    pub async fn copy_out(&self, handle: &ContainerHandle, container_path: &str, host_path: &Path) -> Result<()> {
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await.context("creating artifact destination dir")?;
        }
        let source = format!("{}:{}", handle.name, container_path);
        let status = Command::new("docker")
            .args(["cp", &source, &host_path.to_string_lossy()])
            .status()
            .await
            .context("docker cp failed to spawn")?;
        if !status.success() {
            bail!("docker cp {source} -> {} failed", host_path.display());
        }

        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            let _ = Command::new("chown")
                .args(["-R", &format!("{uid}:{gid}"), &host_path.to_string_lossy()])
                .status()
                .await;
        }
        Ok(())
    }

    /// Forcibly remove a container (explicit clean or image change).
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _ = Command::new("docker").args(["rm", "-f", name]).status().await;
        Ok(())
    }
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, root: &Path, dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if STAGE_EXCLUDES.contains(&name_str.as_ref()) {
            continue;
        }
        if path.is_dir() {
            append_dir(builder, root, &path)?;
        } else if path.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let mut file = std::fs::File::open(&path)?;
            builder.append_file(rel, &mut file)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_slug_plus_script_hash() {
        let cfg = ContainerConfig {
            project_slug: "My Cool App".into(),
            image: "ando/build-runner:latest".into(),
            script_bytes: b"echo hello".to_vec(),
            workspace: "/workspace".into(),
        };
        let name = cfg.container_name();
        assert!(name.starts_with("ando-my-cool-app-"));
        assert_eq!(name.len(), "ando-my-cool-app-".len() + 8);
    }

    #[test]
    fn container_name_changes_when_script_changes() {
        let mut cfg = ContainerConfig {
            project_slug: "app".into(),
            image: "img".into(),
            script_bytes: b"v1".to_vec(),
            workspace: "/workspace".into(),
        };
        let first = cfg.container_name();
        cfg.script_bytes = b"v2".to_vec();
        let second = cfg.container_name();
        assert_ne!(first, second);
    }

    #[test]
    fn translate_path_passes_through_workspace_paths_unchanged() {
        let mgr = ContainerManager::new();
        let handle = ContainerHandle { name: "c".into(), workspace: "/workspace".into() };
        let project_root = Path::new("/home/user/project");
        assert_eq!(
            mgr.translate_path(&handle, project_root, "/workspace/artifacts/out.txt"),
            "/workspace/artifacts/out.txt"
        );
    }

    #[test]
    fn translate_path_rewrites_host_absolute_path_under_project_root() {
        let mgr = ContainerManager::new();
        let handle = ContainerHandle { name: "c".into(), workspace: "/workspace".into() };
        let project_root = Path::new("/home/user/project");
        assert_eq!(
            mgr.translate_path(&handle, project_root, "/home/user/project/src/main.rs"),
            "/workspace/src/main.rs"
        );
    }

    #[test]
    fn translate_path_resolves_relative_against_workspace() {
        let mgr = ContainerManager::new();
        let handle = ContainerHandle { name: "c".into(), workspace: "/workspace".into() };
        let project_root = Path::new("/home/user/project");
        assert_eq!(mgr.translate_path(&handle, project_root, "artifacts/out.zip"), "/workspace/artifacts/out.zip");
    }
}
