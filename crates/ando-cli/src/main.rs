mod log;

use std::path::PathBuf;

use ando_core::container::{ContainerConfig, ContainerManager};
use ando_core::executor::{ExecRequest, OutputLine, StepExecutor};
use ando_core::steps::{ManifestStepSource, StepSource};
use ando_steps::ContainerExecutor;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::log::LogWriter;

/// Compiles a build script into an ordered list of steps and runs them
/// inside a warm, per-project Docker container, streaming output to the
/// console and to a log file alongside the script.
#[derive(Parser, Debug)]
#[command(name = "ando", version, about)]
struct Cli {
    /// Path to the build manifest, relative to `--workspace`.
    #[arg(long, default_value = "ando.toml")]
    script: PathBuf,

    /// Project directory to stage into the container.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Container image to run steps in.
    #[arg(long, default_value = "ando/build-runner:latest")]
    image: String,

    /// Mount point of the project inside the container.
    #[arg(long, default_value = "/workspace")]
    container_workspace: String,

    /// Parse the manifest and print its steps without running anything.
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ando_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    std::process::ExitCode::from(run(&cli).await)
}

async fn run(cli: &Cli) -> u8 {
    let workspace_root = match cli.workspace.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            error!("workspace path {} is not accessible: {e}", cli.workspace.display());
            return 2;
        }
    };
    let script_path = workspace_root.join(&cli.script);

    let steps = match ManifestStepSource.load(&script_path, &workspace_root) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load build script {}: {e}", script_path.display());
            return 4;
        }
    };

    if cli.validate_only {
        info!("{} step(s) parsed from {}", steps.len(), script_path.display());
        for step in &steps {
            info!("  - {} ({})", step.name, step.command);
        }
        return 0;
    }

    let script_bytes = match std::fs::read(&script_path) {
        Ok(b) => b,
        Err(e) => {
            error!("failed to read build script {}: {e}", script_path.display());
            return 2;
        }
    };

    let containers = ContainerManager::new();
    if !containers.docker_available().await {
        error!("docker runtime unavailable (is the daemon running?)");
        return 3;
    }

    let project_slug = workspace_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());

    let cfg = ContainerConfig {
        project_slug,
        image: cli.image.clone(),
        script_bytes,
        workspace: cli.container_workspace.clone(),
    };

    let handle = match containers.ensure_container(&cfg).await {
        Ok(h) => h,
        Err(e) => {
            error!("failed to start warm container: {e}");
            return 3;
        }
    };

    if let Err(e) = containers.stage_project(&handle, &workspace_root).await {
        error!("failed to stage project into container: {e}");
        return 5;
    }
    if let Err(e) = containers.clean_artifacts(&handle).await {
        warn!("clean_artifacts: {e}");
    }

    let log_path = log::build_log_path(&script_path);
    let mut log_writer = match LogWriter::create(&log_path) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to open build log {}: {e}", log_path.display());
            return 5;
        }
    };

    let executor = ContainerExecutor;
    let mut failed = false;

    for step in &steps {
        log_writer.write_line(&format!("=== {} ===", step.name));
        info!(step = %step.name, "running step");

        let args: Vec<String> = step
            .args
            .iter()
            .map(|a| containers.translate_path(&handle, &workspace_root, a))
            .collect();
        let cwd = step
            .working_dir
            .as_ref()
            .map(|d| PathBuf::from(containers.translate_path(&handle, &workspace_root, d)));

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();

        let req = ExecRequest {
            command: &step.command,
            args: &args,
            cwd: cwd.as_deref(),
            env: &step.env,
            timeout_secs: step.timeout_secs,
            interactive: false,
            container_name: Some(handle.name.as_str()),
        };

        let drain = async {
            while let Some(line) = rx.recv().await {
                match line {
                    OutputLine::Stdout(l) => {
                        println!("{l}");
                        log_writer.write_line(&l);
                    }
                    OutputLine::Stderr(l) => {
                        eprintln!("{l}");
                        log_writer.write_line(&l);
                    }
                }
            }
        };

        let (outcome, ()) = tokio::join!(executor.exec(req, tx), drain);

        match outcome {
            Ok(result) if result.success => {
                log_writer.write_line(&format!("--- {} completed ---", step.name));
            }
            Ok(result) => {
                log_writer.write_line(&format!("--- {} failed (exit {}) ---", step.name, result.exit_code));
                error!(step = %step.name, exit_code = result.exit_code, "step failed");
                failed = true;
                break;
            }
            Err(e) => {
                log_writer.write_line(&format!("--- {} errored: {e} ---", step.name));
                error!(step = %step.name, "step errored: {e}");
                failed = true;
                break;
            }
        }
    }

    if failed {
        return 1;
    }

    let container_artifacts_dir = format!("{}/artifacts", handle.workspace);
    let host_artifacts_dir = workspace_root.join("artifacts");
    if let Err(e) = containers.copy_out(&handle, &container_artifacts_dir, &host_artifacts_dir).await {
        warn!("no artifacts collected: {e}");
    }

    info!("build succeeded");
    0
}
