//! Pluggable build-script front-end (§6): the orchestrator depends only on
//! the `StepSource` trait, never on a concrete scripting language. The real
//! Roslyn-hosted build-script language is out of scope; this module ships
//! one deliberately simple implementation — a TOML manifest — so the CLI and
//! server are runnable end-to-end without inventing a general-purpose
//! scripting host.

use crate::types::Step;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// `fn load(script_path, workspace_root) -> Result<Vec<Step>>`, exactly the
/// abstract shape named in the distilled spec's external-interfaces section.
pub trait StepSource: Send + Sync {
    fn load(&self, script_path: &Path, workspace_root: &Path) -> Result<Vec<Step>>;
}

#[derive(Deserialize)]
struct ManifestFile {
    #[serde(default)]
    steps: Vec<ManifestStep>,
}

#[derive(Deserialize)]
struct ManifestStep {
    name: String,
    #[serde(default)]
    context: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Reads an `ando.toml`-style manifest: an ordered list of steps, each a
/// literal `{name, command, args, working_dir?, env?, timeout_secs?}`.
pub struct ManifestStepSource;

impl StepSource for ManifestStepSource {
    fn load(&self, script_path: &Path, _workspace_root: &Path) -> Result<Vec<Step>> {
        let contents = std::fs::read_to_string(script_path)
            .with_context(|| format!("reading build manifest at {}", script_path.display()))?;
        let manifest: ManifestFile = toml::from_str(&contents)
            .with_context(|| format!("parsing build manifest at {}", script_path.display()))?;

        if manifest.steps.is_empty() {
            anyhow::bail!("build manifest at {} declares no steps", script_path.display());
        }

        Ok(manifest
            .steps
            .into_iter()
            .map(|s| Step {
                name: s.name,
                context: s.context,
                command: s.command,
                args: s.args,
                working_dir: s.working_dir,
                env: s.env,
                timeout_secs: s.timeout_secs,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_ordered_steps_from_manifest() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
            [[steps]]
            name = "restore"
            command = "dotnet"
            args = ["restore"]

            [[steps]]
            name = "build"
            command = "dotnet"
            args = ["build", "-c", "Release"]
            timeout_secs = 600
            "#
        )
        .expect("write manifest");

        let steps = ManifestStepSource
            .load(file.path(), Path::new("/workspace"))
            .expect("load");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "restore");
        assert_eq!(steps[1].timeout_secs, Some(600));
    }

    #[test]
    fn rejects_manifest_with_no_steps() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "steps = []").expect("write");
        let result = ManifestStepSource.load(file.path(), Path::new("/workspace"));
        assert!(result.is_err());
    }
}
