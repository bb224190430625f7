//! Line-oriented, flush-per-line log file written alongside the build
//! script for local invocations (§6, "Build-script log entry on disk").

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct LogWriter {
    file: File,
}

impl LogWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating build log at {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn write_line(&mut self, line: &str) {
        if writeln!(self.file, "{line}").is_ok() {
            let _ = self.file.flush();
        }
    }
}

/// `build.<ext>.log`, next to the script file.
pub fn build_log_path(script_path: &Path) -> PathBuf {
    let ext = script_path.extension().and_then(|e| e.to_str()).unwrap_or("log");
    let dir = script_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("build.{ext}.log"))
}
