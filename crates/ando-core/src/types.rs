use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Status / trigger enums ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            _ => Self::Queued,
        }
    }

    /// Terminal states never transition further (retention deletions aside).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled | Self::TimedOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Push,
    PullRequest,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::Manual => "manual",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "pull_request" => Self::PullRequest,
            "manual" => Self::Manual,
            _ => Self::Push,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    StepStarted,
    StepCompleted,
    StepFailed,
    Info,
    Warning,
    Error,
    Debug,
    Output,
}

impl LogEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Debug => "debug",
            Self::Output => "output",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "step_started" => Self::StepStarted,
            "step_completed" => Self::StepCompleted,
            "step_failed" => Self::StepFailed,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "debug" => Self::Debug,
            "output" => Self::Output,
            _ => Self::Info,
        }
    }
}

// ── Project ───────────────────────────────────────────────────────────────

/// Binds a version-controlled repository to build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub external_repo_id: String,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub installation_id: String,
    pub webhook_secret: String,
    /// Comma-separated exact branch names; case-insensitive match.
    pub branch_filter: String,
    pub enable_pr_builds: bool,
    pub timeout_minutes: i64,
    pub container_image: Option<String>,
    pub profile: Option<String>,
    /// Names of secrets the build script declares it needs.
    pub required_secrets: Vec<String>,
    pub notify_on_failure: bool,
    pub last_build_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Exact, case-insensitive match against the comma-separated filter list.
    /// An empty filter matches every branch.
    pub fn branch_allowed(&self, branch: &str) -> bool {
        if self.branch_filter.trim().is_empty() {
            return true;
        }
        self.branch_filter
            .split(',')
            .map(str::trim)
            .any(|b| b.eq_ignore_ascii_case(branch))
    }
}

// ── Build ─────────────────────────────────────────────────────────────────

/// One execution attempt of a project's build script against a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub project_id: i64,
    pub commit_sha: String,
    pub branch: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub pull_request_number: Option<i64>,
    pub status: BuildStatus,
    pub trigger: Trigger,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub steps_failed: i64,
    pub error_message: Option<String>,
    pub job_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl Build {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }
}

/// Fields needed to enqueue a new build; the store assigns id/queued_at.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub project_id: i64,
    pub commit_sha: String,
    pub branch: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub pull_request_number: Option<i64>,
    pub trigger: Trigger,
}

// ── BuildLogEntry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub build_id: i64,
    pub sequence: u32,
    pub entry_type: LogEntryType,
    pub message: String,
    pub step_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ── BuildArtifact ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub id: i64,
    pub build_id: i64,
    pub project_id: i64,
    pub name: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BuildArtifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// `{root}/{project_id}/{build_id}/{name}`
    pub fn disk_path(&self, root: &str) -> std::path::PathBuf {
        std::path::Path::new(root)
            .join(self.project_id.to_string())
            .join(self.build_id.to_string())
            .join(&self.name)
    }
}

// ── ProjectSecret ─────────────────────────────────────────────────────────

/// `name` must match `^[A-Z_][A-Z0-9_]*$`; values are write-only to users.
#[derive(Debug, Clone)]
pub struct ProjectSecretMeta {
    pub project_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

pub fn is_valid_secret_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_uppercase() || c.is_ascii_digit())
}

// ── ApiToken ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApiTokenMeta {
    pub id: i64,
    pub prefix: String,
    pub token_hash: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

// ── SystemSettings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub allow_self_registration: bool,
    pub max_concurrent_builds: i64,
    pub artifact_retention_days: i64,
}

// ── Build-script step interface (external collaborator) ────────────────

/// A single named command produced by the build-script front-end, executed
/// in order by the orchestrator. The orchestrator treats steps opaquely
/// other than their name and execute contract (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub context: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    /// Seconds; `None` uses the executor's default, `Some(0)` means unlimited.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Result of running one step's command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub success: bool,
}
