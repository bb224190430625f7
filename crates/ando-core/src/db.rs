use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    ApiTokenMeta, Build, BuildArtifact, BuildLogEntry, BuildStatus, LogEntryType, NewBuild,
    Project, ProjectSecretMeta, SystemSettings, Trigger,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let required_secrets_json: String = row.get(11)?;
    let required_secrets: Vec<String> =
        serde_json::from_str(&required_secrets_json).unwrap_or_default();
    let last_build_at: Option<String> = row.get(13)?;
    let created_at: String = row.get(14)?;
    Ok(Project {
        id: row.get(0)?,
        external_repo_id: row.get(1)?,
        owner: row.get(2)?,
        name: row.get(3)?,
        default_branch: row.get(4)?,
        installation_id: row.get(5)?,
        webhook_secret: row.get(6)?,
        branch_filter: row.get(7)?,
        enable_pr_builds: row.get::<_, i64>(8)? != 0,
        timeout_minutes: row.get(9)?,
        container_image: row.get(10)?,
        profile: row.get(12)?,
        required_secrets,
        notify_on_failure: row.get::<_, i64>(15)? != 0,
        last_build_at: parse_ts_opt(last_build_at),
        created_at: parse_ts(&created_at),
    })
}

const PROJECT_COLUMNS: &str = "id, external_repo_id, owner, name, default_branch, installation_id, \
     webhook_secret, branch_filter, enable_pr_builds, timeout_minutes, container_image, \
     required_secrets, profile, last_build_at, created_at, notify_on_failure";

fn row_to_build(row: &rusqlite::Row<'_>) -> rusqlite::Result<Build> {
    let queued_at: String = row.get(13)?;
    let started_at: Option<String> = row.get(14)?;
    let finished_at: Option<String> = row.get(15)?;
    Ok(Build {
        id: row.get(0)?,
        project_id: row.get(1)?,
        commit_sha: row.get(2)?,
        branch: row.get(3)?,
        commit_message: row.get(4)?,
        commit_author: row.get(5)?,
        pull_request_number: row.get(6)?,
        status: BuildStatus::from_str_loose(&row.get::<_, String>(7)?),
        trigger: Trigger::from_str_loose(&row.get::<_, String>(8)?),
        steps_total: row.get(9)?,
        steps_completed: row.get(10)?,
        steps_failed: row.get(11)?,
        error_message: row.get(12)?,
        queued_at: parse_ts(&queued_at),
        started_at: parse_ts_opt(started_at),
        finished_at: parse_ts_opt(finished_at),
        job_id: row.get(16)?,
        cancel_requested: row.get::<_, i64>(17)? != 0,
    })
}

const BUILD_COLUMNS: &str = "id, project_id, commit_sha, branch, commit_message, commit_author, \
     pull_request_number, status, trigger, steps_total, steps_completed, steps_failed, \
     error_message, queued_at, started_at, finished_at, job_id, cancel_requested";

fn row_to_log_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildLogEntry> {
    let ts: String = row.get(4)?;
    Ok(BuildLogEntry {
        build_id: row.get(0)?,
        sequence: row.get::<_, i64>(1)? as u32,
        entry_type: LogEntryType::from_str_loose(&row.get::<_, String>(2)?),
        message: row.get(3)?,
        step_name: row.get(5)?,
        timestamp: parse_ts(&ts),
    })
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildArtifact> {
    let created_at: String = row.get(5)?;
    let expires_at: String = row.get(6)?;
    Ok(BuildArtifact {
        id: row.get(0)?,
        build_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        size_bytes: row.get(4)?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
    })
}

fn row_to_secret_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectSecretMeta> {
    let created_at: String = row.get(2)?;
    Ok(ProjectSecretMeta {
        project_id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiTokenMeta> {
    let created_at: String = row.get(4)?;
    Ok(ApiTokenMeta {
        id: row.get(0)?,
        prefix: row.get(1)?,
        token_hash: row.get(2)?,
        label: row.get(3)?,
        created_at: parse_ts(&created_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite db")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").context("failed to set PRAGMAs")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub fn insert_project(&self, p: &Project) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO projects (external_repo_id, owner, name, default_branch, \
             installation_id, webhook_secret, branch_filter, enable_pr_builds, timeout_minutes, \
             container_image, profile, required_secrets, notify_on_failure, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                p.external_repo_id,
                p.owner,
                p.name,
                p.default_branch,
                p.installation_id,
                p.webhook_secret,
                p.branch_filter,
                p.enable_pr_builds as i64,
                p.timeout_minutes,
                p.container_image,
                p.profile,
                serde_json::to_string(&p.required_secrets).unwrap_or_else(|_| "[]".into()),
                p.notify_on_failure as i64,
                fmt_ts(p.created_at),
            ],
        )
        .context("insert_project")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            row_to_project,
        )
        .optional()
        .context("get_project")
    }

    pub fn get_project_by_external_repo_id(&self, external_repo_id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE external_repo_id = ?1"),
            params![external_repo_id],
            row_to_project,
        )
        .optional()
        .context("get_project_by_external_repo_id")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id ASC"))?;
        let rows = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_projects")?;
        Ok(rows)
    }

    pub fn update_project_installation_id(&self, project_id: i64, installation_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE projects SET installation_id = ?1 WHERE id = ?2",
            params![installation_id, project_id],
        )
        .context("update_project_installation_id")?;
        Ok(())
    }

    pub fn touch_project_last_build(&self, project_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE projects SET last_build_at = ?1 WHERE id = ?2",
            params![now_str(), project_id],
        )
        .context("touch_project_last_build")?;
        Ok(())
    }

    pub fn delete_project(&self, project_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM projects WHERE id = ?1", params![project_id])
            .context("delete_project")?;
        Ok(())
    }

    // ── Builds + work queue (enqueue is one transaction: §4.1) ───────────

    /// Insert the build row, bump the project's `last_build_at`, and register
    /// a work-queue entry, all in one transaction; returns (build_id, job_id).
    pub fn enqueue_build(&self, nb: &NewBuild) -> Result<(i64, String)> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("enqueue_build: begin tx")?;
        let now = now_str();
        tx.execute(
            "INSERT INTO builds (project_id, commit_sha, branch, commit_message, commit_author, \
             pull_request_number, status, trigger, queued_at) \
             VALUES (?1,?2,?3,?4,?5,?6,'queued',?7,?8)",
            params![
                nb.project_id,
                nb.commit_sha,
                nb.branch,
                nb.commit_message,
                nb.commit_author,
                nb.pull_request_number,
                nb.trigger.as_str(),
                now,
            ],
        )
        .context("enqueue_build: insert build")?;
        let build_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO work_queue (build_id, status, created_at) VALUES (?1, 'pending', ?2)",
            params![build_id, now],
        )
        .context("enqueue_build: insert work_queue")?;
        let job_id = format!("job-{build_id}");

        tx.execute(
            "UPDATE builds SET job_id = ?1 WHERE id = ?2",
            params![job_id, build_id],
        )
        .context("enqueue_build: set job_id")?;

        tx.execute(
            "UPDATE projects SET last_build_at = ?1 WHERE id = ?2",
            params![now, nb.project_id],
        )
        .context("enqueue_build: touch project")?;

        tx.commit().context("enqueue_build: commit")?;
        Ok((build_id, job_id))
    }

    pub fn get_build(&self, id: i64) -> Result<Option<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = ?1"),
            params![id],
            row_to_build,
        )
        .optional()
        .context("get_build")
    }

    pub fn list_builds_for_project(&self, project_id: i64, limit: i64) -> Result<Vec<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![project_id, limit], row_to_build)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_builds_for_project")?;
        Ok(rows)
    }

    /// Pop up to `limit` pending work-queue entries, marking them dispatched.
    /// Returns the builds in FIFO order; callers hold them in-flight until done.
    pub fn claim_pending_builds(&self, limit: u32) -> Result<Vec<Build>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("claim_pending_builds: begin tx")?;
        let build_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT build_id FROM work_queue WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
            )?;
            stmt.query_map(params![limit], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("claim_pending_builds: select")?
        };
        for id in &build_ids {
            tx.execute(
                "UPDATE work_queue SET status = 'dispatched' WHERE build_id = ?1",
                params![id],
            )
            .context("claim_pending_builds: update")?;
        }
        let mut builds = Vec::with_capacity(build_ids.len());
        for id in build_ids {
            if let Some(b) = tx
                .query_row(
                    &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = ?1"),
                    params![id],
                    row_to_build,
                )
                .optional()
                .context("claim_pending_builds: load build")?
            {
                builds.push(b);
            }
        }
        tx.commit().context("claim_pending_builds: commit")?;
        Ok(builds)
    }

    /// Dequeue a build still in `Queued` state (cancel before pick-up).
    pub fn dequeue_build(&self, build_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn
            .execute(
                "UPDATE builds SET status = 'cancelled', finished_at = ?1 \
                 WHERE id = ?2 AND status = 'queued'",
                params![now_str(), build_id],
            )
            .context("dequeue_build")?;
        if updated > 0 {
            conn.execute(
                "UPDATE work_queue SET status = 'cancelled' WHERE build_id = ?1",
                params![build_id],
            )
            .context("dequeue_build: update queue")?;
        }
        Ok(updated > 0)
    }

    pub fn request_cancel(&self, build_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET cancel_requested = 1 WHERE id = ?1",
            params![build_id],
        )
        .context("request_cancel")?;
        Ok(())
    }

    pub fn mark_running(&self, build_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now_str(), build_id],
        )
        .context("mark_running")?;
        Ok(())
    }

    pub fn set_steps_total(&self, build_id: i64, total: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET steps_total = ?1 WHERE id = ?2",
            params![total, build_id],
        )
        .context("set_steps_total")?;
        Ok(())
    }

    pub fn increment_steps_completed(&self, build_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET steps_completed = steps_completed + 1 WHERE id = ?1",
            params![build_id],
        )
        .context("increment_steps_completed")?;
        Ok(())
    }

    pub fn increment_steps_failed(&self, build_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET steps_failed = steps_failed + 1 WHERE id = ?1",
            params![build_id],
        )
        .context("increment_steps_failed")?;
        Ok(())
    }

    pub fn finish_build(&self, build_id: i64, status: BuildStatus, error_message: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET status = ?1, error_message = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), error_message, now_str(), build_id],
        )
        .context("finish_build")?;
        conn.execute(
            "UPDATE work_queue SET status = 'done' WHERE build_id = ?1",
            params![build_id],
        )
        .context("finish_build: update queue")?;
        Ok(())
    }

    /// Restart recovery: builds stuck in `Running` from a prior crash.
    pub fn list_orphaned_running_builds(&self) -> Result<Vec<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE status = 'running'"))?;
        let rows = stmt
            .query_map([], row_to_build)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_orphaned_running_builds")?;
        Ok(rows)
    }

    // ── Webhook delivery dedupe (I5) ──────────────────────────────────────

    /// Returns `true` if this is the first time we've seen `delivery_id`.
    pub fn record_delivery_once(&self, delivery_id: &str, build_id: Option<i64>) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO webhook_deliveries (delivery_id, build_id, received_at) \
                 VALUES (?1, ?2, ?3)",
                params![delivery_id, build_id, now_str()],
            )
            .context("record_delivery_once")?;
        Ok(inserted > 0)
    }

    // ── Build log entries (C3 persistence) ────────────────────────────────

    pub fn max_log_sequence(&self, build_id: i64) -> Result<u32> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence) FROM build_log_entries WHERE build_id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .optional()
            .context("max_log_sequence")?
            .flatten();
        Ok(max.unwrap_or(0) as u32)
    }

    pub fn append_log_entry(&self, entry: &BuildLogEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO build_log_entries (build_id, sequence, entry_type, message, step_name, timestamp) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                entry.build_id,
                entry.sequence,
                entry.entry_type.as_str(),
                entry.message,
                entry.step_name,
                fmt_ts(entry.timestamp),
            ],
        )
        .context("append_log_entry")?;
        Ok(())
    }

    /// I4: exactly the entries with `sequence > after_sequence`, ascending.
    pub fn get_log_entries_since(
        &self,
        build_id: i64,
        after_sequence: u32,
        limit: u32,
    ) -> Result<Vec<BuildLogEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT build_id, sequence, entry_type, message, timestamp, step_name \
             FROM build_log_entries \
             WHERE build_id = ?1 AND sequence > ?2 \
             ORDER BY sequence ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![build_id, after_sequence, limit], row_to_log_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_log_entries_since")?;
        Ok(rows)
    }

    // ── Artifacts ─────────────────────────────────────────────────────────

    pub fn insert_artifact(&self, a: &BuildArtifact) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO build_artifacts (build_id, project_id, name, size_bytes, created_at, expires_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                a.build_id,
                a.project_id,
                a.name,
                a.size_bytes,
                fmt_ts(a.created_at),
                fmt_ts(a.expires_at),
            ],
        )
        .context("insert_artifact")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_artifacts_for_build(&self, build_id: i64) -> Result<Vec<BuildArtifact>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, build_id, project_id, name, size_bytes, created_at, expires_at \
             FROM build_artifacts WHERE build_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![build_id], row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_artifacts_for_build")?;
        Ok(rows)
    }

    pub fn list_expired_artifacts(&self) -> Result<Vec<BuildArtifact>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, build_id, project_id, name, size_bytes, created_at, expires_at \
             FROM build_artifacts WHERE expires_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![now_str()], row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_expired_artifacts")?;
        Ok(rows)
    }

    pub fn delete_artifact(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM build_artifacts WHERE id = ?1", params![id])
            .context("delete_artifact")?;
        Ok(())
    }

    // ── Project secrets ───────────────────────────────────────────────────

    pub fn upsert_secret(&self, project_id: i64, name: &str, encrypted_value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO project_secrets (project_id, name, encrypted_value, created_at) \
             VALUES (?1,?2,?3,?4) \
             ON CONFLICT(project_id, name) DO UPDATE SET encrypted_value = excluded.encrypted_value",
            params![project_id, name, encrypted_value, now_str()],
        )
        .context("upsert_secret")?;
        Ok(())
    }

    pub fn list_secret_names(&self, project_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT name FROM project_secrets WHERE project_id = ?1 ORDER BY name ASC")?;
        let rows = stmt
            .query_map(params![project_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_secret_names")?;
        Ok(rows)
    }

    /// Snapshot of all secrets for a project, decrypted by the caller. Reads
    /// are snapshot-isolated per §5: a build uses what was read at start.
    pub fn list_secrets_raw(&self, project_id: i64) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT name, encrypted_value FROM project_secrets WHERE project_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_secrets_raw")?;
        Ok(rows)
    }

    pub fn delete_secret(&self, project_id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM project_secrets WHERE project_id = ?1 AND name = ?2",
            params![project_id, name],
        )
        .context("delete_secret")?;
        Ok(())
    }

    #[allow(dead_code)]
    fn row_to_secret_meta_for_tests(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectSecretMeta> {
        row_to_secret_meta(row)
    }

    // ── API tokens ────────────────────────────────────────────────────────

    pub fn insert_token(&self, prefix: &str, token_hash: &str, label: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO api_tokens (prefix, token_hash, label, created_at) VALUES (?1,?2,?3,?4)",
            params![prefix, token_hash, label, now_str()],
        )
        .context("insert_token")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_tokens_by_prefix(&self, prefix: &str) -> Result<Vec<ApiTokenMeta>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, prefix, token_hash, label, created_at FROM api_tokens WHERE prefix = ?1",
        )?;
        let rows = stmt
            .query_map(params![prefix], row_to_token)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find_tokens_by_prefix")?;
        Ok(rows)
    }

    // ── System settings ───────────────────────────────────────────────────

    pub fn get_settings(&self) -> Result<SystemSettings> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT allow_self_registration, max_concurrent_builds, artifact_retention_days \
             FROM system_settings WHERE id = 1",
            [],
            |row| {
                Ok(SystemSettings {
                    allow_self_registration: row.get::<_, i64>(0)? != 0,
                    max_concurrent_builds: row.get(1)?,
                    artifact_retention_days: row.get(2)?,
                })
            },
        )
        .context("get_settings")
    }

    pub fn update_settings(&self, settings: &SystemSettings) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE system_settings SET allow_self_registration = ?1, max_concurrent_builds = ?2, \
             artifact_retention_days = ?3 WHERE id = 1",
            params![
                settings.allow_self_registration as i64,
                settings.max_concurrent_builds,
                settings.artifact_retention_days,
            ],
        )
        .context("update_settings")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trigger;

    fn test_project(db: &Db, branch_filter: &str) -> i64 {
        let p = Project {
            id: 0,
            external_repo_id: "123".into(),
            owner: "alice".into(),
            name: "app".into(),
            default_branch: "main".into(),
            installation_id: "".into(),
            webhook_secret: "whsec".into(),
            branch_filter: branch_filter.into(),
            enable_pr_builds: true,
            timeout_minutes: 15,
            container_image: None,
            profile: None,
            required_secrets: vec![],
            notify_on_failure: true,
            last_build_at: None,
            created_at: Utc::now(),
        };
        db.insert_project(&p).expect("insert project")
    }

    #[test]
    fn enqueue_build_is_one_transaction() {
        let db = Db::open_in_memory().expect("open");
        db.migrate().expect("migrate");
        let project_id = test_project(&db, "main");

        let (build_id, job_id) = db
            .enqueue_build(&NewBuild {
                project_id,
                commit_sha: "a".repeat(40),
                branch: "main".into(),
                commit_message: Some("msg".into()),
                commit_author: Some("alice".into()),
                pull_request_number: None,
                trigger: Trigger::Push,
            })
            .expect("enqueue");

        let build = db.get_build(build_id).expect("get").expect("exists");
        assert_eq!(build.status, BuildStatus::Queued);
        assert_eq!(build.job_id.as_deref(), Some(job_id.as_str()));

        let project = db.get_project(project_id).expect("get").expect("exists");
        assert!(project.last_build_at.is_some());
    }

    #[test]
    fn log_entries_since_returns_only_newer_sequences() {
        let db = Db::open_in_memory().expect("open");
        db.migrate().expect("migrate");
        let project_id = test_project(&db, "");
        let (build_id, _) = db
            .enqueue_build(&NewBuild {
                project_id,
                commit_sha: "b".repeat(40),
                branch: "main".into(),
                commit_message: None,
                commit_author: None,
                pull_request_number: None,
                trigger: Trigger::Push,
            })
            .expect("enqueue");

        for seq in 1..=9u32 {
            db.append_log_entry(&BuildLogEntry {
                build_id,
                sequence: seq,
                entry_type: LogEntryType::Output,
                message: format!("line {seq}"),
                step_name: None,
                timestamp: Utc::now(),
            })
            .expect("append");
        }

        let since = db.get_log_entries_since(build_id, 5, 1000).expect("get since");
        assert_eq!(since.len(), 4);
        assert_eq!(since.first().expect("first").sequence, 6);
        assert_eq!(since.last().expect("last").sequence, 9);
        assert_eq!(db.max_log_sequence(build_id).expect("max"), 9);
    }

    #[test]
    fn webhook_delivery_dedupe_is_first_write_wins() {
        let db = Db::open_in_memory().expect("open");
        db.migrate().expect("migrate");
        assert!(db.record_delivery_once("delivery-1", None).expect("first"));
        assert!(!db.record_delivery_once("delivery-1", None).expect("second"));
    }

    #[test]
    fn dequeue_build_only_affects_queued_state() {
        let db = Db::open_in_memory().expect("open");
        db.migrate().expect("migrate");
        let project_id = test_project(&db, "");
        let (build_id, _) = db
            .enqueue_build(&NewBuild {
                project_id,
                commit_sha: "c".repeat(40),
                branch: "main".into(),
                commit_message: None,
                commit_author: None,
                pull_request_number: None,
                trigger: Trigger::Manual,
            })
            .expect("enqueue");

        assert!(db.dequeue_build(build_id).expect("dequeue"));
        let build = db.get_build(build_id).expect("get").expect("exists");
        assert_eq!(build.status, BuildStatus::Cancelled);

        // Second cancel is a no-op (R3): already terminal, not re-queued.
        assert!(!db.dequeue_build(build_id).expect("dequeue again"));
    }
}
