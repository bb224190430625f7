//! Integration tests exercising the end-to-end scenarios from spec.md §8
//! against a real (temporary, in-memory) SQLite database: webhook ingress
//! decisions feeding the store's enqueue/dedupe/cancel paths exactly as the
//! HTTP layer in `ando-server` wires them together.

use ando_core::db::Db;
use ando_core::ingress::{self, WebhookEvent};
use ando_core::types::{BuildStatus, NewBuild, Project, Trigger};
use chrono::Utc;

fn open_db() -> Db {
    let db = Db::open_in_memory().expect("open in-memory db");
    db.migrate().expect("migrate");
    db
}

fn insert_project(db: &Db, branch_filter: &str, enable_pr_builds: bool) -> Project {
    let project = Project {
        id: 0,
        external_repo_id: "42".into(),
        owner: "alice".into(),
        name: "app".into(),
        default_branch: "main".into(),
        installation_id: String::new(),
        webhook_secret: "whsec-test".into(),
        branch_filter: branch_filter.into(),
        enable_pr_builds,
        timeout_minutes: 15,
        container_image: None,
        profile: None,
        required_secrets: vec![],
        notify_on_failure: false,
        last_build_at: None,
        created_at: Utc::now(),
    };
    let id = db.insert_project(&project).expect("insert project");
    Project { id, ..project }
}

fn sign(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ── Scenario 1: happy push ──────────────────────────────────────────────

#[test]
fn scenario_happy_push_creates_queued_build() {
    let db = open_db();
    let project = insert_project(&db, "main", false);

    let body = br#"{
        "ref": "refs/heads/main",
        "after": "abc1230000000000000000000000000000000000",
        "repository": {"id": 42},
        "head_commit": {"id": "abc123", "message": "fix bug", "author": {"name": "alice"}}
    }"#;
    let sig = sign(&project.webhook_secret, body);
    assert!(ingress::verify_signature(&project.webhook_secret, body, &sig));

    let event = ingress::parse_event("push", body).expect("parse");
    let push = match event {
        WebhookEvent::Push(p) => p,
        _ => panic!("expected push event"),
    };
    assert!(ingress::should_build(&project, Trigger::Push, &push.branch));

    let (build_id, job_id) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: push.commit_sha.clone(),
            branch: push.branch.clone(),
            commit_message: push.commit_message.clone(),
            commit_author: push.commit_author.clone(),
            pull_request_number: None,
            trigger: Trigger::Push,
        })
        .expect("enqueue");

    let build = db.get_build(build_id).expect("get").expect("exists");
    assert_eq!(build.status, BuildStatus::Queued);
    assert_eq!(build.trigger, Trigger::Push);
    assert_eq!(build.commit_sha, "abc1230000000000000000000000000000000000");
    assert!(!job_id.is_empty());

    let reloaded_project = db.get_project(project.id).expect("get project").expect("exists");
    assert!(reloaded_project.last_build_at.is_some());
}

// ── Scenario 2: wrong signature ──────────────────────────────────────────

#[test]
fn scenario_wrong_signature_rejected_before_any_db_write() {
    let db = open_db();
    let project = insert_project(&db, "main", false);
    let body = br#"{"ref":"refs/heads/main","after":"a","repository":{"id":42}}"#;

    assert!(!ingress::verify_signature(
        &project.webhook_secret,
        body,
        "sha256=0000000000000000000000000000000000000000000000000000000000000000"
    ));

    assert!(db.list_builds_for_project(project.id, 100).expect("list").is_empty());
}

// ── Scenario 3: branch filter miss ───────────────────────────────────────

#[test]
fn scenario_branch_filter_miss_produces_no_build() {
    let db = open_db();
    let project = insert_project(&db, "main,master", false);

    let event = ingress::parse_event(
        "push",
        br#"{
            "ref": "refs/heads/feature/x",
            "after": "deadbeef",
            "repository": {"id": 42}
        }"#,
    )
    .expect("parse");
    let push = match event {
        WebhookEvent::Push(p) => p,
        _ => panic!("expected push"),
    };

    assert!(!ingress::should_build(&project, Trigger::Push, &push.branch));
    assert!(db.list_builds_for_project(project.id, 100).expect("list").is_empty());
}

// ── Branch deletion boundary behavior ────────────────────────────────────

#[test]
fn push_with_all_zeros_after_produces_no_build() {
    let db = open_db();
    let project = insert_project(&db, "main", false);

    let event = ingress::parse_event(
        "push",
        br#"{
            "ref": "refs/heads/main",
            "after": "0000000000000000000000000000000000000000",
            "repository": {"id": 42}
        }"#,
    )
    .expect("parse");

    assert!(matches!(event, WebhookEvent::Ignored(_)));
    assert!(db.list_builds_for_project(project.id, 100).expect("list").is_empty());
}

// ── Scenario 4: PR lifecycle ──────────────────────────────────────────────

#[test]
fn scenario_pr_opened_creates_build_with_formatted_message() {
    let db = open_db();
    let project = insert_project(&db, "", true);

    let body = format!(
        r#"{{
            "action": "opened",
            "number": 42,
            "repository": {{"id": 42}},
            "pull_request": {{
                "title": "Add auth",
                "head": {{"ref": "feature/auth", "sha": "{}"}},
                "user": {{"login": "bob"}}
            }}
        }}"#,
        "f".repeat(40)
    );
    let event = ingress::parse_event("pull_request", body.as_bytes()).expect("parse");

    let pr = match event {
        WebhookEvent::PullRequest(p) => p,
        _ => panic!("expected pull_request"),
    };
    assert!(ingress::pull_request_action_triggers_build(&pr.action));
    assert!(ingress::should_build(&project, Trigger::PullRequest, &pr.branch));

    let commit_message = format!("PR #{}: {}", pr.number, pr.commit_message.clone().unwrap_or_default());
    let (build_id, _) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: pr.commit_sha.clone(),
            branch: pr.branch.clone(),
            commit_message: Some(commit_message),
            commit_author: pr.commit_author.clone(),
            pull_request_number: Some(pr.number),
            trigger: Trigger::PullRequest,
        })
        .expect("enqueue");

    let build = db.get_build(build_id).expect("get").expect("exists");
    assert_eq!(build.trigger, Trigger::PullRequest);
    assert_eq!(build.pull_request_number, Some(42));
    let message = build.commit_message.expect("commit message");
    assert!(message.contains("PR #42"));
    assert!(message.contains("Add auth"));
}

#[test]
fn scenario_pr_closed_action_does_not_trigger_build() {
    assert!(!ingress::pull_request_action_triggers_build("closed"));
}

// ── I5 / webhook replay dedupe ────────────────────────────────────────────

#[test]
fn webhook_replay_same_delivery_id_produces_at_most_one_build() {
    let db = open_db();
    let project = insert_project(&db, "main", false);

    let delivery_id = "delivery-abc-123";
    let first_seen = db.record_delivery_once(delivery_id, None).expect("first record");
    assert!(first_seen);

    let (build_id, _) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: "a".repeat(40),
            branch: "main".into(),
            commit_message: None,
            commit_author: None,
            pull_request_number: None,
            trigger: Trigger::Push,
        })
        .expect("enqueue once");

    // A replayed delivery of the same webhook must be recognized as a dup
    // and must not enqueue a second build.
    let second_seen = db.record_delivery_once(delivery_id, Some(build_id)).expect("second record");
    assert!(!second_seen, "replayed delivery id must not be first-seen again");

    assert_eq!(db.list_builds_for_project(project.id, 100).expect("list").len(), 1);
}

// ── I2 / terminal-state invariant ─────────────────────────────────────────

#[test]
fn terminal_build_has_finished_at_and_ordered_timestamps() {
    let db = open_db();
    let project = insert_project(&db, "", false);
    let (build_id, _) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: "b".repeat(40),
            branch: "main".into(),
            commit_message: None,
            commit_author: None,
            pull_request_number: None,
            trigger: Trigger::Manual,
        })
        .expect("enqueue");

    db.mark_running(build_id).expect("mark running");
    db.finish_build(build_id, BuildStatus::Success, None).expect("finish");

    let build = db.get_build(build_id).expect("get").expect("exists");
    assert!(build.status.is_terminal());
    assert!(build.started_at.is_some());
    assert!(build.finished_at.is_some());
    assert!(build.queued_at <= build.started_at.unwrap());
    assert!(build.started_at.unwrap() <= build.finished_at.unwrap());
}

// ── R3 / idempotent cancel ────────────────────────────────────────────────

#[test]
fn cancelling_a_queued_build_twice_is_idempotent() {
    let db = open_db();
    let project = insert_project(&db, "", false);
    let (build_id, _) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: "c".repeat(40),
            branch: "main".into(),
            commit_message: None,
            commit_author: None,
            pull_request_number: None,
            trigger: Trigger::Manual,
        })
        .expect("enqueue");

    assert!(db.dequeue_build(build_id).expect("first cancel"));
    let after_first = db.get_build(build_id).expect("get").expect("exists").status;
    assert_eq!(after_first, BuildStatus::Cancelled);

    assert!(!db.dequeue_build(build_id).expect("second cancel"));
    let after_second = db.get_build(build_id).expect("get").expect("exists").status;
    assert_eq!(after_second, after_first);
}

// ── I4 / GetSince catch-up ────────────────────────────────────────────────

#[test]
fn get_since_returns_exactly_newer_sequence_entries_ascending() {
    use ando_core::types::{BuildLogEntry, LogEntryType};

    let db = open_db();
    let project = insert_project(&db, "", false);
    let (build_id, _) = db
        .enqueue_build(&NewBuild {
            project_id: project.id,
            commit_sha: "d".repeat(40),
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
    db.finish_build(build_id, BuildStatus::Success, None).expect("finish");

    let since = db.get_log_entries_since(build_id, 5, 1000).expect("since");
    assert_eq!(since.len(), 4);
    assert!(since.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(since.first().unwrap().sequence, 6);
    assert_eq!(since.last().unwrap().sequence, 9);

    let build = db.get_build(build_id).expect("get").expect("exists");
    assert!(build.status.is_terminal(), "is_complete corresponds to a terminal build");
}
