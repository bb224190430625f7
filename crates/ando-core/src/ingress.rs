//! Webhook ingress: signature verification and event parsing (C5).
//!
//! Pure functions only — no I/O, no database access — so the HTTP layer can
//! call these and then hand a validated `BuildRequest` to the store/queue.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::types::{Project, Trigger};

type HmacSha256 = Hmac<Sha256>;

/// Verify `X-Hub-Signature-256: sha256=<hex>` against the raw request body.
/// Constant-time; returns `false` on any malformed input rather than erroring,
/// since a malformed signature is simply an invalid request.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(given) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&given).is_ok()
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    Ping,
    /// Event type we don't act on; ingress acknowledges it with 200 and stops.
    Ignored(String),
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub external_repo_id: String,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub external_repo_id: String,
    pub action: String,
    pub branch: String,
    pub commit_sha: String,
    pub number: i64,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
}

#[derive(Deserialize)]
struct RawRepo {
    id: i64,
}

#[derive(Deserialize)]
struct RawCommit {
    id: String,
    message: Option<String>,
    author: Option<RawAuthor>,
}

#[derive(Deserialize)]
struct RawAuthor {
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: RawRepo,
    head_commit: Option<RawCommit>,
}

#[derive(Deserialize)]
struct RawPrPayload {
    action: String,
    number: i64,
    repository: RawRepo,
    pull_request: RawPullRequest,
}

#[derive(Deserialize)]
struct RawPullRequest {
    title: String,
    head: RawPrRef,
    #[serde(default)]
    user: Option<RawAuthorLogin>,
}

#[derive(Deserialize)]
struct RawAuthorLogin {
    login: Option<String>,
}

#[derive(Deserialize)]
struct RawPrRef {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

/// A branch-deletion push reports `after` as the all-zeros SHA; such a push
/// has no commit to build and must be ignored rather than enqueued.
fn is_all_zeros(sha: &str) -> bool {
    !sha.is_empty() && sha.chars().all(|c| c == '0')
}

/// Parse a webhook body given its `X-GitHub-Event`-style type header.
pub fn parse_event(event_type: &str, body: &[u8]) -> anyhow::Result<WebhookEvent> {
    match event_type {
        "ping" => Ok(WebhookEvent::Ping),
        "push" => {
            let raw: RawPushPayload = serde_json::from_slice(body)?;
            if is_all_zeros(&raw.after) {
                return Ok(WebhookEvent::Ignored("branch deletion".to_string()));
            }
            let branch = raw.git_ref.rsplit('/').next().unwrap_or(&raw.git_ref).to_string();
            let (commit_message, commit_author) = match raw.head_commit {
                Some(c) => (c.message, c.author.and_then(|a| a.name)),
                None => (None, None),
            };
            Ok(WebhookEvent::Push(PushEvent {
                external_repo_id: raw.repository.id.to_string(),
                branch,
                commit_sha: raw.after,
                commit_message,
                commit_author,
            }))
        }
        "pull_request" => {
            let raw: RawPrPayload = serde_json::from_slice(body)?;
            Ok(WebhookEvent::PullRequest(PullRequestEvent {
                external_repo_id: raw.repository.id.to_string(),
                action: raw.action,
                branch: raw.pull_request.head.git_ref,
                commit_sha: raw.pull_request.head.sha,
                number: raw.number,
                commit_message: Some(raw.pull_request.title),
                commit_author: raw.pull_request.user.and_then(|u| u.login),
            }))
        }
        other => Ok(WebhookEvent::Ignored(other.to_string())),
    }
}

/// §4.2: only `opened` and `synchronize` actions trigger a build; all other
/// pull_request actions (closed, labeled, reopened, ...) are accepted but inert.
pub fn pull_request_action_triggers_build(action: &str) -> bool {
    matches!(action, "opened" | "synchronize")
}

/// Applies the project's branch filter (push) or PR-builds toggle (pull_request)
/// to decide whether this event should enqueue a build.
pub fn should_build(project: &Project, trigger: Trigger, branch: &str) -> bool {
    match trigger {
        Trigger::Push => project.branch_allowed(branch),
        Trigger::PullRequest => project.enable_pr_builds,
        Trigger::Manual => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_roundtrip() {
        let body = br#"{"a":1}"#;
        let sig = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &sig));
        assert!(!verify_signature("wrongsecret", body, &sig));
    }

    #[test]
    fn signature_rejects_malformed_header() {
        assert!(!verify_signature("secret", b"body", "not-a-signature"));
        assert!(!verify_signature("secret", b"body", "sha256=zz"));
    }

    #[test]
    fn parse_push_extracts_branch_from_full_ref() {
        let body = br#"{
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": {"id": 42},
            "head_commit": {"id": "abc123", "message": "fix bug", "author": {"name": "alice"}}
        }"#;
        let event = parse_event("push", body).expect("parse");
        match event {
            WebhookEvent::Push(p) => {
                assert_eq!(p.branch, "main");
                assert_eq!(p.commit_sha, "abc123");
                assert_eq!(p.commit_message.as_deref(), Some("fix bug"));
            }
            _ => panic!("expected push event"),
        }
    }

    #[test]
    fn parse_pull_request_extracts_title_and_author() {
        let body = br#"{
            "action": "opened",
            "number": 42,
            "repository": {"id": 7},
            "pull_request": {
                "title": "Add auth",
                "head": {"ref": "feature/auth", "sha": "def456"},
                "user": {"login": "bob"}
            }
        }"#;
        let event = parse_event("pull_request", body).expect("parse");
        match event {
            WebhookEvent::PullRequest(p) => {
                assert_eq!(p.number, 42);
                assert_eq!(p.branch, "feature/auth");
                assert_eq!(p.commit_sha, "def456");
                assert_eq!(p.commit_message.as_deref(), Some("Add auth"));
                assert_eq!(p.commit_author.as_deref(), Some("bob"));
            }
            _ => panic!("expected pull_request event"),
        }
    }

    #[test]
    fn push_with_all_zeros_after_is_ignored_not_built() {
        let body = br#"{
            "ref": "refs/heads/main",
            "after": "0000000000000000000000000000000000000000",
            "repository": {"id": 42}
        }"#;
        let event = parse_event("push", body).expect("parse");
        assert!(matches!(event, WebhookEvent::Ignored(reason) if reason == "branch deletion"));
    }

    #[test]
    fn pull_request_only_opens_and_syncs_trigger() {
        assert!(pull_request_action_triggers_build("opened"));
        assert!(pull_request_action_triggers_build("synchronize"));
        assert!(!pull_request_action_triggers_build("closed"));
        assert!(!pull_request_action_triggers_build("labeled"));
    }

    #[test]
    fn unrecognized_event_type_is_ignored_not_an_error() {
        let event = parse_event("issues", b"{}").expect("parse");
        assert!(matches!(event, WebhookEvent::Ignored(_)));
    }
}
