//! GitHub push webhooks
//!
//! Parses push payloads, verifies `X-Hub-Signature-256` signatures and
//! decides whether a push should trigger a deployment.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// GitHub push event payload
#[derive(Debug, Deserialize)]
pub struct GitHubPushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub deleted: Option<bool>,
    pub repository: GitHubRepository,
}

#[derive(Debug, Deserialize)]
pub struct GitHubRepository {
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub clone_url: String,
}

/// A push reduced to what a deployment needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Branch name with `refs/heads/` stripped
    pub branch: String,
    /// Repository name, used as the site name
    pub site: String,
    pub clone_url: String,
    pub commit_sha: Option<String>,
    /// Whether the push deleted the branch
    pub deleted: bool,
}

impl PushEvent {
    /// Whether this push should trigger a deployment
    pub fn should_deploy(&self, deploy_branches: &[String]) -> bool {
        !self.deleted && deploy_branches.iter().any(|b| *b == self.branch)
    }
}

/// Parse a GitHub push event
pub fn parse_github_push(payload: &[u8]) -> Result<PushEvent> {
    let event: GitHubPushEvent =
        serde_json::from_slice(payload).context("Failed to parse GitHub push event")?;

    let branch = event
        .ref_name
        .strip_prefix("refs/heads/")
        .unwrap_or(&event.ref_name)
        .to_string();

    let deleted = event.deleted.unwrap_or(false) || event.after.as_deref() == Some(ZERO_SHA);

    debug!(
        repo = event.repository.full_name.as_deref().unwrap_or(&event.repository.name),
        branch = %branch,
        commit = event.after.as_deref().unwrap_or("-"),
        "Parsed GitHub push event"
    );

    Ok(PushEvent {
        branch,
        site: event.repository.name,
        clone_url: event.repository.clone_url,
        commit_sha: event.after,
        deleted,
    })
}

/// Verify a `sha256=<hex>` signature header against the payload
pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(provided) = signature.strip_prefix("sha256=") else {
        warn!("Invalid GitHub signature format");
        return false;
    };

    match verify_hmac_sha256(secret, payload, provided) {
        Ok(valid) => {
            if !valid {
                warn!("GitHub signature verification failed");
            }
            valid
        }
        Err(e) => {
            warn!(error = %e, "Signature verification error");
            false
        }
    }
}

/// Signature header value for `payload`
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_hmac_sha256(secret: &str, payload: &[u8], signature_hex: &str) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(payload);

    let expected_hex = hex::encode(mac.finalize().into_bytes());
    Ok(constant_time_compare(&expected_hex, &signature_hex.to_ascii_lowercase()))
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches() -> Vec<String> {
        vec!["main".to_string(), "master".to_string()]
    }

    fn push(git_ref: &str) -> serde_json::Value {
        serde_json::json!({
            "ref": git_ref,
            "after": "abc123",
            "before": "def456",
            "repository": {
                "name": "repo",
                "full_name": "owner/repo",
                "clone_url": "https://github.com/owner/repo.git",
                "ssh_url": "git@github.com:owner/repo.git"
            },
            "pusher": { "name": "test-user" }
        })
    }

    #[test]
    fn test_github_signature_verification() {
        let payload = b"test payload";
        let signature = sign_payload("test-secret", payload).unwrap();

        assert!(verify_github_signature("test-secret", payload, &signature));
        assert!(verify_github_signature("test-secret", payload, &signature.to_uppercase().replacen("SHA256", "sha256", 1)));
        assert!(!verify_github_signature("other-secret", payload, &signature));
        assert!(!verify_github_signature("test-secret", b"tampered", &signature));
        assert!(!verify_github_signature("test-secret", payload, "sha256=invalid"));
        assert!(!verify_github_signature("test-secret", payload, "sha1=abc"));
    }

    #[test]
    fn test_parse_github_push() {
        let event = parse_github_push(push("refs/heads/main").to_string().as_bytes()).unwrap();

        assert_eq!(event.branch, "main");
        assert_eq!(event.site, "repo");
        assert_eq!(event.clone_url, "https://github.com/owner/repo.git");
        assert_eq!(event.commit_sha.as_deref(), Some("abc123"));
        assert!(event.should_deploy(&branches()));
    }

    #[test]
    fn test_master_branch_deploys() {
        let event = parse_github_push(push("refs/heads/master").to_string().as_bytes()).unwrap();
        assert!(event.should_deploy(&branches()));
    }

    #[test]
    fn test_feature_branch_is_ignored() {
        let event =
            parse_github_push(push("refs/heads/feature/new-thing").to_string().as_bytes()).unwrap();

        assert_eq!(event.branch, "feature/new-thing");
        assert!(!event.should_deploy(&branches()));
    }

    #[test]
    fn test_tag_push_is_ignored() {
        let event = parse_github_push(push("refs/tags/main").to_string().as_bytes()).unwrap();
        assert!(!event.should_deploy(&branches()));
    }

    #[test]
    fn test_branch_deletion_is_ignored() {
        let mut payload = push("refs/heads/main");
        payload["after"] = serde_json::json!(ZERO_SHA);
        payload["deleted"] = serde_json::json!(true);

        let event = parse_github_push(payload.to_string().as_bytes()).unwrap();

        assert!(event.deleted);
        assert!(!event.should_deploy(&branches()));
    }

    #[test]
    fn test_minimal_payload() {
        let payload = br#"{"ref":"refs/heads/main","repository":{"name":"site","clone_url":"https://x/site.git"}}"#;
        let event = parse_github_push(payload).unwrap();
        assert_eq!(event.site, "site");
        assert_eq!(event.commit_sha, None);
    }

    #[test]
    fn test_invalid_payload() {
        assert!(parse_github_push(b"not json").is_err());
        assert!(parse_github_push(br#"{"ref":"refs/heads/main"}"#).is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
