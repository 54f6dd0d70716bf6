pub mod normalizer;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Which Git provider originated an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    Github,
    Gitlab,
    Gitea,
    Bitbucket,
}

/// The normalized shape of the inbound notification, independent of what
/// provider-specific action string produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    IssueComment,
    CheckRunRerequested,
}

/// What unlocked the run: a direct push/PR event, or a comment-based
/// challenge-response. Carried separately from `EventKind` so the ACL engine
/// can tell a `/ok-to-test` comment apart from the PR event it is unlocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TriggerTarget {
    Push,
    PullRequest,
    OkToTestComment,
    RetestComment,
}

/// Immutable record describing one inbound provider notification.
///
/// Invariant: `(sha, repository)` identifies the code state under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub provider_kind: Option<ProviderKind>,
    pub event_kind: Option<EventKind>,
    pub organization: String,
    pub repository: String,
    pub sender: String,
    pub sha: String,
    pub base_branch: String,
    pub head_branch: String,
    pub base_url: String,
    pub head_url: String,
    pub pull_request_number: Option<u64>,
    pub trigger_target: Option<TriggerTarget>,
    pub default_branch: String,
    pub raw_payload: String,
    #[serde(skip_serializing)]
    pub installation_token: Option<String>,

    /// Provider's redelivery-stable identifier for this webhook delivery.
    pub delivery_id: String,
    /// Unique per delivery; used for idempotency keys and log correlation.
    pub request_id: String,
    /// Branch name backing `head_branch`, used for environment templating
    /// when `head_branch` itself has been rewritten (e.g. merge refs).
    pub pull_request_head_ref: Option<String>,
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Github
    }
}

impl Event {
    /// A PR is "same-repo" (not a fork) when its base and head clone URLs
    /// match. See the ACL ladder step 6 in `acl::mod`.
    pub fn is_same_repo_pull_request(&self) -> bool {
        self.pull_request_number.is_some() && self.base_url == self.head_url
    }

    pub fn canonical_repo_url(&self) -> &str {
        &self.base_url
    }
}

/// For `ok-to-test`/`retest` comments: the ACL engine re-evaluates the
/// ladder with `sender := commenter_login`, never mutating the underlying
/// event's own `sender`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommenterContext {
    pub origin_event: Event,
    pub commenter_login: String,
    pub comment_body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn same_repo_pull_request_detects_fork() {
        let mut event = Event {
            pull_request_number: Some(1),
            base_url: "https://github.com/owner/repo".to_owned(),
            head_url: "https://github.com/owner/repo".to_owned(),
            ..Default::default()
        };
        assert!(event.is_same_repo_pull_request());

        event.head_url = "https://github.com/fork/repo".to_owned();
        assert!(!event.is_same_repo_pull_request());
    }

    #[test]
    fn event_roundtrips_through_json() {
        let event = Event {
            sha: "deadbeef".to_owned(),
            repository: "repo".to_owned(),
            organization: "owner".to_owned(),
            event_kind: Some(EventKind::PullRequest),
            provider_kind: Some(ProviderKind::Github),
            ..Default::default()
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.sha, back.sha);
        assert_eq!(event.event_kind, back.event_kind);
    }
}
