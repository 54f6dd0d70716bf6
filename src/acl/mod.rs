pub mod owners;

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use crate::app_error::PacError;
use crate::event::{CommenterContext, Event, EventKind};
use crate::provider::ProviderAdapter;

static OK_TO_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^/ok-to-test\s*$").expect("static regex is valid"));
static RETEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^/retest\s*$").expect("static regex is valid"));
static TEST_NAMED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^/test\s+(\S+)\s*$").expect("static regex is valid"));

const OWNERS_PATH: &str = "OWNERS";
const OWNERS_ALIASES_PATH: &str = "OWNERS_ALIASES";

/// The 7-step decision ladder from spec §4.3. Fails with
/// `ProviderUnavailable` only on transport errors.
pub async fn is_allowed(provider: &dyn ProviderAdapter, event: &Event) -> Result<bool, PacError> {
    if check_ladder_steps_1_to_4(provider, event, &event.sender).await? {
        return Ok(true);
    }

    // Step 5: comment-based challenge-response. Pushes are never unlocked
    // by a comment — only PR-scoped events.
    if matches!(event.event_kind, Some(EventKind::IssueComment)) && event.pull_request_number.is_some() {
        let comments = provider
            .list_comments(event)
            .await
            .map_err(PacError::ProviderUnavailable)?;
        for comment in comments {
            let ctx = CommenterContext {
                origin_event: event.clone(),
                commenter_login: comment.author.clone(),
                comment_body: comment.body.clone(),
            };
            if let Some(unlocked) = evaluate_comment_challenge(provider, &ctx).await? {
                if unlocked {
                    return Ok(true);
                }
            }
        }
    }

    // Step 6: same-repo PR (no fork) implies branch-push trust already.
    if event.is_same_repo_pull_request() {
        return Ok(true);
    }

    Ok(false)
}

/// Re-evaluates the ladder with `sender := comment.author` for the
/// `/ok-to-test`, `/retest` and `/test <name>` comment forms. `/retest` and
/// `/test <name>` additionally require the commenter to be the PR author OR
/// pass steps 1-4 on their own. Preserves the same-sender open question
/// verbatim: even when the commenter equals the original sender, the ladder
/// is still re-evaluated rather than assumed to have already failed.
async fn evaluate_comment_challenge(
    provider: &dyn ProviderAdapter,
    ctx: &CommenterContext,
) -> Result<Option<bool>, PacError> {
    let body = ctx.comment_body.trim();

    if OK_TO_TEST_RE.is_match(body) {
        let allowed = check_ladder_steps_1_to_4(provider, &ctx.origin_event, &ctx.commenter_login).await?;
        return Ok(Some(allowed));
    }

    if RETEST_RE.is_match(body) || TEST_NAMED_RE.is_match(body) {
        let is_pr_author = ctx.commenter_login.eq_ignore_ascii_case(&ctx.origin_event.sender);
        if is_pr_author {
            return Ok(Some(true));
        }
        let allowed = check_ladder_steps_1_to_4(provider, &ctx.origin_event, &ctx.commenter_login).await?;
        return Ok(Some(allowed));
    }

    Ok(None)
}

async fn check_ladder_steps_1_to_4(
    provider: &dyn ProviderAdapter,
    event: &Event,
    sender: &str,
) -> Result<bool, PacError> {
    // Step 1: owner-as-sender.
    if sender.eq_ignore_ascii_case(&event.organization) {
        return Ok(true);
    }

    // Step 2: public org member.
    if provider
        .is_member_of_org(sender, &event.organization)
        .await
        .map_err(PacError::ProviderUnavailable)?
    {
        return Ok(true);
    }

    // Step 3: repository collaborator.
    let owner_repo = format!("{}/{}", event.organization, event.repository);
    if provider
        .is_collaborator(sender, &owner_repo)
        .await
        .map_err(PacError::ProviderUnavailable)?
    {
        return Ok(true);
    }

    // Step 4: OWNERS approver/reviewer on the default branch.
    let owners_bytes = provider
        .get_file(event, OWNERS_PATH, &event.default_branch)
        .await
        .map_err(PacError::ProviderUnavailable)?;
    let Some(owners_bytes) = owners_bytes else {
        return Ok(false);
    };
    let aliases_bytes = provider
        .get_file(event, OWNERS_ALIASES_PATH, &event.default_branch)
        .await
        .map_err(PacError::ProviderUnavailable)?;
    let owners = owners::OwnersSet::parse(&owners_bytes, aliases_bytes.as_deref())
        .map_err(PacError::Internal)?;
    Ok(owners.contains(sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Comment, MockProviderAdapter};

    fn event(sender: &str, pr_number: Option<u64>, event_kind: EventKind) -> Event {
        Event {
            sender: sender.to_owned(),
            organization: "owner".to_owned(),
            repository: "repo".to_owned(),
            default_branch: "main".to_owned(),
            pull_request_number: pr_number,
            event_kind: Some(event_kind),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn owner_as_sender_is_allowed() {
        let provider = MockProviderAdapter::new();
        let event = event("owner", None, EventKind::Push);
        assert!(is_allowed(&provider, &event).await.unwrap());
    }

    #[tokio::test]
    async fn ok_to_test_from_owner_allows_non_owner_sender() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_is_member_of_org().returning(|_, _| Ok(false));
        provider.expect_is_collaborator().returning(|_, _| Ok(false));
        provider.expect_get_file().returning(|_, _, _| Ok(None));
        provider.expect_list_comments().returning(|_| {
            Ok(vec![Comment {
                author: "owner".to_owned(),
                body: "/ok-to-test".to_owned(),
            }])
        });
        let event = event("nonowner", Some(1), EventKind::IssueComment);
        assert!(is_allowed(&provider, &event).await.unwrap());
    }

    #[tokio::test]
    async fn ok_to_test_from_non_owner_is_denied() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_is_member_of_org().returning(|_, _| Ok(false));
        provider.expect_is_collaborator().returning(|_, _| Ok(false));
        provider.expect_get_file().returning(|_, _, _| Ok(None));
        provider.expect_list_comments().returning(|_| {
            Ok(vec![Comment {
                author: "notowner".to_owned(),
                body: "/ok-to-test".to_owned(),
            }])
        });
        let event = event("nonowner", Some(1), EventKind::IssueComment);
        assert!(!is_allowed(&provider, &event).await.unwrap());
    }

    #[tokio::test]
    async fn push_events_are_not_unlocked_by_comments() {
        // Push events never call list_comments: no expectation set, mockall
        // panics on unexpected calls.
        let mut provider = MockProviderAdapter::new();
        provider.expect_is_member_of_org().returning(|_, _| Ok(false));
        provider.expect_is_collaborator().returning(|_, _| Ok(false));
        provider.expect_get_file().returning(|_, _, _| Ok(None));
        let event = event("nonowner", None, EventKind::Push);
        assert!(!is_allowed(&provider, &event).await.unwrap());
    }

    #[tokio::test]
    async fn same_repo_pull_request_is_allowed_without_comment() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_is_member_of_org().returning(|_, _| Ok(false));
        provider.expect_is_collaborator().returning(|_, _| Ok(false));
        provider.expect_get_file().returning(|_, _, _| Ok(None));
        let event = Event {
            pull_request_number: Some(1),
            base_url: "https://github.com/owner/repo".to_owned(),
            head_url: "https://github.com/owner/repo".to_owned(),
            ..event("nonowner", Some(1), EventKind::PullRequest)
        };
        assert!(is_allowed(&provider, &event).await.unwrap());
    }

    #[tokio::test]
    async fn owners_approver_is_allowed() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_is_member_of_org().returning(|_, _| Ok(false));
        provider.expect_is_collaborator().returning(|_, _| Ok(false));
        provider
            .expect_get_file()
            .withf(|_, path, _| path == "OWNERS")
            .returning(|_, _, _| Ok(Some(b"approvers:\n  - approved\n".to_vec())));
        provider
            .expect_get_file()
            .withf(|_, path, _| path == "OWNERS_ALIASES")
            .returning(|_, _, _| Ok(None));
        let event = event("approved", None, EventKind::PullRequest);
        assert!(is_allowed(&provider, &event).await.unwrap());
    }
}
