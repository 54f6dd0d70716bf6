pub mod bitbucket;
pub mod gitea;
pub mod github;
pub mod gitlab;

use anyhow::Result;
use async_trait::async_trait;
use http::HeaderMap;

use crate::app_error::PacError;
use crate::event::{Event, ProviderKind};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comment {
    pub author: String,
    pub body: String,
}

/// A capability set uniform across providers (spec §4.1). One concrete
/// variant per provider, never selected by runtime type reflection on the
/// payload — see `detect` below, which inspects headers only.
#[allow(clippy::indexing_slicing)] // For automock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_kind(&self) -> ProviderKind;

    async fn parse(&self, body: &str) -> Result<Event, PacError>;

    /// Fetches all files under `.tekton/` at `event.sha`, recursively.
    async fn get_pipeline_manifests(&self, event: &Event) -> Result<Vec<Vec<u8>>>;

    async fn get_file(&self, event: &Event, path: &str, git_ref: &str) -> Result<Option<Vec<u8>>>;

    /// Paginated; implementations must exhaust pagination.
    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>>;

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool>;

    /// `repo` is the full `owner/repo` slug, not the bare repository name.
    async fn is_collaborator(&self, login: &str, repo: &str) -> Result<bool>;

    async fn changed_files(&self, event: &Event) -> Result<Vec<String>>;

    /// At-least-once.
    async fn post_status(
        &self,
        event: &Event,
        state: crate::concurrency::RunState,
        url: &str,
        description: &str,
    ) -> Result<()>;

    async fn post_comment(&self, event: &Event, body: &str) -> Result<()>;

    /// Optional provider-side UI cue; failures are non-fatal.
    async fn cancel_hint(&self, event: &Event) -> Result<()>;
}

/// Inspects headers only (never payload reflection) and classifies the
/// request to a `ProviderKind`. Returns `None` when the request matches no
/// known provider's header shape ("NotOurs" in spec terms).
pub fn detect(headers: &HeaderMap) -> Option<ProviderKind> {
    if headers.contains_key("x-github-event") {
        return Some(ProviderKind::Github);
    }
    if headers.contains_key("x-gitlab-event") {
        return Some(ProviderKind::Gitlab);
    }
    if headers.contains_key("x-gitea-event") || headers.contains_key("x-gogs-event") {
        return Some(ProviderKind::Gitea);
    }
    if headers.contains_key("x-event-key") {
        return Some(ProviderKind::Bitbucket);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_github_by_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "push".parse().unwrap());
        assert_eq!(detect(&headers), Some(ProviderKind::Github));
    }

    #[test]
    fn detects_gitlab_by_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", "Push Hook".parse().unwrap());
        assert_eq!(detect(&headers), Some(ProviderKind::Gitlab));
    }

    #[test]
    fn unknown_headers_detect_nothing() {
        let headers = HeaderMap::new();
        assert_eq!(detect(&headers), None);
    }
}
