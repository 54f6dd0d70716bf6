use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::Args;
use hex::encode as hex_encode;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq as _;
use url::Url;

use crate::app_error::PacError;
use crate::concurrency::RunState;
use crate::event::{Event, EventKind, ProviderKind, TriggerTarget};
use crate::provider::{Comment, ProviderAdapter};

#[derive(Debug, Clone, Args)]
pub struct GiteaConfig {
    #[arg(env = "GITEA_API_URL", long)]
    pub api_url: String,
    #[arg(env = "GITEA_TOKEN", hide_env_values = true, long)]
    pub token: String,
    #[arg(env = "GITEA_WEBHOOK_SECRET", hide_env_values = true, long)]
    pub webhook_secret: String,
    #[arg(env, long, default_value = "3")]
    pub gitea_max_retry: u32,
}

/// Gitea signs with HMAC-SHA256 like GitHub, but under `X-Gitea-Signature`
/// with a bare hex digest (no `sha256=` prefix).
pub fn verify_signature(headers: &HeaderMap, body: &str, secret: &str) -> Result<()> {
    let signature = headers
        .get("x-gitea-signature")
        .with_context(|| "missing x-gitea-signature header field")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .with_context(|| "HMAC creation failed")?;
    mac.update(body.as_bytes());
    let computed = hex_encode(mac.finalize().into_bytes());
    let choice = !computed.as_bytes().ct_eq(signature.as_bytes());
    if choice.into() {
        bail!("signature mismatch");
    }
    Ok(())
}

pub struct GiteaAdapter {
    client: ClientWithMiddleware,
    api_url: Url,
    token: String,
}

impl GiteaAdapter {
    pub fn new(config: &GiteaConfig) -> Result<Self> {
        let retry_policy = ExponentialBackoff::builder()
            .jitter(Jitter::Full)
            .build_with_max_retries(config.gitea_max_retry);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            client,
            api_url: Url::parse(&config.api_url)?,
            token: config.token.clone(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.api_url.join(path)?;
        Ok(self
            .client
            .request(Method::GET, url)
            .bearer_auth(&self.token)
            .send()
            .await?)
    }
}

#[async_trait]
impl ProviderAdapter for GiteaAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gitea
    }

    async fn parse(&self, body: &str) -> Result<Event, PacError> {
        #[derive(Deserialize)]
        struct Payload {
            #[serde(rename = "ref", default)]
            git_ref: Option<String>,
            #[serde(default)]
            after: Option<String>,
            repository: RepoPayload,
            sender: SenderPayload,
            #[serde(default)]
            pull_request: Option<PullRequestPayload>,
        }
        #[derive(Deserialize)]
        struct RepoPayload {
            name: String,
            html_url: String,
            default_branch: String,
            owner: OwnerPayload,
        }
        #[derive(Deserialize)]
        struct OwnerPayload {
            login: String,
        }
        #[derive(Deserialize)]
        struct SenderPayload {
            login: String,
        }
        #[derive(Deserialize)]
        struct PullRequestPayload {
            number: u64,
            head: RefPayload,
            base: RefPayload,
        }
        #[derive(Deserialize)]
        struct RefPayload {
            #[serde(rename = "ref")]
            git_ref: String,
            sha: String,
            repo: RepoHtmlOnly,
        }
        #[derive(Deserialize)]
        struct RepoHtmlOnly {
            html_url: String,
        }

        let payload: Payload = serde_json::from_str(body)
            .with_context(|| "failed to parse Gitea webhook payload")
            .map_err(PacError::MalformedPayload)?;

        let (event_kind, trigger, sha, base_branch, head_branch, base_url, head_url, pr_number) =
            if let Some(pr) = &payload.pull_request {
                (
                    EventKind::PullRequest,
                    TriggerTarget::PullRequest,
                    pr.head.sha.clone(),
                    pr.base.git_ref.clone(),
                    pr.head.git_ref.clone(),
                    pr.base.repo.html_url.clone(),
                    pr.head.repo.html_url.clone(),
                    Some(pr.number),
                )
            } else {
                let branch = payload
                    .git_ref
                    .clone()
                    .unwrap_or_default()
                    .trim_start_matches("refs/heads/")
                    .to_owned();
                (
                    EventKind::Push,
                    TriggerTarget::Push,
                    payload.after.clone().unwrap_or_default(),
                    branch.clone(),
                    branch,
                    payload.repository.html_url.clone(),
                    payload.repository.html_url.clone(),
                    None,
                )
            };

        Ok(Event {
            provider_kind: Some(ProviderKind::Gitea),
            event_kind: Some(event_kind),
            organization: payload.repository.owner.login.clone(),
            repository: payload.repository.name.clone(),
            sender: payload.sender.login.clone(),
            sha,
            base_branch,
            head_branch,
            base_url,
            head_url,
            pull_request_number: pr_number,
            trigger_target: Some(trigger),
            default_branch: payload.repository.default_branch.clone(),
            raw_payload: body.to_owned(),
            installation_token: None,
            delivery_id: String::new(),
            request_id: String::new(),
            pull_request_head_ref: None,
        })
    }

    async fn get_pipeline_manifests(&self, event: &Event) -> Result<Vec<Vec<u8>>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let path = format!("/repos/{owner}/{repo}/contents/.tekton?ref={}", event.sha);
        let res = self.get(&path).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct Entry {
            #[serde(rename = "type")]
            entry_type: String,
            path: String,
        }
        let entries: Vec<Entry> = res.json().await?;
        let mut manifests = Vec::new();
        for entry in entries.iter().filter(|e| e.entry_type == "file") {
            if let Some(bytes) = self.get_file(event, &entry.path, &event.sha).await? {
                manifests.push(bytes);
            }
        }
        Ok(manifests)
    }

    async fn get_file(&self, event: &Event, path: &str, git_ref: &str) -> Result<Option<Vec<u8>>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let url = format!("/repos/{owner}/{repo}/raw/{path}?ref={git_ref}");
        let res = self.get(&url).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(res.bytes().await?.to_vec()))
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(index) = event.pull_request_number else {
            return Ok(Vec::new());
        };
        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("/repos/{owner}/{repo}/issues/{index}/comments?limit=50&page={page}");
            let res = self.get(&path).await?;
            #[derive(Deserialize)]
            struct Entry {
                body: String,
                user: User,
            }
            #[derive(Deserialize)]
            struct User {
                login: String,
            }
            let page_comments: Vec<Entry> = res.json().await?;
            if page_comments.is_empty() {
                break;
            }
            comments.extend(page_comments.into_iter().map(|c| Comment {
                author: c.user.login,
                body: c.body,
            }));
            page += 1;
        }
        Ok(comments)
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool> {
        let path = format!("/orgs/{org}/public_members/{login}");
        let res = self.get(&path).await?;
        Ok(res.status().is_success())
    }

    async fn is_collaborator(&self, login: &str, repo: &str) -> Result<bool> {
        let path = format!("/repos/{repo}/collaborators/{login}");
        let res = self.get(&path).await?;
        Ok(res.status() == reqwest::StatusCode::NO_CONTENT)
    }

    async fn changed_files(&self, event: &Event) -> Result<Vec<String>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let path = format!("/repos/{owner}/{repo}/git/commits/{}", event.sha);
        let res = self.get(&path).await?;
        #[derive(Deserialize)]
        struct CommitResponse {
            #[serde(default)]
            files: Vec<FileEntry>,
        }
        #[derive(Deserialize)]
        struct FileEntry {
            filename: String,
        }
        let commit: CommitResponse = res.json().await.unwrap_or(CommitResponse { files: Vec::new() });
        Ok(commit.files.into_iter().map(|f| f.filename).collect())
    }

    async fn post_status(&self, event: &Event, state: RunState, url: &str, description: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let state_str = match state {
            RunState::Queued | RunState::Skipped => "pending",
            RunState::Running => "pending",
            RunState::Succeeded => "success",
            RunState::Failed => "failure",
            RunState::Cancelled => "error",
        };
        let req_url = self
            .api_url
            .join(&format!("/repos/{owner}/{repo}/statuses/{}", event.sha))?;
        self.client
            .request(Method::POST, req_url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "state": state_str,
                "target_url": url,
                "description": description,
                "context": "pacer",
            }))
            .send()
            .await?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(index) = event.pull_request_number else {
            return Ok(());
        };
        let url = self
            .api_url
            .join(&format!("/repos/{owner}/{repo}/issues/{index}/comments"))?;
        self.client
            .request(Method::POST, url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        Ok(())
    }

    async fn cancel_hint(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verification_requires_header() {
        let headers = HeaderMap::new();
        assert!(verify_signature(&headers, "body", "secret").is_err());
    }
}
