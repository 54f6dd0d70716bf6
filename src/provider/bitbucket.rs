use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::Args;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use serde::Deserialize;
use url::Url;

use crate::app_error::PacError;
use crate::concurrency::RunState;
use crate::event::{Event, EventKind, ProviderKind, TriggerTarget};
use crate::provider::{Comment, ProviderAdapter};

#[derive(Debug, Clone, Args)]
pub struct BitbucketConfig {
    #[arg(env = "BITBUCKET_API_URL", long, default_value = "https://api.bitbucket.org/2.0")]
    pub api_url: String,
    #[arg(env = "BITBUCKET_USER", long)]
    pub user: String,
    #[arg(env = "BITBUCKET_APP_PASSWORD", hide_env_values = true, long)]
    pub app_password: String,
    #[arg(env, long, default_value = "3")]
    pub bitbucket_max_retry: u32,
}

/// Bitbucket has no shared-secret HMAC header; it identifies itself by the
/// `X-Event-Key` header and (for Cloud webhooks) an optional UUID that is
/// validated by source IP allow-listing at the ingress layer, not here.
pub struct BitbucketAdapter {
    client: ClientWithMiddleware,
    api_url: Url,
    user: String,
    app_password: String,
}

impl BitbucketAdapter {
    pub fn new(config: &BitbucketConfig) -> Result<Self> {
        let retry_policy = ExponentialBackoff::builder()
            .jitter(Jitter::Full)
            .build_with_max_retries(config.bitbucket_max_retry);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            client,
            api_url: Url::parse(&config.api_url)?,
            user: config.user.clone(),
            app_password: config.app_password.clone(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.api_url.join(path)?;
        Ok(self
            .client
            .request(Method::GET, url)
            .basic_auth(&self.user, Some(&self.app_password))
            .send()
            .await?)
    }
}

#[async_trait]
impl ProviderAdapter for BitbucketAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Bitbucket
    }

    async fn parse(&self, body: &str) -> Result<Event, PacError> {
        #[derive(Deserialize)]
        struct Payload {
            repository: RepoPayload,
            actor: ActorPayload,
            #[serde(default)]
            push: Option<PushPayload>,
            #[serde(default)]
            pullrequest: Option<PullRequestPayload>,
        }
        #[derive(Deserialize)]
        struct RepoPayload {
            name: String,
            #[serde(default)]
            full_name: String,
            #[serde(default)]
            links: Links,
            #[serde(default)]
            mainbranch: Option<MainBranch>,
        }
        #[derive(Deserialize, Default)]
        struct Links {
            #[serde(default)]
            html: Option<HtmlLink>,
        }
        #[derive(Deserialize)]
        struct HtmlLink {
            href: String,
        }
        #[derive(Deserialize)]
        struct MainBranch {
            name: String,
        }
        #[derive(Deserialize)]
        struct ActorPayload {
            username: Option<String>,
            nickname: Option<String>,
        }
        #[derive(Deserialize)]
        struct PushPayload {
            changes: Vec<PushChange>,
        }
        #[derive(Deserialize)]
        struct PushChange {
            new: Option<BranchRef>,
        }
        #[derive(Deserialize)]
        struct BranchRef {
            name: String,
            target: CommitRef,
        }
        #[derive(Deserialize)]
        struct CommitRef {
            hash: String,
        }
        #[derive(Deserialize)]
        struct PullRequestPayload {
            id: u64,
            source: PrSide,
            destination: PrSide,
        }
        #[derive(Deserialize)]
        struct PrSide {
            branch: BranchName,
            commit: CommitRef,
        }
        #[derive(Deserialize)]
        struct BranchName {
            name: String,
        }

        let payload: Payload = serde_json::from_str(body)
            .with_context(|| "failed to parse Bitbucket webhook payload")
            .map_err(PacError::MalformedPayload)?;

        let (owner, repo) = payload
            .repository
            .full_name
            .split_once('/')
            .unwrap_or(("", payload.repository.name.as_str()));
        let repo_url = payload
            .repository
            .links
            .html
            .map(|h| h.href)
            .unwrap_or_default();
        let sender = payload
            .actor
            .username
            .or(payload.actor.nickname)
            .unwrap_or_default();

        if let Some(pr) = payload.pullrequest {
            return Ok(Event {
                provider_kind: Some(ProviderKind::Bitbucket),
                event_kind: Some(EventKind::PullRequest),
                organization: owner.to_owned(),
                repository: repo.to_owned(),
                sender,
                sha: pr.source.commit.hash,
                base_branch: pr.destination.branch.name,
                head_branch: pr.source.branch.name,
                base_url: repo_url.clone(),
                head_url: repo_url,
                pull_request_number: Some(pr.id),
                trigger_target: Some(TriggerTarget::PullRequest),
                default_branch: payload
                    .repository
                    .mainbranch
                    .map(|b| b.name)
                    .unwrap_or_default(),
                raw_payload: body.to_owned(),
                installation_token: None,
                delivery_id: String::new(),
                request_id: String::new(),
                pull_request_head_ref: None,
            });
        }

        let change = payload
            .push
            .and_then(|p| p.changes.into_iter().next())
            .and_then(|c| c.new);
        let (branch, sha) = change
            .map(|b| (b.name, b.target.hash))
            .unwrap_or_default();

        Ok(Event {
            provider_kind: Some(ProviderKind::Bitbucket),
            event_kind: Some(EventKind::Push),
            organization: owner.to_owned(),
            repository: repo.to_owned(),
            sender,
            sha,
            base_branch: branch.clone(),
            head_branch: branch,
            base_url: repo_url.clone(),
            head_url: repo_url,
            pull_request_number: None,
            trigger_target: Some(TriggerTarget::Push),
            default_branch: payload
                .repository
                .mainbranch
                .map(|b| b.name)
                .unwrap_or_default(),
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
        let path = format!("/repositories/{owner}/{repo}/src/{}/.tekton/", event.sha);
        let res = self.get(&path).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct Listing {
            values: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct Entry {
            path: String,
            #[serde(rename = "type")]
            entry_type: String,
        }
        let listing: Listing = res.json().await?;
        let mut manifests = Vec::new();
        for entry in listing.values.iter().filter(|e| e.entry_type == "commit_file") {
            if let Some(bytes) = self.get_file(event, &entry.path, &event.sha).await? {
                manifests.push(bytes);
            }
        }
        Ok(manifests)
    }

    async fn get_file(&self, event: &Event, path: &str, git_ref: &str) -> Result<Option<Vec<u8>>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let url = format!("/repositories/{owner}/{repo}/src/{git_ref}/{path}");
        let res = self.get(&url).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(res.bytes().await?.to_vec()))
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(id) = event.pull_request_number else {
            return Ok(Vec::new());
        };
        let mut comments = Vec::new();
        let mut path = format!("/repositories/{owner}/{repo}/pullrequests/{id}/comments");
        loop {
            let res = self.get(&path).await?;
            #[derive(Deserialize)]
            struct Listing {
                values: Vec<Entry>,
                next: Option<String>,
            }
            #[derive(Deserialize)]
            struct Entry {
                content: Content,
                user: User,
            }
            #[derive(Deserialize)]
            struct Content {
                raw: String,
            }
            #[derive(Deserialize)]
            struct User {
                #[serde(default)]
                nickname: Option<String>,
                #[serde(default)]
                username: Option<String>,
            }
            let listing: Listing = res.json().await?;
            comments.extend(listing.values.into_iter().map(|e| Comment {
                author: e.user.username.or(e.user.nickname).unwrap_or_default(),
                body: e.content.raw,
            }));
            match listing.next {
                Some(next_url) => path = next_url,
                None => break,
            }
        }
        Ok(comments)
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool> {
        let path = format!("/workspaces/{org}/members/{login}");
        let res = self.get(&path).await?;
        Ok(res.status().is_success())
    }

    async fn is_collaborator(&self, login: &str, repo: &str) -> Result<bool> {
        let path = format!("/repositories/{repo}/permissions-config/users/{login}");
        let res = self.get(&path).await?;
        Ok(res.status().is_success())
    }

    async fn changed_files(&self, event: &Event) -> Result<Vec<String>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let path = format!("/repositories/{owner}/{repo}/diffstat/{}", event.sha);
        let res = self.get(&path).await?;
        #[derive(Deserialize)]
        struct Listing {
            values: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct Entry {
            new: Option<FileRef>,
        }
        #[derive(Deserialize)]
        struct FileRef {
            path: String,
        }
        let listing: Listing = res.json().await.unwrap_or(Listing { values: Vec::new() });
        Ok(listing.values.into_iter().filter_map(|e| e.new).map(|f| f.path).collect())
    }

    async fn post_status(&self, event: &Event, state: RunState, url: &str, description: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let state_str = match state {
            RunState::Queued | RunState::Skipped | RunState::Running => "INPROGRESS",
            RunState::Succeeded => "SUCCESSFUL",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "STOPPED",
        };
        let req_url = self
            .api_url
            .join(&format!("/repositories/{owner}/{repo}/commit/{}/statuses/build", event.sha))?;
        self.client
            .request(Method::POST, req_url)
            .basic_auth(&self.user, Some(&self.app_password))
            .json(&serde_json::json!({
                "state": state_str,
                "key": "pacer",
                "url": url,
                "description": description,
            }))
            .send()
            .await?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(id) = event.pull_request_number else {
            return Ok(());
        };
        let url = self
            .api_url
            .join(&format!("/repositories/{owner}/{repo}/pullrequests/{id}/comments"))?;
        self.client
            .request(Method::POST, url)
            .basic_auth(&self.user, Some(&self.app_password))
            .json(&serde_json::json!({ "content": { "raw": body } }))
            .send()
            .await?;
        Ok(())
    }

    async fn cancel_hint(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}
