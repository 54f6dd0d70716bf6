use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::Args;
use http::HeaderMap;
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
pub struct GitlabConfig {
    #[arg(env = "GITLAB_API_URL", long, default_value = "https://gitlab.com/api/v4")]
    pub api_url: String,
    #[arg(env = "GITLAB_TOKEN", hide_env_values = true, long)]
    pub token: String,
    #[arg(env = "GITLAB_WEBHOOK_TOKEN", hide_env_values = true, long)]
    pub webhook_token: String,
    #[arg(env, long, default_value = "3")]
    pub gitlab_max_retry: u32,
}

pub fn verify_token(headers: &HeaderMap, expected: &str) -> Result<()> {
    let provided = headers
        .get("x-gitlab-token")
        .with_context(|| "missing x-gitlab-token header field")?
        .to_str()
        .with_context(|| "invalid x-gitlab-token header value")?;
    if provided != expected {
        bail!("gitlab token mismatch");
    }
    Ok(())
}

pub struct GitlabAdapter {
    client: ClientWithMiddleware,
    api_url: Url,
    token: String,
}

impl GitlabAdapter {
    pub fn new(config: &GitlabConfig) -> Result<Self> {
        let retry_policy = ExponentialBackoff::builder()
            .jitter(Jitter::Full)
            .build_with_max_retries(config.gitlab_max_retry);
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
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?)
    }
}

#[async_trait]
impl ProviderAdapter for GitlabAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
    }

    async fn parse(&self, body: &str) -> Result<Event, PacError> {
        #[derive(Deserialize)]
        struct Payload {
            object_kind: String,
            #[serde(rename = "ref", default)]
            git_ref: Option<String>,
            #[serde(default)]
            checkout_sha: Option<String>,
            #[serde(default)]
            user_username: Option<String>,
            project: ProjectPayload,
            #[serde(default)]
            object_attributes: Option<ObjectAttributes>,
        }
        #[derive(Deserialize)]
        struct ProjectPayload {
            path_with_namespace: String,
            web_url: String,
            default_branch: String,
        }
        #[derive(Deserialize)]
        struct ObjectAttributes {
            #[serde(default)]
            iid: Option<u64>,
            #[serde(default)]
            source_branch: Option<String>,
            #[serde(default)]
            target_branch: Option<String>,
            #[serde(default)]
            last_commit: Option<LastCommit>,
        }
        #[derive(Deserialize)]
        struct LastCommit {
            id: String,
        }

        let payload: Payload = serde_json::from_str(body)
            .with_context(|| "failed to parse GitLab webhook payload")
            .map_err(PacError::MalformedPayload)?;

        let (owner, repo) = payload
            .project
            .path_with_namespace
            .split_once('/')
            .unwrap_or((payload.project.path_with_namespace.as_str(), ""));

        let is_merge_request = payload.object_kind == "merge_request";
        let sha = if is_merge_request {
            payload
                .object_attributes
                .as_ref()
                .and_then(|a| a.last_commit.as_ref())
                .map(|c| c.id.clone())
                .unwrap_or_default()
        } else {
            payload.checkout_sha.clone().unwrap_or_default()
        };

        Ok(Event {
            provider_kind: Some(ProviderKind::Gitlab),
            event_kind: Some(if is_merge_request { EventKind::PullRequest } else { EventKind::Push }),
            organization: owner.to_owned(),
            repository: repo.to_owned(),
            sender: payload.user_username.clone().unwrap_or_default(),
            sha,
            base_branch: payload
                .object_attributes
                .as_ref()
                .and_then(|a| a.target_branch.clone())
                .or_else(|| payload.git_ref.clone().map(|r| r.trim_start_matches("refs/heads/").to_owned()))
                .unwrap_or_default(),
            head_branch: payload
                .object_attributes
                .as_ref()
                .and_then(|a| a.source_branch.clone())
                .or_else(|| payload.git_ref.clone().map(|r| r.trim_start_matches("refs/heads/").to_owned()))
                .unwrap_or_default(),
            base_url: payload.project.web_url.clone(),
            head_url: payload.project.web_url.clone(),
            pull_request_number: payload.object_attributes.as_ref().and_then(|a| a.iid),
            trigger_target: Some(if is_merge_request { TriggerTarget::PullRequest } else { TriggerTarget::Push }),
            default_branch: payload.project.default_branch.clone(),
            raw_payload: body.to_owned(),
            installation_token: None,
            delivery_id: String::new(),
            request_id: String::new(),
            pull_request_head_ref: None,
        })
    }

    async fn get_pipeline_manifests(&self, event: &Event) -> Result<Vec<Vec<u8>>> {
        let project = encoded_project(event);
        let path = format!("/projects/{project}/repository/tree?path=.tekton&ref={}&recursive=true", event.sha);
        let res = self.get(&path).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct TreeEntry {
            #[serde(rename = "type")]
            entry_type: String,
            path: String,
        }
        let entries: Vec<TreeEntry> = res.json().await?;
        let mut manifests = Vec::new();
        for entry in entries.iter().filter(|e| e.entry_type == "blob") {
            if let Some(bytes) = self.get_file(event, &entry.path, &event.sha).await? {
                manifests.push(bytes);
            }
        }
        Ok(manifests)
    }

    async fn get_file(&self, event: &Event, path: &str, git_ref: &str) -> Result<Option<Vec<u8>>> {
        let project = encoded_project(event);
        let encoded_path = urlencoding_path(path);
        let url = format!("/projects/{project}/repository/files/{encoded_path}/raw?ref={git_ref}");
        let res = self.get(&url).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(res.bytes().await?.to_vec()))
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let project = encoded_project(event);
        let Some(iid) = event.pull_request_number else {
            return Ok(Vec::new());
        };
        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("/projects/{project}/merge_requests/{iid}/notes?per_page=100&page={page}");
            let res = self.get(&path).await?;
            #[derive(Deserialize)]
            struct Note {
                body: String,
                author: NoteAuthor,
            }
            #[derive(Deserialize)]
            struct NoteAuthor {
                username: String,
            }
            let notes: Vec<Note> = res.json().await?;
            if notes.is_empty() {
                break;
            }
            comments.extend(notes.into_iter().map(|n| Comment {
                author: n.author.username,
                body: n.body,
            }));
            page += 1;
        }
        Ok(comments)
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool> {
        let path = format!("/groups/{org}/members/all?query={login}");
        let res = self.get(&path).await?;
        #[derive(Deserialize)]
        struct Member {
            username: String,
        }
        let members: Vec<Member> = res.json().await.unwrap_or_default();
        Ok(members.iter().any(|m| m.username.eq_ignore_ascii_case(login)))
    }

    async fn is_collaborator(&self, login: &str, repo: &str) -> Result<bool> {
        let encoded = urlencoding_path(repo);
        let path = format!("/projects/{encoded}/members/all?query={login}");
        let res = self.get(&path).await?;
        #[derive(Deserialize)]
        struct Member {
            username: String,
        }
        let members: Vec<Member> = res.json().await.unwrap_or_default();
        Ok(members.iter().any(|m| m.username.eq_ignore_ascii_case(login)))
    }

    async fn changed_files(&self, event: &Event) -> Result<Vec<String>> {
        let project = encoded_project(event);
        let path = format!("/projects/{project}/repository/commits/{}/diff", event.sha);
        let res = self.get(&path).await?;
        #[derive(Deserialize)]
        struct Diff {
            new_path: String,
        }
        let diffs: Vec<Diff> = res.json().await.unwrap_or_default();
        Ok(diffs.into_iter().map(|d| d.new_path).collect())
    }

    async fn post_status(&self, event: &Event, state: RunState, url: &str, description: &str) -> Result<()> {
        let project = encoded_project(event);
        let state_str = match state {
            RunState::Queued | RunState::Skipped => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "success",
            RunState::Failed => "failed",
            RunState::Cancelled => "canceled",
        };
        let req_url = self
            .api_url
            .join(&format!("/projects/{project}/statuses/{}", event.sha))?;
        self.client
            .request(Method::POST, req_url)
            .header("PRIVATE-TOKEN", &self.token)
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
        let project = encoded_project(event);
        let Some(iid) = event.pull_request_number else {
            return Ok(());
        };
        let url = self
            .api_url
            .join(&format!("/projects/{project}/merge_requests/{iid}/notes"))?;
        self.client
            .request(Method::POST, url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        Ok(())
    }

    async fn cancel_hint(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

fn encoded_project(event: &Event) -> String {
    urlencoding_path(&format!("{}/{}", event.organization, event.repository))
}

fn urlencoding_path(path: &str) -> String {
    path.replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_token_rejects_mismatch() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", "wrong".parse().unwrap());
        assert!(verify_token(&headers, "expected").is_err());
    }

    #[test]
    fn verify_token_accepts_match() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", "expected".parse().unwrap());
        assert!(verify_token(&headers, "expected").is_ok());
    }
}
