use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Args;
use hex::encode as hex_encode;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use jsonwebtoken::{encode as jwt_encode, Algorithm, EncodingKey, Header};
use octorust::types::ChecksCreateRequestConclusion;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq as _;
use tracing::{debug, info};
use url::Url;

use crate::app_error::PacError;
use crate::concurrency::RunState;
use crate::event::{Event, EventKind, ProviderKind};
use crate::provider::{Comment, ProviderAdapter};

const GITHUB_API_URL: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const OUR_USER_AGENT: &str = "pacer-github-adapter";

#[derive(Debug, Clone, Args)]
pub struct GithubAppConfig {
    #[arg(env = "GITHUB_APP_ID", long)]
    pub app_id: i64,
    #[arg(env = "GITHUB_INSTALLATION_ID", long)]
    pub installation_id: i64,
    #[arg(env = "GITHUB_PRIVATE_KEY", hide_env_values = true, long)]
    pub private_key: String,
    #[arg(env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true, long)]
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Args)]
pub struct GithubApiConfig {
    #[arg(env, long, default_value = "1s")]
    pub github_connect_timeout: humantime::Duration,
    #[arg(env, long, default_value = "10s")]
    pub github_read_timeout: humantime::Duration,
    #[arg(env, long, default_value = "3")]
    pub github_max_retry: u32,
    #[arg(env, long, default_value = "1s")]
    pub github_min_retry_interval: humantime::Duration,
    #[arg(env, long, default_value = "5m")]
    pub github_max_retry_interval: humantime::Duration,
}

pub fn reqwest_client(config: &GithubApiConfig) -> Result<ClientWithMiddleware> {
    let http = reqwest::Client::builder()
        .connect_timeout(config.github_connect_timeout.into())
        .read_timeout(config.github_read_timeout.into())
        .build()?;
    let retry_policy = ExponentialBackoff::builder()
        .jitter(Jitter::Full)
        .retry_bounds(
            config.github_min_retry_interval.into(),
            config.github_max_retry_interval.into(),
        )
        .build_with_max_retries(config.github_max_retry);
    Ok(ClientBuilder::new(http)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Verifies `X-Hub-Signature-256` in constant time.
pub fn verify_signature(headers: &HeaderMap, body: &str, secret: &str) -> Result<()> {
    let signature = headers
        .get("x-hub-signature-256")
        .with_context(|| "missing x-hub-signature-256 header field")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .with_context(|| "HMAC creation failed")?;
    mac.update(body.as_bytes());
    let computed = hex_encode(mac.finalize().into_bytes());
    let formatted = format!("sha256={computed}");
    let choice = !formatted.as_bytes().ct_eq(signature.as_bytes());
    if choice.into() {
        bail!("signature mismatch");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct InstallationAccessTokenResponse {
    token: String,
}

/// Fetches a GitHub App installation access token via JWT exchange.
async fn fetch_installation_token(client: &ClientWithMiddleware, app: &GithubAppConfig) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        iss: app.app_id.to_string(),
        iat: now.timestamp(),
        exp: (now + ChronoDuration::try_minutes(10).with_context(|| "invalid duration")?).timestamp(),
    };
    let header = Header::new(Algorithm::RS256);
    let key = EncodingKey::from_rsa_pem(app.private_key.as_bytes())
        .with_context(|| "failed to parse GitHub private key")?;
    let jwt = jwt_encode(&header, &claims, &key)?;

    let path = format!("/app/installations/{}/access_tokens", app.installation_id);
    let url = Url::parse(GITHUB_API_URL)?.join(&path)?;
    debug!(url = %url, "fetching installation access token");
    let res = client
        .request(Method::POST, url)
        .header("accept", "application/vnd.github+json")
        .bearer_auth(jwt)
        .header("x-github-api-version", GITHUB_API_VERSION)
        .header("user-agent", OUR_USER_AGENT)
        .send()
        .await?;
    let status = res.status();
    let body = res.bytes().await?;
    if status != reqwest::StatusCode::CREATED {
        bail!(
            "failed to fetch installation access token: code={status}, body:\n{}",
            String::from_utf8_lossy(&body)
        );
    }
    Ok(serde_json::from_slice::<InstallationAccessTokenResponse>(&body)?.token)
}

pub struct GithubAdapter {
    client: ClientWithMiddleware,
    app: GithubAppConfig,
}

impl GithubAdapter {
    pub fn new(api_config: &GithubApiConfig, app: GithubAppConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest_client(api_config)?,
            app,
        })
    }

    async fn token(&self) -> Result<String> {
        fetch_installation_token(&self.client, &self.app).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let token = self.token().await?;
        let url = Url::parse(GITHUB_API_URL)?.join(path)?;
        Ok(self
            .client
            .request(Method::GET, url)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(token)
            .header("x-github-api-version", GITHUB_API_VERSION)
            .header("user-agent", OUR_USER_AGENT)
            .send()
            .await?)
    }
}

#[async_trait]
impl ProviderAdapter for GithubAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    async fn parse(&self, body: &str) -> Result<Event, PacError> {
        #[derive(Debug, Deserialize)]
        struct Payload {
            action: Option<String>,
            repository: RepoPayload,
            sender: SenderPayload,
            #[serde(default)]
            pull_request: Option<PullRequestPayload>,
            #[serde(default)]
            comment: Option<CommentPayload>,
            #[serde(rename = "ref", default)]
            git_ref: Option<String>,
            #[serde(default)]
            after: Option<String>,
            #[serde(default)]
            before: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        struct RepoPayload {
            name: String,
            full_name: String,
            html_url: String,
            default_branch: String,
            owner: OwnerPayload,
        }

        #[derive(Debug, Deserialize)]
        struct OwnerPayload {
            login: String,
        }

        #[derive(Debug, Deserialize)]
        struct SenderPayload {
            login: String,
        }

        #[derive(Debug, Deserialize)]
        struct PullRequestPayload {
            number: u64,
            head: RefPayload,
            base: RefPayload,
        }

        #[derive(Debug, Deserialize)]
        struct RefPayload {
            #[serde(rename = "ref")]
            git_ref: String,
            sha: String,
            repo: RepoHtmlOnly,
        }

        #[derive(Debug, Deserialize)]
        struct RepoHtmlOnly {
            html_url: String,
        }

        #[derive(Debug, Deserialize)]
        struct CommentPayload {
            body: String,
        }

        let payload: Payload = serde_json::from_str(body)
            .with_context(|| "failed to parse GitHub webhook payload")
            .map_err(PacError::MalformedPayload)?;

        let (event_kind, trigger_target, sha, base_branch, head_branch, base_url, head_url, pr_number) =
            if let Some(pr) = &payload.pull_request {
                (
                    EventKind::PullRequest,
                    crate::event::TriggerTarget::PullRequest,
                    pr.head.sha.clone(),
                    pr.base.git_ref.clone(),
                    pr.head.git_ref.clone(),
                    pr.base.repo.html_url.clone(),
                    pr.head.repo.html_url.clone(),
                    Some(pr.number),
                )
            } else if payload.comment.is_some() {
                (
                    EventKind::IssueComment,
                    crate::event::TriggerTarget::OkToTestComment,
                    payload.after.clone().unwrap_or_default(),
                    String::new(),
                    String::new(),
                    payload.repository.html_url.clone(),
                    payload.repository.html_url.clone(),
                    None,
                )
            } else {
                (
                    EventKind::Push,
                    crate::event::TriggerTarget::Push,
                    payload.after.clone().unwrap_or_default(),
                    payload
                        .git_ref
                        .clone()
                        .unwrap_or_default()
                        .trim_start_matches("refs/heads/")
                        .to_owned(),
                    payload
                        .git_ref
                        .clone()
                        .unwrap_or_default()
                        .trim_start_matches("refs/heads/")
                        .to_owned(),
                    payload.repository.html_url.clone(),
                    payload.repository.html_url.clone(),
                    None,
                )
            };

        Ok(Event {
            provider_kind: Some(ProviderKind::Github),
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
            trigger_target: Some(trigger_target),
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
        struct ContentEntry {
            #[serde(rename = "type")]
            entry_type: String,
            path: String,
        }
        let entries: Vec<ContentEntry> = res.json().await?;
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
        let url = format!("/repos/{owner}/{repo}/contents/{path}?ref={git_ref}");
        let res = self.get(&url).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct ContentResponse {
            content: String,
        }
        let body: ContentResponse = res.json().await?;
        let cleaned: String = body.content.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD.decode(cleaned)?;
        Ok(Some(decoded))
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(number) = event.pull_request_number else {
            return Ok(Vec::new());
        };
        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("/repos/{owner}/{repo}/issues/{number}/comments?per_page=100&page={page}");
            let res = self.get(&path).await?;
            #[derive(Deserialize)]
            struct CommentEntry {
                body: String,
                user: CommentUser,
            }
            #[derive(Deserialize)]
            struct CommentUser {
                login: String,
            }
            let page_comments: Vec<CommentEntry> = res.json().await?;
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
        Ok(res.status() == reqwest::StatusCode::NO_CONTENT)
    }

    async fn is_collaborator(&self, login: &str, repo: &str) -> Result<bool> {
        let path = format!("/repos/{repo}/collaborators/{login}");
        let res = self.get(&path).await?;
        Ok(res.status() == reqwest::StatusCode::NO_CONTENT)
    }

    async fn changed_files(&self, event: &Event) -> Result<Vec<String>> {
        let owner = &event.organization;
        let repo = &event.repository;
        let path = format!("/repos/{owner}/{repo}/commits/{}", event.sha);
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
        let commit: CommitResponse = res.json().await?;
        Ok(commit.files.into_iter().map(|f| f.filename).collect())
    }

    async fn post_status(&self, event: &Event, state: RunState, url: &str, description: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let (status, conclusion) = run_state_to_check_run(state);
        info!(owner, repo, sha = %event.sha, ?state, "posting GitHub check-run status");
        let token = self.token().await?;
        let req_url = Url::parse(GITHUB_API_URL)?.join(&format!("/repos/{owner}/{repo}/check-runs"))?;
        let body = serde_json::json!({
            "name": "pacer",
            "head_sha": event.sha,
            "status": status,
            "conclusion": conclusion,
            "details_url": url,
            "output": { "title": "pacer", "summary": description },
        });
        self.client
            .request(Method::POST, req_url)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(token)
            .header("x-github-api-version", GITHUB_API_VERSION)
            .header("user-agent", OUR_USER_AGENT)
            .json(&body)
            .send()
            .await?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<()> {
        let owner = &event.organization;
        let repo = &event.repository;
        let Some(number) = event.pull_request_number else {
            return Ok(());
        };
        let token = self.token().await?;
        let url = Url::parse(GITHUB_API_URL)?.join(&format!("/repos/{owner}/{repo}/issues/{number}/comments"))?;
        self.client
            .request(Method::POST, url)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(token)
            .header("x-github-api-version", GITHUB_API_VERSION)
            .header("user-agent", OUR_USER_AGENT)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        Ok(())
    }

    async fn cancel_hint(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

fn run_state_to_check_run(state: RunState) -> (&'static str, Option<&'static str>) {
    match state {
        RunState::Queued => ("queued", None),
        RunState::Running => ("in_progress", None),
        RunState::Succeeded => ("completed", Some(conclusion_str(ChecksCreateRequestConclusion::Success))),
        RunState::Failed => ("completed", Some(conclusion_str(ChecksCreateRequestConclusion::Failure))),
        RunState::Cancelled => ("completed", Some(conclusion_str(ChecksCreateRequestConclusion::Cancelled))),
        RunState::Skipped => ("completed", Some(conclusion_str(ChecksCreateRequestConclusion::Neutral))),
    }
}

fn conclusion_str(c: ChecksCreateRequestConclusion) -> &'static str {
    match c {
        ChecksCreateRequestConclusion::Success => "success",
        ChecksCreateRequestConclusion::Failure => "failure",
        ChecksCreateRequestConclusion::Cancelled => "cancelled",
        ChecksCreateRequestConclusion::Neutral => "neutral",
        _ => "neutral",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verification_rejects_bad_signature() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());
        assert!(verify_signature(&headers, "body", "secret").is_err());
    }

    #[test]
    fn signature_verification_accepts_matching_signature() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"payload");
        let computed = hex_encode(mac.finalize().into_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            format!("sha256={computed}").parse().unwrap(),
        );
        assert!(verify_signature(&headers, "payload", "secret").is_ok());
    }

    #[tokio::test]
    async fn parses_push_event() {
        let adapter = GithubAdapter {
            client: reqwest_client(&GithubApiConfig {
                github_connect_timeout: std::time::Duration::from_secs(1).into(),
                github_read_timeout: std::time::Duration::from_secs(1).into(),
                github_max_retry: 0,
                github_min_retry_interval: std::time::Duration::from_secs(1).into(),
                github_max_retry_interval: std::time::Duration::from_secs(1).into(),
            })
            .unwrap(),
            app: GithubAppConfig {
                app_id: 1,
                installation_id: 1,
                private_key: String::new(),
                webhook_secret: String::new(),
            },
        };
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "deadbeef",
            "repository": {
                "name": "repo",
                "full_name": "owner/repo",
                "html_url": "https://github.com/owner/repo",
                "default_branch": "main",
                "owner": { "login": "owner" },
            },
            "sender": { "login": "alice" },
        })
        .to_string();
        let event = adapter.parse(&body).await.unwrap();
        assert_eq!(event.event_kind, Some(EventKind::Push));
        assert_eq!(event.sha, "deadbeef");
        assert_eq!(event.base_branch, "main");
    }
}
