mod health;
mod webhook;

pub use health::{live, ready};
pub use webhook::webhook;

use std::sync::Arc;

use http::HeaderMap;

use crate::app_error::PacError;
use crate::event::ProviderKind;
use crate::front::config::FrontConfig;
use crate::provider::bitbucket::BitbucketAdapter;
use crate::provider::gitea::GiteaAdapter;
use crate::provider::github::GithubAdapter;
use crate::provider::gitlab::GitlabAdapter;
use crate::provider::{self, ProviderAdapter};
use crate::repository::RepositoryCache;
use crate::status::StatusReporter;
use crate::tekton::TektonClient;

/// Holds the configured provider adapters and the secret needed to verify
/// each one's signature scheme, and dispatches a request to the right one
/// by header-based `detect`. Only providers with credentials configured are
/// registered; an unconfigured provider's headers are treated as `NotOurs`.
pub struct ProviderRegistry {
    pub github: Option<(GithubAdapter, String)>,
    pub gitlab: Option<(GitlabAdapter, String)>,
    pub gitea: Option<(GiteaAdapter, String)>,
    pub bitbucket: Option<BitbucketAdapter>,
}

impl ProviderRegistry {
    pub fn verify_and_select(&self, headers: &HeaderMap, body: &str) -> Result<(&dyn ProviderAdapter, ProviderKind), PacError> {
        let kind = provider::detect(headers).ok_or_else(|| {
            PacError::MalformedPayload(anyhow::anyhow!("request did not match any configured provider"))
        })?;

        match kind {
            ProviderKind::Github => {
                let (adapter, secret) = self
                    .github
                    .as_ref()
                    .ok_or(PacError::SignatureInvalid)?;
                crate::provider::github::verify_signature(headers, body, secret)
                    .map_err(|_| PacError::SignatureInvalid)?;
                Ok((adapter, kind))
            }
            ProviderKind::Gitlab => {
                let (adapter, secret) = self
                    .gitlab
                    .as_ref()
                    .ok_or(PacError::SignatureInvalid)?;
                crate::provider::gitlab::verify_token(headers, secret)
                    .map_err(|_| PacError::SignatureInvalid)?;
                Ok((adapter, kind))
            }
            ProviderKind::Gitea => {
                let (adapter, secret) = self
                    .gitea
                    .as_ref()
                    .ok_or(PacError::SignatureInvalid)?;
                crate::provider::gitea::verify_signature(headers, body, secret)
                    .map_err(|_| PacError::SignatureInvalid)?;
                Ok((adapter, kind))
            }
            ProviderKind::Bitbucket => {
                let adapter = self.bitbucket.as_ref().ok_or(PacError::SignatureInvalid)?;
                Ok((adapter, kind))
            }
        }
    }

    /// Looks up a configured adapter by kind without signature verification,
    /// for the in-process reconciler reporting terminal status transitions.
    pub fn for_kind(&self, kind: ProviderKind) -> Option<&dyn ProviderAdapter> {
        match kind {
            ProviderKind::Github => self.github.as_ref().map(|(a, _)| a as &dyn ProviderAdapter),
            ProviderKind::Gitlab => self.gitlab.as_ref().map(|(a, _)| a as &dyn ProviderAdapter),
            ProviderKind::Gitea => self.gitea.as_ref().map(|(a, _)| a as &dyn ProviderAdapter),
            ProviderKind::Bitbucket => self.bitbucket.as_ref().map(|a| a as &dyn ProviderAdapter),
        }
    }
}

pub struct AppState<T: TektonClient> {
    pub config: FrontConfig,
    pub providers: Arc<ProviderRegistry>,
    pub repo_cache: Arc<RepositoryCache>,
    pub concurrency: Arc<crate::concurrency::ConcurrencyManager<T>>,
    pub status: Arc<StatusReporter>,
    pub public_base_url: String,
}
