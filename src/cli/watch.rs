use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use kube::Client;
use tracing::{info, warn};

use crate::cli::{Cli, CommandResult, SUCCESS};
use crate::concurrency::ConcurrencyManager;
use crate::event::ProviderKind;
use crate::provider::bitbucket::{BitbucketAdapter, BitbucketConfig};
use crate::provider::gitea::{GiteaAdapter, GiteaConfig};
use crate::provider::github::{GithubAdapter, GithubApiConfig, GithubAppConfig};
use crate::provider::gitlab::{GitlabAdapter, GitlabConfig};
use crate::provider::ProviderAdapter;
use crate::repository::{RepositoryCache, RepositoryWatcher};
use crate::status::StatusReporter;
use crate::tekton::KubeTektonClient;
use crate::trace::init_fmt_with_json;

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    github_app_config: GithubAppConfig,
    #[command(flatten)]
    github_api_config: GithubApiConfig,
    #[command(flatten)]
    gitlab_config: GitlabConfig,
    #[command(flatten)]
    gitea_config: GiteaConfig,
    #[command(flatten)]
    bitbucket_config: BitbucketConfig,
    /// How often to poll PipelineRun status.
    #[arg(long, env, default_value = "5s")]
    poll_interval: humantime::Duration,
    /// Public base URL used to build "details" links in posted statuses.
    #[arg(long, env, default_value = "http://localhost:8080")]
    public_base_url: String,
}

struct Providers {
    github: GithubAdapter,
    gitlab: GitlabAdapter,
    gitea: GiteaAdapter,
    bitbucket: BitbucketAdapter,
}

impl Providers {
    fn for_kind(&self, kind: ProviderKind) -> &dyn ProviderAdapter {
        match kind {
            ProviderKind::Github => &self.github,
            ProviderKind::Gitlab => &self.gitlab,
            ProviderKind::Gitea => &self.gitea,
            ProviderKind::Bitbucket => &self.bitbucket,
        }
    }
}

/// Runs the reconciliation loop that promotes queued runs and reflects
/// terminal `PipelineRun` state back to the provider, separately from the
/// webhook receiver so the two can scale independently (spec §1). Since this
/// process doesn't share memory with `pacer serve`, it first reconstructs
/// its queue from each known namespace's existing `PipelineRun` labels
/// (spec §6) before polling.
pub async fn watch(cli: Cli, args: WatchArgs) -> CommandResult {
    init_fmt_with_json(&cli.verbose);

    let kube_client = Client::try_default()
        .await
        .with_context(|| "failed to build Kubernetes client from in-cluster or kubeconfig context")?;
    let tekton = KubeTektonClient::new(kube_client.clone());
    let status = StatusReporter::new();

    let providers = Providers {
        github: GithubAdapter::new(&args.github_api_config, args.github_app_config)?,
        gitlab: GitlabAdapter::new(&args.gitlab_config)?,
        gitea: GiteaAdapter::new(&args.gitea_config)?,
        bitbucket: BitbucketAdapter::new(&args.bitbucket_config)?,
    };

    let details_url = format!("{}/runs", args.public_base_url);
    let manager = ConcurrencyManager::new(tekton);

    let repo_cache = Arc::new(RepositoryCache::new());
    let repo_watcher = RepositoryWatcher::new(kube_client, Arc::clone(&repo_cache));
    if let Err(e) = repo_watcher.refresh_once().await {
        warn!(error = ?e, "initial repository cache refresh failed, queue reconstruction skipped");
    }
    for namespace in repo_cache.namespaces() {
        match manager.rebuild_from_cluster(&namespace).await {
            Ok(count) => info!(namespace = %namespace, count, "reconstructed in-flight queue from PipelineRun labels"),
            Err(e) => warn!(error = ?e, namespace = %namespace, "failed to reconstruct queue from cluster"),
        }
    }

    let mut interval = tokio::time::interval(Duration::from(args.poll_interval));
    loop {
        interval.tick().await;
        manager
            .reconcile_tick(&status, &details_url, &|kind| Some(providers.for_kind(kind)))
            .await;
    }
}
