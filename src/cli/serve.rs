use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{Router, ServiceExt, body::Body, serve as axum_serve};
use clap::Args;
use http::Request;
use kube::Client;
use tokio::net::TcpListener;
use tower_http::normalize_path::NormalizePath;
use tracing::{info, warn};

use crate::cli::{Cli, CommandResult, SUCCESS};
use crate::concurrency::ConcurrencyManager;
use crate::front::{
    config::FrontConfig,
    handlers::{AppState, ProviderRegistry},
    routes::build_app,
};
use crate::provider::bitbucket::{BitbucketAdapter, BitbucketConfig};
use crate::provider::gitea::{GiteaAdapter, GiteaConfig};
use crate::provider::github::{GithubAdapter, GithubApiConfig, GithubAppConfig};
use crate::provider::gitlab::{GitlabAdapter, GitlabConfig};
use crate::repository::{RepositoryCache, RepositoryWatcher};
use crate::status::StatusReporter;
use crate::tekton::KubeTektonClient;
use crate::trace::init_fmt_with_pretty;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
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
    #[command(flatten)]
    config: FrontConfig,
    /// The address to listen on.
    #[arg(long, env, default_value = "0.0.0.0")]
    address: String,
    /// The port to listen on.
    #[arg(long, env, default_value = "8080")]
    port: u16,
    /// How often to refresh the Repository binding cache from the cluster.
    #[arg(long, env, default_value = "30s")]
    repository_refresh_interval: humantime::Duration,
    /// How often the in-process reconciler polls in-flight `PipelineRun`s.
    #[arg(long, env, default_value = "5s")]
    reconcile_poll_interval: humantime::Duration,
    /// Public base URL used to build "details" links in posted statuses.
    #[arg(long, env, default_value = "http://localhost:8080")]
    public_base_url: String,
}

pub async fn serve(cli: Cli, args: ServeArgs) -> CommandResult {
    init_fmt_with_pretty(&cli.verbose);

    let kube_client = Client::try_default()
        .await
        .with_context(|| "failed to build Kubernetes client from in-cluster or kubeconfig context")?;
    let tekton_client = KubeTektonClient::new(kube_client.clone());
    let repo_cache = Arc::new(RepositoryCache::new());
    let watcher = RepositoryWatcher::new(kube_client, Arc::clone(&repo_cache));
    if let Err(e) = watcher.refresh_once().await {
        warn!(error = ?e, "initial repository cache refresh failed, continuing with an empty cache");
    }
    let refresh_interval = Duration::from(args.repository_refresh_interval);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh_interval);
        loop {
            interval.tick().await;
            if let Err(e) = watcher.refresh_once().await {
                warn!(error = ?e, "repository cache refresh failed");
            }
        }
    });

    let providers = Arc::new(ProviderRegistry {
        github: Some((
            GithubAdapter::new(&args.github_api_config, args.github_app_config.clone())?,
            args.github_app_config.webhook_secret.clone(),
        )),
        gitlab: Some((GitlabAdapter::new(&args.gitlab_config)?, args.gitlab_config.webhook_token.clone())),
        gitea: Some((GiteaAdapter::new(&args.gitea_config)?, args.gitea_config.webhook_secret.clone())),
        bitbucket: Some(BitbucketAdapter::new(&args.bitbucket_config)?),
    });

    let concurrency = Arc::new(ConcurrencyManager::new(tekton_client));
    let status = Arc::new(StatusReporter::new());

    for namespace in repo_cache.namespaces() {
        match concurrency.rebuild_from_cluster(&namespace).await {
            Ok(count) => info!(namespace = %namespace, count, "reconstructed in-flight queue from PipelineRun labels"),
            Err(e) => warn!(error = ?e, namespace = %namespace, "failed to reconstruct queue from cluster, continuing with an empty queue"),
        }
    }

    let details_url = format!("{}/runs", args.public_base_url);
    {
        let manager = Arc::clone(&concurrency);
        let status = Arc::clone(&status);
        let providers = Arc::clone(&providers);
        let poll_interval = Duration::from(args.reconcile_poll_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                manager.reconcile_tick(&status, &details_url, &|kind| providers.for_kind(kind)).await;
            }
        });
    }

    let state = AppState {
        config: args.config,
        providers,
        repo_cache,
        concurrency,
        status,
        public_base_url: args.public_base_url,
    };

    let app = build_app(state);
    let app = <NormalizePath<Router> as ServiceExt<Request<Body>>>::into_make_service(app);

    let listener = TcpListener::bind((args.address.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.address, args.port))?;
    info!(address = %listener.local_addr()?, "listening");
    axum_serve(listener, app).await?;

    SUCCESS
}
