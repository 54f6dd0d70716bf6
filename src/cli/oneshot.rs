use anyhow::Context as _;
use clap::Args;

use crate::acl;
use crate::cli::{Cli, CommandResult, FAILURE, SUCCESS};
use crate::event::{normalizer, ProviderKind};
use crate::match_template::match_and_template;
use crate::provider::bitbucket::{BitbucketAdapter, BitbucketConfig};
use crate::provider::gitea::{GiteaAdapter, GiteaConfig};
use crate::provider::github::{GithubAdapter, GithubApiConfig, GithubAppConfig};
use crate::provider::gitlab::{GitlabAdapter, GitlabConfig};
use crate::provider::ProviderAdapter;
use crate::repository::RepositoryBinding;
use crate::trace::init_fmt_with_pretty;

#[derive(Debug, Clone, Args)]
pub struct OneshotArgs {
    /// Which provider's adapter to exercise.
    #[arg(long, value_enum)]
    provider: OneshotProvider,
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
    /// Path to a file containing the raw webhook payload body to replay.
    #[arg(long)]
    payload_file: std::path::PathBuf,
    /// Namespace the rendered PipelineRun would be submitted into, printed
    /// for inspection; no cluster writes are made.
    #[arg(long, default_value = "default")]
    namespace: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OneshotProvider {
    Github,
    Gitlab,
    Gitea,
    Bitbucket,
}

/// Replays a single stored webhook payload through the full pipeline
/// (parse, normalize, resolve, ACL, match & template) without a running
/// server and without submitting to the cluster, for local development and
/// for reproducing a production event offline.
pub async fn oneshot(cli: Cli, args: OneshotArgs) -> CommandResult {
    init_fmt_with_pretty(&cli.verbose);

    let body = std::fs::read_to_string(&args.payload_file)
        .with_context(|| format!("failed to read payload file {}", args.payload_file.display()))?;

    let (adapter, kind): (Box<dyn ProviderAdapter>, ProviderKind) = match args.provider {
        OneshotProvider::Github => (
            Box::new(GithubAdapter::new(&args.github_api_config, args.github_app_config)?),
            ProviderKind::Github,
        ),
        OneshotProvider::Gitlab => (Box::new(GitlabAdapter::new(&args.gitlab_config)?), ProviderKind::Gitlab),
        OneshotProvider::Gitea => (Box::new(GiteaAdapter::new(&args.gitea_config)?), ProviderKind::Gitea),
        OneshotProvider::Bitbucket => (
            Box::new(BitbucketAdapter::new(&args.bitbucket_config)?),
            ProviderKind::Bitbucket,
        ),
    };

    let mut event = adapter.parse(&body).await.with_context(|| "failed to parse payload")?;
    event.provider_kind = Some(kind);
    event.raw_payload = body.clone();
    event.request_id = "oneshot".to_owned();
    let event = normalizer::normalize(event).with_context(|| "event failed normalization")?;

    println!("normalized event: {event:#?}");

    if !acl::is_allowed(adapter.as_ref(), &event).await? {
        println!("sender {} is not authorized to trigger CI for this event", event.sender);
        return FAILURE;
    }

    let manifests = adapter
        .get_pipeline_manifests(&event)
        .await
        .with_context(|| "failed to fetch .tekton manifests")?;
    if manifests.is_empty() {
        println!("no .tekton manifests found at {}", event.sha);
        return FAILURE;
    }

    let binding = RepositoryBinding {
        namespace: args.namespace,
        url: event.base_url.clone(),
        ..Default::default()
    };
    let (matches, warnings) = match_and_template(adapter.as_ref(), &event, &binding, &manifests, "{}", &body).await?;
    for warning in &warnings {
        println!("warning: {warning}");
    }

    if matches.is_empty() {
        println!("no manifest matched this event");
        return FAILURE;
    }

    for matched in &matches {
        println!("--- {} ---", matched.selected_name);
        println!("{}", String::from_utf8_lossy(&matched.manifest_yaml));
    }

    SUCCESS
}
