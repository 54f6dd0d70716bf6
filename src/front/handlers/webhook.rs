use std::sync::Arc;

use axum::{extract::State, response::IntoResponse};
use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value, json};
use tracing::{Span, field::Empty, info, instrument};
use uuid::Uuid;

use crate::acl;
use crate::app_error::PacError;
use crate::concurrency::{RunRecord, RunState};
use crate::event::normalizer;
use crate::front::handlers::AppState;
use crate::match_template::match_and_template;
use crate::tekton::TektonClient;

fn headers_to_json(headers: &HeaderMap) -> String {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_owned(), Value::String(v.to_owned()));
        }
    }
    Value::Object(map).to_string()
}

/// The single inbound entry point: detects the provider from headers,
/// verifies its signature, then runs the full admission pipeline (spec §2)
/// through to `PipelineRun` submission. Every error path maps to a `PacError`
/// variant so the webhook always returns quickly and is safe to retry.
#[instrument(skip_all, fields(provider = Empty, repository = Empty, sha = Empty))]
pub async fn webhook<T: TektonClient>(
    headers: HeaderMap,
    State(state): State<Arc<AppState<T>>>,
    body: String,
) -> Result<impl IntoResponse, PacError> {
    let (provider, kind) = state.providers.verify_and_select(&headers, &body)?;
    Span::current().record("provider", kind.to_string());

    let mut event = provider.parse(&body).await?;
    event.provider_kind = Some(kind);
    event.raw_payload = body.clone();
    event.delivery_id = headers
        .get("x-github-delivery")
        .or_else(|| headers.get("x-gitlab-event-uuid"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    event.request_id = Uuid::new_v4().to_string();

    let event = normalizer::normalize(event)?;
    Span::current().record("repository", event.repository.as_str());
    Span::current().record("sha", event.sha.as_str());

    let binding = state.repo_cache.resolve(&event)?;
    let details_url = format!("{}/runs", state.public_base_url);

    if !acl::is_allowed(provider, &event).await? {
        info!(sender = %event.sender, "sender not authorized, event consumed and dropped");
        let skipped = RunRecord {
            namespace: String::new(),
            name: String::new(),
            event_sha: event.sha.clone(),
            head_branch: event.head_branch.clone(),
            repository_url: event.base_url.clone(),
            state: RunState::Skipped,
            provider_kind: kind,
            event: event.clone(),
        };
        state
            .status
            .report_transition(provider, &event, &skipped, &details_url)
            .await?;
        return Err(PacError::AccessDenied);
    }

    let manifests = provider
        .get_pipeline_manifests(&event)
        .await
        .map_err(PacError::ProviderUnavailable)?;
    if manifests.is_empty() {
        return Ok((StatusCode::OK, json!({ "status": "no_pipelines_defined" }).to_string()));
    }

    let headers_json = headers_to_json(&headers);
    let (matches, warnings) = match_and_template(provider, &event, &binding, &manifests, &headers_json, &body).await?;
    if !warnings.is_empty() {
        for warning in &warnings {
            info!(%warning, "template rendering warning");
        }
        let comment = format!("pacer found unresolved template keys:\n{}", warnings.join("\n"));
        if let Err(e) = provider.post_comment(&event, &comment).await {
            info!(error = ?e, "failed to post template warning comment");
        }
    }

    if matches.is_empty() {
        return Ok((StatusCode::OK, json!({ "status": "no_match" }).to_string()));
    }

    let cancel_in_progress = binding.settings.cancel_in_progress.unwrap_or(false);

    for matched in &matches {
        let record = state
            .concurrency
            .admit(matched, &event, binding.concurrency_limit, cancel_in_progress)
            .await?;
        state
            .status
            .report_transition(provider, &event, &record, &details_url)
            .await?;
    }

    Ok((StatusCode::OK, json!({ "status": "accepted", "matched": matches.len() }).to_string()))
}
