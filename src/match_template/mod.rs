pub mod cel;
pub mod template;

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use globset::Glob;
use serde::Deserialize;

use crate::app_error::PacError;
use crate::event::Event;
use crate::provider::ProviderAdapter;
use crate::repository::RepositoryBinding;

const ANNOTATION_PREFIX: &str = "pipelinesascode.tekton.dev/";

/// An ordered tuple derived from a manifest discovered under `.tekton/` at
/// the event's SHA: `(source_manifest, selected_name, annotations,
/// cel_expression?, event_type, target_branch_glob)`, plus the fields this
/// implementation needs to carry a match through to submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineMatch {
    pub source_manifest: String,
    pub selected_name: String,
    pub namespace: String,
    pub event_sha: String,
    pub manifest_yaml: Vec<u8>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    metadata: ManifestMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn annotation<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations.get(&format!("{ANNOTATION_PREFIX}{key}")).map(String::as_str)
}

fn csv(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToOwned::to_owned).collect()
}

/// Matches manifests against the event per spec §4.4's three-step order,
/// then renders the templated `PipelineRun`. All matches from a manifest
/// batch are returned; no ordering between them is guaranteed (tie-break
/// rule: all are submitted).
pub async fn match_and_template(
    provider: &dyn ProviderAdapter,
    event: &Event,
    binding: &RepositoryBinding,
    manifests: &[Vec<u8>],
    headers_json: &str,
    body: &str,
) -> Result<(Vec<PipelineMatch>, Vec<String>), PacError> {
    let mut matches = Vec::new();
    let mut warnings = Vec::new();
    let mut cached_files: Option<Vec<String>> = None;

    for manifest_yaml in manifests {
        let doc: ManifestDocument = match serde_yaml::from_slice(manifest_yaml) {
            Ok(doc) => doc,
            Err(_) => continue, // not a PipelineRun-shaped document, skip.
        };
        let annotations = &doc.metadata.annotations;

        let is_match = if let Some(expr) = annotation(annotations, "on-cel-expression") {
            if cached_files.is_none() {
                cached_files = Some(
                    provider
                        .changed_files(event)
                        .await
                        .map_err(PacError::ProviderUnavailable)?,
                );
            }
            #[allow(clippy::unwrap_used)] // populated immediately above.
            let files = cached_files.as_ref().unwrap();
            let evaluator = cel::CelEvaluator::new(files);
            evaluator
                .evaluate(expr, event, headers_json, body)
                .with_context(|| format!("CEL evaluation failed for manifest {}", doc.metadata.name))
                .map_err(PacError::Internal)?
        } else if let (Some(on_event), Some(on_branch)) = (
            annotation(annotations, "on-event"),
            annotation(annotations, "on-target-branch"),
        ) {
            let event_type = event.event_kind.map(|k| k.to_string()).unwrap_or_default();
            let events = csv(on_event);
            let branches = csv(on_branch);
            events.iter().any(|e| e == &event_type)
                && branches.iter().any(|glob_pattern| {
                    Glob::new(glob_pattern)
                        .map(|g| g.compile_matcher().is_match(&event.base_branch))
                        .unwrap_or(false)
                })
        } else {
            // Neither clause present: library file, skip.
            false
        };

        if !is_match {
            continue;
        }

        let (rendered, unresolved) = template::render(manifest_yaml, event, &binding.params);
        warnings.extend(unresolved.into_iter().map(|key| format!("unresolved template key `{key}` in {}", doc.metadata.name)));

        let suffix = template::random_suffix();
        let selected_name = format!("{}-{suffix}", doc.metadata.name);

        matches.push(PipelineMatch {
            source_manifest: doc.metadata.name.clone(),
            selected_name,
            namespace: binding.namespace.clone(),
            event_sha: event.sha.clone(),
            manifest_yaml: rendered,
            annotations: annotations.clone(),
        });
    }

    Ok((matches, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderAdapter;

    fn binding() -> RepositoryBinding {
        RepositoryBinding {
            namespace: "ns".to_owned(),
            ..Default::default()
        }
    }

    fn event(event_kind: crate::event::EventKind, branch: &str) -> Event {
        Event {
            event_kind: Some(event_kind),
            base_branch: branch.to_owned(),
            sha: "sha".to_owned(),
            ..Default::default()
        }
    }

    fn manifest(name: &str, on_event: &str, on_branch: &str) -> Vec<u8> {
        format!(
            "metadata:\n  name: {name}\n  annotations:\n    pipelinesascode.tekton.dev/on-event: \"{on_event}\"\n    pipelinesascode.tekton.dev/on-target-branch: \"{on_branch}\"\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn matches_event_and_branch_annotation() {
        let provider = MockProviderAdapter::new();
        let manifests = vec![manifest("pr", "pull_request", "main")];
        let event = event(crate::event::EventKind::PullRequest, "main");
        let (matches, _) = match_and_template(&provider, &event, &binding(), &manifests, "{}", "{}")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn skips_non_matching_branch_glob() {
        let provider = MockProviderAdapter::new();
        let manifests = vec![manifest("pr", "pull_request", "release-*")];
        let event = event(crate::event::EventKind::PullRequest, "main");
        let (matches, _) = match_and_template(&provider, &event, &binding(), &manifests, "{}", "{}")
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn cel_path_filter_rejects_unrelated_changes() {
        let mut provider = MockProviderAdapter::new();
        provider
            .expect_changed_files()
            .times(1)
            .returning(|_| Ok(vec!["docs/x.md".to_owned()]));
        let manifest = b"metadata:\n  name: go-ci\n  annotations:\n    pipelinesascode.tekton.dev/on-cel-expression: 'event_type == \"push\" && \"**/*.go\".pathChanged()'\n".to_vec();
        let event = event(crate::event::EventKind::Push, "main");
        let (matches, _) = match_and_template(&provider, &event, &binding(), &[manifest], "{}", "{}")
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn library_file_without_clauses_is_skipped() {
        let provider = MockProviderAdapter::new();
        let manifest = b"metadata:\n  name: lib\n".to_vec();
        let event = event(crate::event::EventKind::Push, "main");
        let (matches, _) = match_and_template(&provider, &event, &binding(), &[manifest], "{}", "{}")
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
