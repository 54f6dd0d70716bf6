use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use tracing::{info, warn};

use crate::concurrency::{RunRecord, RunState};
use crate::event::Event;
use crate::provider::ProviderAdapter;

const SKIPPED_DESCRIPTION: &str = "Pending approval, waiting for an /ok-to-test";

fn description_for(state: RunState) -> &'static str {
    match state {
        RunState::Queued => "queued",
        RunState::Running => "running",
        RunState::Succeeded => "succeeded",
        RunState::Failed => "failed",
        RunState::Cancelled => "cancelled",
        RunState::Skipped => SKIPPED_DESCRIPTION,
    }
}

/// Reflects `RunRecord` state transitions back to the provider as
/// check-runs/commit statuses, plus a summary PR comment on completion.
/// Idempotent at-least-once posting keyed on `(sha, run_name, state)`.
/// Takes its provider per-call (rather than owning one) so a single
/// reporter can serve all provider adapters behind `dyn ProviderAdapter`.
#[derive(Default)]
pub struct StatusReporter {
    posted: Mutex<HashSet<(String, String, String)>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a status for a transition into a non-`Queued` state.
    pub async fn report_transition(
        &self,
        provider: &dyn ProviderAdapter,
        event: &Event,
        run: &RunRecord,
        details_url: &str,
    ) -> Result<()> {
        let key = (run.event_sha.clone(), run.name.clone(), run.state.to_string());
        {
            let mut posted = self.posted.lock().expect("status dedup lock poisoned");
            if !posted.insert(key) {
                info!(run = %run.name, state = ?run.state, "status already posted, skipping duplicate");
                return Ok(());
            }
        }

        let description = description_for(run.state);
        if let Err(e) = provider.post_status(event, run.state, details_url, description).await {
            warn!(error = ?e, run = %run.name, "failed to post status, will be retried on next transition");
            return Err(e);
        }

        if matches!(
            run.state,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        ) {
            self.post_summary_comment(provider, event, run).await?;
        }

        Ok(())
    }

    async fn post_summary_comment(&self, provider: &dyn ProviderAdapter, event: &Event, run: &RunRecord) -> Result<()> {
        let body = format!(
            "**PipelineRun `{}`**: {}\n\nSHA: `{}`",
            run.name,
            description_for(run.state),
            run.event_sha
        );
        provider.post_comment(event, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderAdapter;

    fn run(state: RunState) -> RunRecord {
        RunRecord {
            namespace: "ns".to_owned(),
            name: "run-1".to_owned(),
            event_sha: "sha".to_owned(),
            head_branch: "main".to_owned(),
            repository_url: "https://x/y".to_owned(),
            state,
            provider_kind: crate::event::ProviderKind::Github,
            event: Event::default(),
        }
    }

    #[tokio::test]
    async fn posts_skipped_with_ok_to_test_hint() {
        let mut provider = MockProviderAdapter::new();
        provider
            .expect_post_status()
            .withf(|_, _, _, desc| desc == SKIPPED_DESCRIPTION)
            .returning(|_, _, _, _| Ok(()));
        let reporter = StatusReporter::new();
        reporter
            .report_transition(&provider, &Event::default(), &run(RunState::Skipped), "https://example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_transition_is_idempotent() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_post_status().times(1).returning(|_, _, _, _| Ok(()));
        let reporter = StatusReporter::new();
        let record = run(RunState::Running);
        reporter.report_transition(&provider, &Event::default(), &record, "url").await.unwrap();
        reporter.report_transition(&provider, &Event::default(), &record, "url").await.unwrap();
    }

    #[tokio::test]
    async fn posts_summary_comment_on_terminal_state() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_post_status().returning(|_, _, _, _| Ok(()));
        provider.expect_post_comment().times(1).returning(|_, _| Ok(()));
        let reporter = StatusReporter::new();
        reporter
            .report_transition(&provider, &Event::default(), &run(RunState::Succeeded), "url")
            .await
            .unwrap();
    }
}
