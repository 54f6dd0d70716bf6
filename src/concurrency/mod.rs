use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::app_error::PacError;
use crate::event::{Event, ProviderKind};
use crate::match_template::template::pac_labels;
use crate::match_template::PipelineMatch;
use crate::provider::ProviderAdapter;
use crate::status::StatusReporter;
use crate::tekton::TektonClient;

/// Lifecycle states of a `PipelineRun`. Transitions are monotonic except
/// `Queued -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

/// Identity of an executing `PipelineRun`.
///
/// Owned by the Concurrency Manager until terminal; the Status Reporter
/// holds a non-owning reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub namespace: String,
    pub name: String,
    pub event_sha: String,
    pub head_branch: String,
    pub repository_url: String,
    pub state: RunState,
    pub provider_kind: ProviderKind,
    /// The triggering event, carried so the watch loop can report statuses
    /// back to the provider without re-fetching or re-parsing the webhook.
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConcurrencyKey {
    repository_url: u64,
    head_branch: u64,
}

impl ConcurrencyKey {
    fn new(repository_url: &str, head_branch: &str) -> Self {
        use std::hash::{Hash as _, Hasher as _};
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        repository_url.hash(&mut h1);
        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        head_branch.hash(&mut h2);
        Self {
            repository_url: h1.finish(),
            head_branch: h2.finish(),
        }
    }
}

struct RepoQueue {
    in_flight: Vec<RunRecord>,
    queued: VecDeque<RunRecord>,
}

/// Per-`(repository, head_branch)` FIFO admission controller (spec §4.5).
/// Submission order within a key is preserved via a per-key
/// `tokio::sync::Mutex`; across keys there is no ordering, matching the
/// `Handler::run_command` timeout/backoff control flow this is grounded on.
pub struct ConcurrencyManager<T: TektonClient> {
    tekton: T,
    queues: DashMap<ConcurrencyKey, Arc<Mutex<RepoQueue>>>,
}

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

impl<T: TektonClient> ConcurrencyManager<T> {
    pub fn new(tekton: T) -> Self {
        Self {
            tekton,
            queues: DashMap::new(),
        }
    }

    fn lock_for(&self, repository_url: &str, head_branch: &str) -> Arc<Mutex<RepoQueue>> {
        let key = ConcurrencyKey::new(repository_url, head_branch);
        Arc::clone(
            self.queues
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(RepoQueue {
                        in_flight: Vec::new(),
                        queued: VecDeque::new(),
                    }))
                })
                .value(),
        )
    }

    /// Admits a newly matched pipeline. Cancels superseded `Queued`/`Running`
    /// runs for the same key first when `cancel_in_progress` is set, then
    /// enqueues, then dequeues while under `concurrency_limit`.
    pub async fn admit(
        &self,
        matched: &PipelineMatch,
        event: &Event,
        concurrency_limit: Option<u32>,
        cancel_in_progress: bool,
    ) -> Result<RunRecord, PacError> {
        let repository_url = event.base_url.as_str();
        let head_branch = event.head_branch.as_str();
        let lock = self.lock_for(repository_url, head_branch);
        let mut guard = lock.lock().await;

        if cancel_in_progress {
            let superseded: Vec<RunRecord> = guard
                .in_flight
                .iter()
                .filter(|r| matches!(r.state, RunState::Queued | RunState::Running))
                .cloned()
                .collect();
            for run in superseded {
                if let Err(e) = self.tekton.cancel(&run.namespace, &run.name).await {
                    warn!(error = ?e, name = %run.name, "cancellation failed, logged and non-fatal");
                } else {
                    info!(name = %run.name, "cancelled superseded run");
                }
                guard
                    .in_flight
                    .retain(|existing| existing.name != run.name);
            }
        }

        let record = RunRecord {
            namespace: matched.namespace.clone(),
            name: matched.selected_name.clone(),
            event_sha: matched.event_sha.clone(),
            head_branch: head_branch.to_owned(),
            repository_url: repository_url.to_owned(),
            state: RunState::Queued,
            provider_kind: event.provider_kind.unwrap_or_default(),
            event: event.clone(),
        };

        let limit = concurrency_limit.unwrap_or(u32::MAX);
        #[allow(clippy::cast_possible_truncation)]
        if (guard.in_flight.len() as u32) < limit {
            let mut running = record.clone();
            running.state = RunState::Running;
            guard.in_flight.push(running.clone());
            drop(guard);
            self.submit_with_retry(&matched.manifest_yaml, &running).await?;
            Ok(running)
        } else {
            guard.queued.push_back(record.clone());
            Ok(record)
        }
    }

    /// Promotes the next queued run once a terminal transition frees a slot.
    pub async fn on_terminal(&self, repository_url: &str, head_branch: &str, finished_name: &str) -> Result<Option<RunRecord>, PacError> {
        let lock = self.lock_for(repository_url, head_branch);
        let mut guard = lock.lock().await;
        guard.in_flight.retain(|r| r.name != finished_name);
        let Some(mut next) = guard.queued.pop_front() else {
            return Ok(None);
        };
        next.state = RunState::Running;
        guard.in_flight.push(next.clone());
        Ok(Some(next))
    }

    /// Delegates to the underlying `TektonClient`, for the watch loop to
    /// poll current cluster state without reaching into internals.
    pub async fn fetch_state(&self, namespace: &str, name: &str) -> Result<Option<RunState>> {
        self.tekton.fetch_state(namespace, name).await
    }

    /// A point-in-time copy of every run currently admitted (`Queued` or
    /// `Running`), for the watch loop to poll against the cluster.
    pub fn in_flight_snapshot(&self) -> Vec<RunRecord> {
        self.queues
            .iter()
            .flat_map(|entry| {
                // try_lock: a queue mid-admit is skipped this tick and picked
                // up on the next poll rather than blocking the watch loop.
                entry
                    .value()
                    .try_lock()
                    .map(|guard| guard.in_flight.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    async fn submit_with_retry(&self, manifest_yaml: &[u8], record: &RunRecord) -> Result<(), PacError> {
        let event_type = record.event.event_kind.map(|k| k.to_string()).unwrap_or_default();
        let labels = pac_labels(&record.repository_url, &record.event_sha, &event_type, &record.head_branch);
        let mut attempt = 0;
        let mut backoff = RETRY_BASE;
        loop {
            attempt += 1;
            match self.tekton.create(&record.namespace, manifest_yaml, &labels).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= MAX_ATTEMPTS => {
                    return Err(PacError::SubmissionError(
                        e.context(format!("giving up after {attempt} attempts")),
                    ));
                }
                Err(e) => {
                    warn!(attempt, error = ?e, "PipelineRun submission failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
            }
        }
    }

    /// Best-effort startup reconstruction (spec §6): seeds `in_flight`
    /// bookkeeping from each non-terminal `PipelineRun`'s labels so
    /// concurrency gating and queue promotion survive a process restart.
    /// Reconstructed records carry no provider identity, so they're seeded
    /// directly rather than routed through `StatusReporter`.
    pub async fn rebuild_from_cluster(&self, namespace: &str) -> Result<usize> {
        let runs = self.tekton.list_non_terminal(namespace).await?;
        let count = runs.len();
        for run in runs {
            let event = Event {
                base_url: run.repository_url.clone(),
                head_branch: run.head_branch.clone(),
                sha: run.event_sha.clone(),
                ..Default::default()
            };
            let record = RunRecord {
                namespace: namespace.to_owned(),
                name: run.name,
                event_sha: run.event_sha,
                head_branch: run.head_branch,
                repository_url: run.repository_url,
                state: RunState::Running,
                provider_kind: ProviderKind::default(),
                event,
            };
            let lock = self.lock_for(&record.repository_url, &record.head_branch);
            let mut guard = lock.lock().await;
            guard.in_flight.push(record);
        }
        Ok(count)
    }

    /// Polls every in-flight run for terminal state, reports the transition,
    /// and promotes the next queued run for any repo/branch key that frees
    /// up. Shared by `pacer watch`'s standalone loop and `pacer serve`'s
    /// in-process reconciler so both observe identical promotion logic
    /// regardless of deployment topology (spec §6).
    pub async fn reconcile_tick(
        &self,
        status: &StatusReporter,
        details_url: &str,
        resolve_provider: &dyn Fn(ProviderKind) -> Option<&dyn ProviderAdapter>,
    ) {
        for record in self.in_flight_snapshot() {
            let state = match self.fetch_state(&record.namespace, &record.name).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = ?e, run = %record.name, "failed to fetch PipelineRun status, will retry next tick");
                    continue;
                }
            };
            let Some(new_state) = state else { continue };
            if new_state == record.state || !matches!(new_state, RunState::Succeeded | RunState::Failed | RunState::Cancelled) {
                continue;
            }

            let terminal_record = RunRecord { state: new_state, ..record.clone() };
            match resolve_provider(record.provider_kind) {
                Some(provider) => {
                    if let Err(e) = status.report_transition(provider, &record.event, &terminal_record, details_url).await {
                        warn!(error = ?e, run = %record.name, "failed to report terminal status");
                    }
                }
                None => warn!(run = %record.name, provider_kind = ?record.provider_kind, "no adapter configured for provider, skipping status report"),
            }

            match self.on_terminal(&record.repository_url, &record.head_branch, &record.name).await {
                Ok(Some(promoted)) => match resolve_provider(promoted.provider_kind) {
                    Some(provider) => {
                        if let Err(e) = status.report_transition(provider, &promoted.event, &promoted, details_url).await {
                            warn!(error = ?e, run = %promoted.name, "failed to report promoted run");
                        }
                    }
                    None => warn!(run = %promoted.name, provider_kind = ?promoted.provider_kind, "no adapter configured for provider, skipping status report"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = ?e, run = %record.name, "failed to promote next queued run"),
            }
            info!(run = %record.name, state = ?new_state, "reconciled terminal PipelineRun");
        }
    }
}

pub fn annotation_for_queue_position(position: usize) -> (&'static str, String) {
    (
        "pipelinesascode.tekton.dev/queue-position",
        position.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tekton::MockTektonClient;

    fn matched() -> PipelineMatch {
        PipelineMatch {
            source_manifest: "pr.yaml".to_owned(),
            selected_name: "pr-pipeline".to_owned(),
            namespace: "ns".to_owned(),
            event_sha: "sha".to_owned(),
            manifest_yaml: b"kind: PipelineRun".to_vec(),
            annotations: Default::default(),
        }
    }

    fn event() -> Event {
        Event {
            base_url: "https://x/y".to_owned(),
            head_branch: "main".to_owned(),
            provider_kind: Some(ProviderKind::Github),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn admits_under_limit_immediately() {
        let mut mock = MockTektonClient::new();
        mock.expect_create().times(1).returning(|_, _, _| Ok(()));
        let manager = ConcurrencyManager::new(mock);
        let record = manager.admit(&matched(), &event(), Some(2), false).await.unwrap();
        assert_eq!(record.state, RunState::Running);
    }

    #[tokio::test]
    async fn queues_when_limit_reached() {
        let mut mock = MockTektonClient::new();
        mock.expect_create().times(1).returning(|_, _, _| Ok(()));
        let manager = ConcurrencyManager::new(mock);
        let _first = manager.admit(&matched(), &event(), Some(1), false).await.unwrap();
        let second = manager.admit(&matched(), &event(), Some(1), false).await.unwrap();
        assert_eq!(second.state, RunState::Queued);
    }

    #[tokio::test]
    async fn cancel_in_progress_cancels_superseded_run() {
        let mut mock = MockTektonClient::new();
        mock.expect_create().times(2).returning(|_, _, _| Ok(()));
        mock.expect_cancel().times(1).returning(|_, _| Ok(()));
        let manager = ConcurrencyManager::new(mock);
        let _first = manager.admit(&matched(), &event(), None, true).await.unwrap();
        let second = manager.admit(&matched(), &event(), None, true).await.unwrap();
        assert_eq!(second.state, RunState::Running);
    }

    #[tokio::test]
    async fn in_flight_snapshot_reflects_running_runs() {
        let mut mock = MockTektonClient::new();
        mock.expect_create().times(1).returning(|_, _, _| Ok(()));
        let manager = ConcurrencyManager::new(mock);
        manager.admit(&matched(), &event(), Some(2), false).await.unwrap();
        assert_eq!(manager.in_flight_snapshot().len(), 1);
    }
}
