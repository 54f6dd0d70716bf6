use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams},
    Client,
};
use serde_json::json;

use crate::concurrency::RunState;

pub const PIPELINERUN_GROUP: &str = "tekton.dev";
pub const PIPELINERUN_VERSION: &str = "v1";
pub const PIPELINERUN_KIND: &str = "PipelineRun";

const LABEL_REPOSITORY: &str = "pipelinesascode.tekton.dev/repository";
const LABEL_SHA: &str = "pipelinesascode.tekton.dev/sha";
const LABEL_EVENT_TYPE: &str = "pipelinesascode.tekton.dev/event-type";
const LABEL_BRANCH: &str = "pipelinesascode.tekton.dev/branch";

/// A non-terminal `PipelineRun` found at startup, reconstructed from the
/// spec §4.4 labels attached at creation. Carries enough identity to re-seed
/// concurrency bookkeeping (admission counts, FIFO queue keys) but not
/// enough to resume status reporting for the run: no provider-kind label
/// exists, and the original webhook payload isn't persisted anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedRun {
    pub name: String,
    pub repository_url: String,
    pub head_branch: String,
    pub event_sha: String,
    pub event_type: String,
}

/// Typed wrapper over `kube::Api<DynamicObject>` for `PipelineRun`
/// create/patch/list, grounded on
/// `openshift-pipelines-ocp-midstreamer::deploy::operator`'s use of
/// `ApiResource`/`DynamicObject`/`Patch`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TektonClient: Send + Sync {
    async fn create(&self, namespace: &str, manifest_yaml: &[u8], labels: &BTreeMap<String, String>) -> Result<()>;
    async fn cancel(&self, namespace: &str, name: &str) -> Result<()>;
    /// Lists `PipelineRun`s in `namespace` whose `Succeeded` condition is
    /// absent or not yet `True`/`False` (spec §6 startup reconstruction).
    async fn list_non_terminal(&self, namespace: &str) -> Result<Vec<ReconstructedRun>>;

    /// Reads `status.conditions[type=Succeeded]` off the live object. `None`
    /// means the object is gone (deleted out-of-band) or has no condition
    /// yet (freshly created, still `Queued`/`Running` from our perspective).
    async fn fetch_state(&self, namespace: &str, name: &str) -> Result<Option<RunState>>;
}

pub struct KubeTektonClient {
    client: Client,
}

impl KubeTektonClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            PIPELINERUN_GROUP,
            PIPELINERUN_VERSION,
            PIPELINERUN_KIND,
        ));
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl TektonClient for KubeTektonClient {
    async fn create(&self, namespace: &str, manifest_yaml: &[u8], labels: &BTreeMap<String, String>) -> Result<()> {
        let value: serde_json::Value = serde_yaml::from_slice(manifest_yaml)
            .with_context(|| "failed to parse templated PipelineRun manifest as YAML")?;
        let mut obj: DynamicObject =
            serde_json::from_value(value).with_context(|| "failed to build DynamicObject")?;
        let mut merged_labels = obj.metadata.labels.clone().unwrap_or_default();
        merged_labels.extend(labels.clone());
        obj.metadata = ObjectMeta {
            namespace: Some(namespace.to_owned()),
            labels: Some(merged_labels),
            ..obj.metadata
        };
        self.api(namespace)
            .create(&Default::default(), &obj)
            .await
            .with_context(|| format!("failed to create PipelineRun in namespace {namespace}"))?;
        Ok(())
    }

    async fn cancel(&self, namespace: &str, name: &str) -> Result<()> {
        let patch = Patch::Merge(json!({
            "spec": { "status": "CancelledRunFinally" }
        }));
        self.api(namespace)
            .patch(name, &PatchParams::default(), &patch)
            .await
            .with_context(|| format!("failed to cancel PipelineRun {name}"))?;
        Ok(())
    }

    async fn list_non_terminal(&self, namespace: &str) -> Result<Vec<ReconstructedRun>> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list PipelineRuns in namespace {namespace}"))?;
        Ok(list
            .items
            .into_iter()
            .filter(|obj| !matches!(condition_to_state(obj), Some(RunState::Succeeded | RunState::Failed | RunState::Cancelled)))
            .filter_map(|obj| {
                let name = obj.metadata.name.clone()?;
                let labels = obj.metadata.labels.as_ref()?;
                Some(ReconstructedRun {
                    name,
                    repository_url: labels.get(LABEL_REPOSITORY).cloned().unwrap_or_default(),
                    head_branch: labels.get(LABEL_BRANCH).cloned().unwrap_or_default(),
                    event_sha: labels.get(LABEL_SHA).cloned().unwrap_or_default(),
                    event_type: labels.get(LABEL_EVENT_TYPE).cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn fetch_state(&self, namespace: &str, name: &str) -> Result<Option<RunState>> {
        let obj = match self.api(namespace).get_opt(name).await {
            Ok(obj) => obj,
            Err(e) => return Err(e).with_context(|| format!("failed to fetch PipelineRun {name}")),
        };
        let Some(obj) = obj else {
            return Ok(None);
        };
        Ok(condition_to_state(&obj))
    }
}

fn condition_to_state(obj: &DynamicObject) -> Option<RunState> {
    let conditions = obj.data.get("status")?.get("conditions")?.as_array()?;
    let succeeded = conditions
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Succeeded"))?;
    let status = succeeded.get("status")?.as_str()?;
    let reason = succeeded.get("reason").and_then(|r| r.as_str()).unwrap_or_default();
    match status {
        "True" => Some(RunState::Succeeded),
        "False" if reason.eq_ignore_ascii_case("cancelled") => Some(RunState::Cancelled),
        "False" => Some(RunState::Failed),
        _ => Some(RunState::Running),
    }
}
