use std::sync::Arc;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ApiResource, DynamicObject, ListParams},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app_error::PacError;
use crate::event::Event;

pub const REPOSITORY_GROUP: &str = "pipelinesascode.tekton.dev";
pub const REPOSITORY_VERSION: &str = "v1alpha1";
pub const REPOSITORY_KIND: &str = "Repository";

/// Persisted cluster resource mapping a canonical clone URL to a namespace,
/// credentials and optional settings.
///
/// Invariant: at most one binding per `url` within the cluster; a global
/// default binding may augment but not override per-repo settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryBinding {
    pub namespace: String,
    pub url: String,
    pub git_provider: GitProviderRef,
    pub params: Vec<BindingParam>,
    pub settings: BindingSettings,
    pub concurrency_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitProviderRef {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub url: String,
    pub secret: SecretRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingParam {
    pub name: String,
    pub value: String,
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingSettings {
    pub policy: Vec<String>,
    pub pipelinerun_provenance: Option<String>,
    pub cancel_in_progress: Option<bool>,
}

impl RepositoryBinding {
    fn host_owner_repo_key(url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let path = parsed.path().trim_start_matches('/').trim_end_matches(".git");
        Some(format!("{host}/{path}"))
    }
}

/// Read-mostly, concurrent cache of repository bindings, kept warm by a
/// Kubernetes watch over `Repository` custom resources. Implements the
/// three-tier lookup from spec §4.2: exact URL, then `host+owner+repo`,
/// then the cluster-wide default binding.
#[derive(Debug, Default)]
pub struct RepositoryCache {
    by_url: DashMap<String, RepositoryBinding>,
    default_binding: DashMap<(), RepositoryBinding>,
}

impl RepositoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, binding: RepositoryBinding) {
        if binding.url == "*" {
            self.default_binding.insert((), binding);
            return;
        }
        self.by_url.insert(binding.url.clone(), binding);
    }

    pub fn remove(&self, url: &str) {
        self.by_url.remove(url);
    }

    pub fn resolve(&self, event: &Event) -> Result<RepositoryBinding, PacError> {
        let url = event.canonical_repo_url();
        if let Some(binding) = self.by_url.get(url) {
            return Ok(binding.clone());
        }
        if let Some(key) = RepositoryBinding::host_owner_repo_key(url) {
            if let Some(binding) = self
                .by_url
                .iter()
                .find(|entry| RepositoryBinding::host_owner_repo_key(&entry.url).as_deref() == Some(key.as_str()))
            {
                return Ok(binding.clone());
            }
        }
        if let Some(default) = self.default_binding.get(&()) {
            return Ok(default.clone());
        }
        Err(PacError::NoBinding(url.to_owned()))
    }

    /// Distinct namespaces across all known bindings, for startup queue
    /// reconstruction (spec §6) to know where to list `PipelineRun`s.
    pub fn namespaces(&self) -> Vec<String> {
        let mut set: std::collections::BTreeSet<String> =
            self.by_url.iter().map(|entry| entry.namespace.clone()).collect();
        if let Some(default) = self.default_binding.get(&()) {
            set.insert(default.namespace.clone());
        }
        set.into_iter().collect()
    }
}

/// Watches `Repository` custom resources and keeps a `RepositoryCache` warm.
/// Grounded on `openshift-pipelines-ocp-midstreamer::k8s::create_kube_client`
/// and its `DynamicObject`/`ApiResource` usage, simplified to a polling list
/// rather than a full `kube_runtime::Controller` reconciler.
pub struct RepositoryWatcher {
    api: Api<DynamicObject>,
    cache: Arc<RepositoryCache>,
}

impl RepositoryWatcher {
    pub fn new(client: Client, cache: Arc<RepositoryCache>) -> Self {
        let resource = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            REPOSITORY_GROUP,
            REPOSITORY_VERSION,
            REPOSITORY_KIND,
        ));
        let api = Api::all_with(client, &resource);
        Self { api, cache }
    }

    pub async fn refresh_once(&self) -> Result<()> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .with_context(|| "failed to list Repository custom resources")?;
        for obj in list.items {
            if let Some(binding) = Self::binding_from_object(&obj) {
                self.cache.insert(binding);
            } else {
                warn!(name = ?obj.metadata.name, "skipping malformed Repository object");
            }
        }
        info!(count = self.cache.by_url.len(), "repository cache refreshed");
        Ok(())
    }

    fn binding_from_object(obj: &DynamicObject) -> Option<RepositoryBinding> {
        let data = obj.data.get("spec")?.clone();
        let mut binding: RepositoryBinding = serde_json::from_value(data).ok()?;
        binding.namespace = namespace_or_default(&obj.metadata);
        Some(binding)
    }
}

fn namespace_or_default(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or_else(|| "default".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event_for(url: &str) -> Event {
        Event {
            base_url: url.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_exact_url_match() {
        let cache = RepositoryCache::new();
        cache.insert(RepositoryBinding {
            url: "https://github.com/owner/repo".to_owned(),
            namespace: "ns".to_owned(),
            ..Default::default()
        });
        let binding = cache.resolve(&event_for("https://github.com/owner/repo")).unwrap();
        assert_eq!(binding.namespace, "ns");
    }

    #[test]
    fn resolves_by_host_owner_repo() {
        let cache = RepositoryCache::new();
        cache.insert(RepositoryBinding {
            url: "https://github.com/owner/repo.git".to_owned(),
            namespace: "ns".to_owned(),
            ..Default::default()
        });
        let binding = cache.resolve(&event_for("https://github.com/owner/repo")).unwrap();
        assert_eq!(binding.namespace, "ns");
    }

    #[test]
    fn falls_back_to_default_binding() {
        let cache = RepositoryCache::new();
        cache.insert(RepositoryBinding {
            url: "*".to_owned(),
            namespace: "default-ns".to_owned(),
            ..Default::default()
        });
        let binding = cache.resolve(&event_for("https://github.com/other/repo")).unwrap();
        assert_eq!(binding.namespace, "default-ns");
    }

    #[test]
    fn missing_binding_is_no_binding_error() {
        let cache = RepositoryCache::new();
        let err = cache.resolve(&event_for("https://github.com/other/repo")).unwrap_err();
        assert!(matches!(err, PacError::NoBinding(_)));
    }
}
