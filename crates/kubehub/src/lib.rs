//! Settle kubehub: kube-rs backed resource client (discovery, get, merge patch).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    core::GroupVersion,
    discovery::{self, ApiCapabilities, ApiResource, Scope},
    Client,
};
use serde_json::Value as Json;
use settle_core::{split_api_version, ApplyError, ResourceClient, ResourceDescriptor, Response};
use tokio::sync::OnceCell;
use tracing::{debug, info};

type Catalog = Arc<Vec<(ApiResource, ApiCapabilities)>>;

/// Served resources per `apiVersion`, discovered on first use. Failed lookups are not cached.
#[derive(Default)]
struct CatalogCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Catalog>>>>,
}

impl CatalogCache {
    async fn get_or_load<F, Fut>(&self, api_version: &str, load: F) -> Result<Catalog, ApplyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<(ApiResource, ApiCapabilities)>, ApplyError>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.entry(api_version.to_string()).or_default().clone()
        };
        let catalog = cell.get_or_try_init(|| async move { load().await.map(Arc::new) }).await?;
        Ok(catalog.clone())
    }
}

/// Resource client talking to the API server of the current kube context.
pub struct KubeResourceClient {
    client: Client,
    catalogs: CatalogCache,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client, catalogs: CatalogCache::default() }
    }

    /// Build a client from the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::new(client))
    }

    /// Query only the one group version; other groups being unavailable does not matter.
    async fn discover(&self, group: &str, version: &str) -> Result<Vec<(ApiResource, ApiCapabilities)>, ApplyError> {
        let started = std::time::Instant::now();
        let gv = GroupVersion::gv(group, version);
        match discovery::pinned_group(&self.client, &gv).await {
            Ok(apigroup) => {
                let resources = apigroup.versioned_resources(version);
                info!(api_version = %gv.api_version(), resources = resources.len(), elapsed_ms = started.elapsed().as_millis() as u64, "discovery complete");
                Ok(resources)
            }
            Err(e) => unserved_or_error(e, &gv.api_version()),
        }
    }

    fn api(&self, desc: &ResourceDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(desc);
        if !desc.namespaced {
            return Api::all_with(self.client.clone(), &ar);
        }
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::default_namespaced_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve(&self, api_version: &str, kind: &str, verb: &str) -> Result<ResourceDescriptor, ApplyError> {
        let (group, version) = split_api_version(api_version);
        let catalog = self.catalogs.get_or_load(api_version, || self.discover(group, version)).await?;
        find_descriptor(catalog.iter().cloned(), api_version, kind, verb)
    }

    async fn get(&self, desc: &ResourceDescriptor, name: &str, namespace: Option<&str>) -> Result<Response, ApplyError> {
        match self.api(desc, namespace).get(name).await {
            Ok(obj) => Ok(Response { status_code: 200, body: to_json(&obj)? }),
            Err(e) => status_response(e, "get", &desc.uri(name, namespace)),
        }
    }

    async fn merge_patch(&self, desc: &ResourceDescriptor, name: &str, namespace: Option<&str>, patch: &Json) -> Result<Response, ApplyError> {
        let pp = PatchParams::default();
        match self.api(desc, namespace).patch(name, &pp, &Patch::Merge(patch)).await {
            Ok(obj) => Ok(Response { status_code: 200, body: to_json(&obj)? }),
            Err(e) => status_response(e, "merge patch", &desc.uri(name, namespace)),
        }
    }
}

fn api_resource(desc: &ResourceDescriptor) -> ApiResource {
    ApiResource {
        group: desc.group.clone(),
        version: desc.version.clone(),
        api_version: desc.api_version(),
        kind: desc.kind.clone(),
        plural: desc.plural.clone(),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, ApplyError> {
    Ok(serde_json::to_value(obj).context("serializing DynamicObject")?)
}

/// API errors carry a status we hand back to the engine; anything else is a transport failure.
fn status_response(err: kube::Error, op: &str, uri: &str) -> Result<Response, ApplyError> {
    match err {
        kube::Error::Api(ae) => {
            debug!(uri = %uri, code = ae.code, reason = %ae.reason, "{} returned status", op);
            let body = serde_json::to_value(&ae).unwrap_or_else(|_| Json::String(ae.message.clone()));
            Ok(Response { status_code: ae.code, body })
        }
        other => Err(ApplyError::Client(anyhow::Error::new(other).context(format!("{} {}", op, uri)))),
    }
}

/// A group version the server does not serve has an empty catalog.
fn unserved_or_error(err: kube::Error, api_version: &str) -> Result<Vec<(ApiResource, ApiCapabilities)>, ApplyError> {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            debug!(api_version = %api_version, "group version not served");
            Ok(Vec::new())
        }
        other => Err(ApplyError::Client(anyhow::Error::new(other).context(format!("discovering {}", api_version)))),
    }
}

/// Pick the served resource matching `api_version`/`kind` and check it supports `verb`.
fn find_descriptor<I>(resources: I, api_version: &str, kind: &str, verb: &str) -> Result<ResourceDescriptor, ApplyError>
where
    I: IntoIterator<Item = (ApiResource, ApiCapabilities)>,
{
    let (group, version) = split_api_version(api_version);
    for (ar, caps) in resources {
        if ar.group == group && ar.version == version && ar.kind == kind {
            if !caps.operations.is_empty() && !caps.supports_operation(verb) {
                return Err(ApplyError::UnsupportedOperation {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    verb: verb.to_string(),
                });
            }
            return Ok(ResourceDescriptor {
                group: ar.group,
                version: ar.version,
                kind: ar.kind,
                plural: ar.plural,
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    Err(ApplyError::UnknownResource { api_version: api_version.to_string(), kind: kind.to_string() })
}
