//! Manifest sources and YAML parsing.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub const LATEST: &str = "latest";

const RELEASES_BASE: &str = "https://github.com/razee-io";

/// Families applied by `update` when none are given.
pub const DEFAULT_FAMILIES: [&str; 3] = ["ClusterSubscription", "RemoteResource", "WatchKeeper"];

fn max_yaml_bytes() -> usize {
    std::env::var("SETTLE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("SETTLE_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// A resource family at a version, written `Name` or `Name=version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    pub family: String,
    pub version: String,
}

impl ManifestRef {
    pub fn latest(family: impl Into<String>) -> Self {
        Self { family: family.into(), version: LATEST.to_string() }
    }
}

impl FromStr for ManifestRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (family, version) = match s.split_once('=') {
            Some((f, v)) => (f.trim(), v.trim()),
            None => (s.trim(), LATEST),
        };
        if family.is_empty() || version.is_empty() || family.contains('/') {
            return Err(anyhow!("invalid family: {} (expect Name or Name=version)", s));
        }
        Ok(Self { family: family.to_string(), version: version.to_string() })
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.family, self.version)
    }
}

/// Produces raw manifest text for a family at a version.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, family: &str, version: &str) -> Result<String>;
}

/// Downloads manifests over HTTP, either from a file-source mirror or from release assets.
pub struct HttpManifestSource {
    client: reqwest::Client,
    file_source: Option<String>,
}

impl HttpManifestSource {
    pub fn new(file_source: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().context("building HTTP client")?;
        let file_source = file_source.map(|s| s.trim_end_matches('/').to_string());
        Ok(Self { client, file_source })
    }

    pub fn url_for(&self, family: &str, version: &str) -> String {
        match &self.file_source {
            Some(base) => format!("{}/{}/{}/us/resource.yaml", base, family, version),
            None if version == LATEST => format!("{}/{}/releases/latest/download/resource.yaml", RELEASES_BASE, family),
            None => format!("{}/{}/releases/download/{}/resource.yaml", RELEASES_BASE, family, version),
        }
    }

    async fn get_text(&self, url: String) -> Result<String> {
        debug!(url = %url, "fetching manifest");
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }
        resp.text().await.with_context(|| format!("reading body of {}", url))
    }
}

#[async_trait::async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, family: &str, version: &str) -> Result<String> {
        with_latest_fallback(family, version, |v| self.get_text(self.url_for(family, &v))).await
    }
}

/// Try `version`; if that fails and it is not already `latest`, try `latest` once.
pub async fn with_latest_fallback<F, Fut>(family: &str, version: &str, mut fetch: F) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    match fetch(version.to_string()).await {
        Ok(text) => Ok(text),
        Err(e) if version != LATEST => {
            warn!(family, version, error = %e, "fetch failed, falling back to {}", LATEST);
            fetch(LATEST.to_string()).await.with_context(|| format!("fetching {} at {} and {}", family, version, LATEST))
        }
        Err(e) => Err(e.context(format!("fetching {} at {}", family, version))),
    }
}

/// Parse a YAML stream and return its first non-null document as JSON.
pub fn parse_manifest(text: &str) -> Result<Json> {
    if text.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    for doc in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(doc).context("parsing YAML")?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
        }
        return Ok(json);
    }
    Err(anyhow!("manifest contains no documents"))
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}
