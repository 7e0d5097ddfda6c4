//! Settle core types: resource descriptors, outcomes, errors and the client capability.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value as Json;

pub mod path;

pub use path::Lookup;

/// Annotation holding the serialized document that was last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "deploy.razee.io/last-applied-configuration";
/// Annotation holding the document that would have been applied while debug is on.
pub const PENDING_ANNOTATION: &str = "deploy.razee.io/pending-configuration";
/// Label that freezes a live resource for inspection.
pub const DEBUG_LABEL: &str = "deploy.razee.io/debug";
/// Last-applied value meaning "updated additively, do not diff against it".
pub const ADDITIVE_MERGE_PATCH_SENTINEL: &str = "AdditiveMergePatch - Skipping reconcileFields from last-applied.";

/// Client-side handle describing how to address one kind's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Request path of a named object, for logs and error reports.
    pub fn uri(&self, name: &str, namespace: Option<&str>) -> String {
        let base = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        match namespace.filter(|_| self.namespaced) {
            Some(ns) => format!("{}/namespaces/{}/{}/{}", base, ns, self.plural, name),
            None => format!("{}/{}/{}", base, self.plural, name),
        }
    }
}

/// Split an `apiVersion` string into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

/// Raw reply from the resource client.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    pub body: Json,
}

impl Response {
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status_code) }
}

/// What the engine did with one concrete resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Desired document was merge-patched onto the live resource.
    Patched,
    /// Live resource is in debug mode; only the pending annotation was written.
    Pending,
    /// Live resource not found or not readable; nothing sent.
    Skipped,
    /// Collection with no items.
    Empty,
}

/// Successful result of applying one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub uri: String,
    pub action: Action,
    pub status_code: u16,
    pub body: Json,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        match self.action {
            Action::Skipped | Action::Empty => true,
            Action::Patched | Action::Pending => (200..300).contains(&self.status_code),
        }
    }
}

/// Failures the engine reports per resource.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{uri}: server returned {status_code}")]
    Rejected { uri: String, status_code: u16, body: Json },
    #[error("unknown resource type: {api_version}/{kind}")]
    UnknownResource { api_version: String, kind: String },
    #[error("{api_version}/{kind} does not support {verb}")]
    UnsupportedOperation { api_version: String, kind: String, verb: String },
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("{uri}: unreadable last-applied annotation")]
    CorruptLastApplied {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

impl ApplyError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApplyError::Rejected { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Structured body for reports: the server reply when there is one, else the message.
    pub fn body(&self) -> Json {
        match self {
            ApplyError::Rejected { body, .. } => body.clone(),
            other => Json::String(format!("{:#}", other)),
        }
    }
}

pub type ApplyResult = Result<Outcome, ApplyError>;

/// Capability the engine needs from a cluster: resolve kinds, read objects, merge-patch objects.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resolve `apiVersion`/`kind` to a descriptor supporting `verb`.
    async fn resolve(&self, api_version: &str, kind: &str, verb: &str) -> Result<ResourceDescriptor, ApplyError>;

    /// Fetch an object. 404 and 403 must come back as a `Response`, not an error.
    async fn get(&self, desc: &ResourceDescriptor, name: &str, namespace: Option<&str>) -> Result<Response, ApplyError>;

    /// Send a JSON merge patch.
    async fn merge_patch(&self, desc: &ResourceDescriptor, name: &str, namespace: Option<&str>, patch: &Json) -> Result<Response, ApplyError>;
}
