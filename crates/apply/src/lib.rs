//! Settle apply: converge live objects onto desired manifests with merge patches.
//!
//! The engine only updates objects that already exist. It keeps its memory of
//! prior intent in the last-applied annotation and uses it to null fields that
//! were dropped from the manifest since the previous run.

#![forbid(unsafe_code)]

use anyhow::Context;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use settle_core::path::{self, Lookup};
use settle_core::{
    Action, ApplyError, ApplyResult, Outcome, ResourceClient, ResourceDescriptor, ADDITIVE_MERGE_PATCH_SENTINEL,
    DEBUG_LABEL, LAST_APPLIED_ANNOTATION, PENDING_ANNOTATION,
};
use tracing::{debug, warn};

pub mod decompose;
pub mod reconcile;
pub mod run;
pub mod source;

pub use decompose::decompose;
pub use reconcile::reconcile_fields;
pub use run::{RunReport, ReportEntry};

const ANNOTATIONS: [&str; 2] = ["metadata", "annotations"];

/// Reconciliation engine bound to one resource client.
pub struct Applier<C> {
    client: C,
    namespace: Option<String>,
}

impl<C: ResourceClient> Applier<C> {
    pub fn new(client: C) -> Self {
        Self { client, namespace: None }
    }

    /// Target every namespaced object at `namespace`, ignoring `metadata.namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn client(&self) -> &C { &self.client }

    /// Apply one concrete resource document.
    ///
    /// A missing (404) or unreadable (403) live object is skipped without sending
    /// anything. A live object labelled for debug only receives the pending
    /// annotation. Otherwise the desired document, with dropped fields nulled and
    /// the last-applied annotation refreshed, is sent as a merge patch.
    pub async fn apply(&self, desc: &ResourceDescriptor, mut desired: Json) -> ApplyResult {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let name = path::get_str(&desired, &["metadata", "name"])
            .ok_or_else(|| ApplyError::InvalidManifest(format!("{} missing metadata.name", desc.kind)))?
            .to_string();
        let namespace = self
            .namespace
            .clone()
            .or_else(|| path::get_str(&desired, &["metadata", "namespace"]).map(str::to_string));
        let ns = namespace.as_deref().filter(|_| desc.namespaced);
        let uri = desc.uri(&name, ns);
        debug!(uri = %uri, "apply");

        let get = self.client.get(desc, &name, ns).await?;
        let live = match get.status_code {
            200 => {
                let rv = path::get_str(&get.body, &["metadata", "resourceVersion"]).unwrap_or("");
                debug!(uri = %uri, code = 200, resource_version = %rv, "get");
                get.body
            }
            404 | 403 => {
                debug!(uri = %uri, code = get.status_code, "get: not an attached cluster, skipping");
                counter!("apply_skipped", 1u64);
                return Ok(Outcome { uri, action: Action::Skipped, status_code: get.status_code, body: Json::Null });
            }
            code => {
                debug!(uri = %uri, code, "get");
                counter!("apply_err", 1u64);
                return Err(ApplyError::Rejected { uri, status_code: code, body: get.body });
            }
        };

        if debug_enabled(&live) {
            warn!(uri = %uri, "debug enabled on resource: skipping modifying resource, adding {}", PENDING_ANNOTATION);
            let patch = pending_patch(&desired)?;
            let res = self.client.merge_patch(desc, &name, ns, &patch).await?;
            if !res.is_success() {
                counter!("apply_err", 1u64);
                return Err(ApplyError::Rejected { uri, status_code: res.status_code, body: res.body });
            }
            counter!("apply_pending", 1u64);
            return Ok(Outcome { uri, action: Action::Pending, status_code: res.status_code, body: res.body });
        }

        prepare_patch(&mut desired, &live, &uri)?;

        let res = self.client.merge_patch(desc, &name, ns, &desired).await?;
        debug!(uri = %uri, code = res.status_code, "merge patch");
        if !res.is_success() {
            counter!("apply_err", 1u64);
            return Err(ApplyError::Rejected { uri, status_code: res.status_code, body: res.body });
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        Ok(Outcome { uri, action: Action::Patched, status_code: res.status_code, body: res.body })
    }
}

fn debug_enabled(live: &Json) -> bool {
    path::get_str(live, &["metadata", "labels", DEBUG_LABEL])
        .unwrap_or("false")
        .eq_ignore_ascii_case("true")
}

/// Patch that records `desired` under the pending annotation and touches nothing else.
pub fn pending_patch(desired: &Json) -> Result<Json, ApplyError> {
    let serialized = serde_json::to_string(desired).context("serializing pending configuration")?;
    let mut patch = Json::Object(Default::default());
    path::set(&mut patch, &["metadata", "annotations", PENDING_ANNOTATION], Json::String(serialized));
    Ok(patch)
}

/// Turn `desired` into the merge patch for a non-debug live object.
///
/// Clears a stale pending annotation, normalizes a null annotations map, nulls
/// fields dropped since the last-applied snapshot and writes the new snapshot.
/// The snapshot stored is the document before nulling.
pub fn prepare_patch(desired: &mut Json, live: &Json, uri: &str) -> Result<(), ApplyError> {
    normalize_annotations(desired);
    let pending = path::get_str(live, &["metadata", "annotations", PENDING_ANNOTATION]);
    if pending.is_some_and(|p| !p.is_empty()) {
        path::set(desired, &["metadata", "annotations", PENDING_ANNOTATION], Json::Null);
    }

    let last_applied = path::get_str(live, &["metadata", "annotations", LAST_APPLIED_ANNOTATION])
        .filter(|s| !s.is_empty() && *s != ADDITIVE_MERGE_PATCH_SENTINEL);
    let snapshot = match last_applied {
        None => {
            warn!(uri = %uri, "no {} found", LAST_APPLIED_ANNOTATION);
            serialize(desired)?
        }
        Some(raw) => {
            let last_applied: Json = serde_json::from_str(raw)
                .map_err(|source| ApplyError::CorruptLastApplied { uri: uri.to_string(), source })?;
            let original = desired.clone();
            reconcile_fields(desired, &last_applied);
            normalize_annotations(desired);
            serialize(&original)?
        }
    };
    path::set(desired, &["metadata", "annotations", LAST_APPLIED_ANNOTATION], Json::String(snapshot));
    Ok(())
}

fn normalize_annotations(desired: &mut Json) {
    if matches!(path::lookup(desired, &ANNOTATIONS), Lookup::Null) {
        path::set(desired, &ANNOTATIONS, Json::Object(Default::default()));
    }
}

fn serialize(doc: &Json) -> Result<String, ApplyError> {
    Ok(serde_json::to_string(doc).context("serializing last-applied configuration")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live_with(annotations: Json) -> Json {
        json!({ "metadata": { "name": "a", "resourceVersion": "7", "annotations": annotations } })
    }

    fn snapshot_of(doc: &Json) -> Json {
        let raw = path::get_str(doc, &["metadata", "annotations", LAST_APPLIED_ANNOTATION]).expect("snapshot");
        serde_json::from_str(raw).expect("snapshot json")
    }

    #[test]
    fn without_snapshot_stores_document_verbatim() {
        let mut desired = json!({ "metadata": { "name": "a" }, "spec": { "size": 5 } });
        let before = desired.clone();
        prepare_patch(&mut desired, &live_with(json!({})), "u").unwrap();
        assert_eq!(desired["spec"], json!({ "size": 5 }));
        assert_eq!(snapshot_of(&desired), before);
    }

    #[test]
    fn additive_sentinel_skips_nulling() {
        let mut desired = json!({ "metadata": { "name": "a" }, "spec": { "size": 5 } });
        let live = live_with(json!({ LAST_APPLIED_ANNOTATION: ADDITIVE_MERGE_PATCH_SENTINEL }));
        prepare_patch(&mut desired, &live, "u").unwrap();
        assert_eq!(desired["spec"], json!({ "size": 5 }));
    }

    #[test]
    fn snapshot_drives_nulling_and_is_replaced_by_pre_null_copy() {
        let last = json!({ "metadata": { "name": "a" }, "spec": { "size": 3, "extra": "x" } });
        let live = live_with(json!({ LAST_APPLIED_ANNOTATION: last.to_string() }));
        let mut desired = json!({ "metadata": { "name": "a" }, "spec": { "size": 5 } });
        prepare_patch(&mut desired, &live, "u").unwrap();
        assert_eq!(desired["spec"], json!({ "size": 5, "extra": null }));
        assert_eq!(snapshot_of(&desired), json!({ "metadata": { "name": "a" }, "spec": { "size": 5 } }));
    }

    #[test]
    fn null_annotations_become_empty_mapping() {
        let mut desired = json!({ "metadata": { "name": "a", "annotations": null } });
        prepare_patch(&mut desired, &live_with(json!({})), "u").unwrap();
        let annotations = desired["metadata"]["annotations"].as_object().expect("mapping");
        assert!(annotations.contains_key(LAST_APPLIED_ANNOTATION));
    }

    #[test]
    fn stale_pending_annotation_is_cleared() {
        let mut desired = json!({ "metadata": { "name": "a" } });
        let live = live_with(json!({ PENDING_ANNOTATION: "{\"old\":true}" }));
        prepare_patch(&mut desired, &live, "u").unwrap();
        assert!(desired["metadata"]["annotations"][PENDING_ANNOTATION].is_null());
        assert!(desired["metadata"]["annotations"].as_object().unwrap().contains_key(PENDING_ANNOTATION));
    }

    #[test]
    fn unreadable_snapshot_is_an_error() {
        let mut desired = json!({ "metadata": { "name": "a" } });
        let live = live_with(json!({ LAST_APPLIED_ANNOTATION: "{not json" }));
        let err = prepare_patch(&mut desired, &live, "u").unwrap_err();
        assert!(matches!(err, ApplyError::CorruptLastApplied { .. }), "err={}", err);
    }

    #[test]
    fn pending_patch_only_carries_the_annotation() {
        let desired = json!({ "metadata": { "name": "a" }, "spec": { "size": 5 } });
        let patch = pending_patch(&desired).unwrap();
        let annotations = patch["metadata"]["annotations"].as_object().unwrap();
        assert_eq!(patch.as_object().unwrap().len(), 1);
        assert_eq!(patch["metadata"].as_object().unwrap().len(), 1);
        assert_eq!(annotations.len(), 1);
        let stored: Json = serde_json::from_str(annotations[PENDING_ANNOTATION].as_str().unwrap()).unwrap();
        assert_eq!(stored, desired);
    }

    #[test]
    fn debug_label_is_case_insensitive() {
        assert!(debug_enabled(&json!({ "metadata": { "labels": { DEBUG_LABEL: "TRUE" } } })));
        assert!(!debug_enabled(&json!({ "metadata": { "labels": { DEBUG_LABEL: "no" } } })));
        assert!(!debug_enabled(&json!({ "metadata": {} })));
    }
}
