//! Manifest decomposition: `v1/List` fan-out and per-resource dispatch.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value as Json;
use settle_core::{path, Action, ApplyError, ApplyResult, Outcome, ResourceClient};
use tracing::debug;

use crate::Applier;

/// Verb a resolved descriptor must support for the engine to update it.
pub const UPDATE_VERB: &str = "patch";

/// Apply a parsed document.
///
/// A `v1/List` has every item applied concurrently; all items run to completion
/// and the list fails with the first failing item (by position), otherwise it
/// reports the first item's outcome. Any other document is resolved to a
/// descriptor and handed to the engine. Errors come back as the result, never
/// as a panic or early return, so siblings in a list are unaffected.
pub fn decompose<'a, C: ResourceClient>(applier: &'a Applier<C>, document: Json) -> BoxFuture<'a, ApplyResult> {
    async move {
        let api_version = path::get_str(&document, &["apiVersion"]).map(str::to_string);
        let kind = path::get_str(&document, &["kind"]).map(str::to_string);
        let (Some(api_version), Some(kind)) = (api_version, kind) else {
            return Err(ApplyError::InvalidManifest("document missing apiVersion or kind".into()));
        };

        if is_list(&api_version, &kind, &document) {
            let items = match document {
                Json::Object(mut obj) => match obj.remove("items") {
                    Some(Json::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            debug!(items = items.len(), "decomposing list");
            let results = join_all(items.into_iter().map(|item| decompose(applier, item))).await;
            return aggregate(results);
        }

        let desc = applier.client().resolve(&api_version, &kind, UPDATE_VERB).await?;
        applier.apply(&desc, document).await
    }
    .boxed()
}

fn is_list(api_version: &str, kind: &str, document: &Json) -> bool {
    api_version.eq_ignore_ascii_case("v1")
        && kind.eq_ignore_ascii_case("list")
        && document.get("items").is_some_and(Json::is_array)
}

/// All-or-nothing join over list items.
fn aggregate(results: Vec<ApplyResult>) -> ApplyResult {
    let mut first = None;
    for result in results {
        match result {
            Ok(outcome) if outcome.is_success() => {
                if first.is_none() {
                    first = Some(outcome);
                }
            }
            Ok(outcome) => {
                return Err(ApplyError::Rejected { uri: outcome.uri, status_code: outcome.status_code, body: outcome.body });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(first.unwrap_or(Outcome { uri: "v1/List".into(), action: Action::Empty, status_code: 200, body: Json::Null }))
}
