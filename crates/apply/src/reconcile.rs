//! Field reconciliation against the last-applied snapshot.

use serde_json::Value as Json;
use settle_core::path;

/// Null every leaf that the last-applied snapshot had and `desired` no longer has,
/// so a merge patch removes it from the live object.
///
/// Only leaves (scalars and sequences) are nulled. A mapping in the snapshot is
/// recursed into unless the desired document explicitly nulls it or replaced it
/// with a non-mapping value. Keys already present in `desired` are never touched.
pub fn reconcile_fields(desired: &mut Json, last_applied: &Json) {
    let mut prefix = Vec::new();
    walk(desired, last_applied, &mut prefix);
}

fn walk(desired: &mut Json, last_applied: &Json, prefix: &mut Vec<String>) {
    let Some(fields) = last_applied.as_object() else { return };
    for (key, prior) in fields {
        prefix.push(key.clone());
        let found = path::lookup(desired, prefix.as_slice());
        let absent = found.is_absent();
        let descend = absent || found.value().is_some_and(Json::is_object);
        match prior {
            Json::Null => {}
            Json::Object(_) => {
                if descend {
                    walk(desired, prior, prefix);
                }
            }
            _ => {
                if absent {
                    path::set(desired, prefix.as_slice(), Json::Null);
                }
            }
        }
        prefix.pop();
    }
}
