//! Path-based access into document trees.
//!
//! Documents are plain `serde_json::Value` trees. Lookups distinguish a key that
//! is missing from a key explicitly set to null, which field reconciliation
//! depends on.

use serde_json::{Map, Value as Json};

/// Result of looking up a path: absent, explicit null, or a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Absent,
    Null,
    Value(&'a Json),
}

impl<'a> Lookup<'a> {
    pub fn is_absent(&self) -> bool { matches!(self, Lookup::Absent) }

    pub fn value(&self) -> Option<&'a Json> {
        match self {
            Lookup::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Walk `path` through nested mappings. Anything that is not a mapping along the
/// way (scalar, sequence, null) makes the remainder absent.
pub fn lookup<'a, S: AsRef<str>>(doc: &'a Json, path: &[S]) -> Lookup<'a> {
    let mut cur = doc;
    for seg in path {
        match cur.as_object().and_then(|m| m.get(seg.as_ref())) {
            Some(next) => cur = next,
            None => return Lookup::Absent,
        }
    }
    match cur {
        Json::Null => Lookup::Null,
        v => Lookup::Value(v),
    }
}

/// Like [`lookup`] but collapses null and absent.
pub fn get<'a, S: AsRef<str>>(doc: &'a Json, path: &[S]) -> Option<&'a Json> {
    lookup(doc, path).value()
}

pub fn get_str<'a, S: AsRef<str>>(doc: &'a Json, path: &[S]) -> Option<&'a str> {
    get(doc, path).and_then(|v| v.as_str())
}

/// Set `path` to `value`, creating intermediate mappings. An intermediate that is
/// not a mapping is replaced with an empty one. An empty path replaces the root.
pub fn set<S: AsRef<str>>(doc: &mut Json, path: &[S], value: Json) {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return;
    };
    let mut cur = doc;
    for seg in parents {
        cur = ensure_object(cur)
            .entry(seg.as_ref().to_string())
            .or_insert_with(|| Json::Object(Map::new()));
    }
    ensure_object(cur).insert(last.as_ref().to_string(), value);
}

fn ensure_object(v: &mut Json) -> &mut Map<String, Json> {
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    match v {
        Json::Object(m) => m,
        _ => unreachable!("value was just replaced with an object"),
    }
}
