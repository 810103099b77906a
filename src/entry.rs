//! Record types shared across the pipeline.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

/* Logstash-purposed metadata keys. */
pub const LABEL_DATACENTER: &str = "dc";
pub const LABEL_PURPOSE: &str = "purpose";
pub const LABEL_CONTAINER_ID: &str = "docker.container_id";
pub const LABEL_LOGSTASH_PREFIX: &str = "logstash_prefix";
pub const LABEL_LOGSTASH_NAMESPACE: &str = "namespace";
pub const LABEL_LOG_TYPE: &str = "type";
pub const LABEL_TIME: &str = "time";

/* Kubernetes metadata keys. */
pub const KUBERNETES_POD_NAME: &str = "kubernetes.pod_name";
pub const KUBERNETES_NAMESPACE_NAME: &str = "kubernetes.namespace_name";
pub const KUBERNETES_CONTAINER_NAME: &str = "kubernetes.container_name";
pub const KUBERNETES_NODE_HOSTNAME: &str = "kubernetes.node_hostname";

/// Reserved cursor-store key under which the journal position is persisted.
/// Chosen as the standard journal file ending; container log paths must never
/// collide with it.
pub const JOURNAL_CURSOR_KEY: &str = "system.journal";
pub const JOURNAL_NAMESPACE: &str = "journald";

/// On-disk layout the log line was produced by, which decides the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Docker,
    Containerd,
}

/// A single raw log line emitted by a follower, together with the metadata
/// map shared by every line of that follower. The map is emitted by
/// reference; stages must not mutate it. The parse stage owns the first
/// mutable per-record map.
#[derive(Debug, Clone)]
pub struct Entry {
    pub origin: Bytes,
    pub format: LogFormat,
    pub extends: Arc<EntryMap>,
}

/// Parsed record interior: string keys to heterogeneous JSON values.
pub type EntryMap = Map<String, Value>;

/// Shorthand operations on [`EntryMap`].
pub trait EntryMapExt {
    /// Right-biased merge of `extends` into `self`.
    fn extend_with(&mut self, extends: &EntryMap);

    /// Returns a new map retaining only the listed keys.
    fn filtered(&self, keys: &[&str]) -> EntryMap;

    /// Returns the string under `key`, or `""` for absent or non-string
    /// values.
    fn str_field(&self, key: &str) -> &str;

    fn pod_name(&self) -> &str;
    fn namespace_name(&self) -> &str;
    fn container_name(&self) -> &str;
}

impl EntryMapExt for EntryMap {
    fn extend_with(&mut self, extends: &EntryMap) {
        for (key, value) in extends {
            self.insert(key.clone(), value.clone());
        }
    }

    fn filtered(&self, keys: &[&str]) -> EntryMap {
        let mut filtered = EntryMap::new();

        for key in keys {
            if let Some(value) = self.get(*key) {
                filtered.insert((*key).to_string(), value.clone());
            }
        }

        filtered
    }

    fn str_field(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn pod_name(&self) -> &str {
        self.str_field(KUBERNETES_POD_NAME)
    }

    fn namespace_name(&self) -> &str {
        self.str_field(KUBERNETES_NAMESPACE_NAME)
    }

    fn container_name(&self) -> &str {
        self.str_field(KUBERNETES_CONTAINER_NAME)
    }
}

/// Unpacks `nested` into `target`, compounding descending object keys with
/// dots. Only objects are recursed into; arrays and scalars are stored
/// as-is.
pub fn flatten_into(target: &mut EntryMap, nested: &EntryMap) {
    for (key, value) in nested {
        flatten_value(target, key.clone(), value);
    }
}

fn flatten_value(target: &mut EntryMap, key: String, value: &Value) {
    match value {
        Value::Object(nested) => {
            for (subkey, subvalue) in nested {
                flatten_value(target, format!("{key}.{subkey}"), subvalue);
            }
        }
        other => {
            target.insert(key, other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn as_map(value: Value) -> EntryMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn extend_is_right_biased() {
        let mut map = as_map(json!({"a": 1, "b": "old"}));
        let extends = as_map(json!({"b": "new", "c": true}));

        map.extend_with(&extends);

        assert_eq!(Value::Object(map), json!({"a": 1, "b": "new", "c": true}));
    }

    #[test]
    fn filter_retains_only_listed_keys() {
        let map = as_map(json!({"a": 1, "b": 2, "c": 3}));

        let filtered = map.filtered(&["a", "c", "missing"]);

        assert_eq!(Value::Object(filtered), json!({"a": 1, "c": 3}));
    }

    #[test]
    fn filter_of_extended_empty_roundtrips() {
        let map = as_map(json!({
            "string": "value",
            "number": 12.5,
            "flag": false,
            "nested": {"x": 1},
            "list": [1, 2, 3],
            "nothing": null,
        }));
        let keys = map.keys().map(String::as_str).collect::<Vec<_>>();

        let mut extended = EntryMap::new();
        extended.extend_with(&map);

        assert_eq!(extended.filtered(&keys), map);
    }

    #[test]
    fn flatten_compounds_nested_keys() {
        let mut target = as_map(json!({"top": true}));
        let nested = as_map(json!({
            "a": {"b": {"c": 1}, "d": "x"},
            "plain": "y",
            "list": [{"keep": "as-is"}],
        }));

        flatten_into(&mut target, &nested);

        assert_eq!(
            Value::Object(target),
            json!({
                "top": true,
                "a.b.c": 1,
                "a.d": "x",
                "plain": "y",
                "list": [{"keep": "as-is"}],
            })
        );
    }

    #[test]
    fn str_field_defaults_to_empty() {
        let map = as_map(json!({"kubernetes.pod_name": "pod-1", "num": 3}));

        assert_eq!(map.pod_name(), "pod-1");
        assert_eq!(map.namespace_name(), "");
        assert_eq!(map.str_field("num"), "");
    }
}
