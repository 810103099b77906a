//! Line parsers turning raw log bytes into structured records.

mod containerd;
mod docker;
mod nginx;
mod plain;
mod sli;

use serde_json::Value;
use snafu::Snafu;

use crate::entry::EntryMap;
pub use containerd::parse_containerd;
pub use docker::parse_docker;
pub use nginx::{
    UPSTREAM_RESPONSE_TIME, UPSTREAM_RESPONSE_TIME_FLOAT, UPSTREAM_RESPONSE_TIME_TOTAL,
};
pub use plain::parse_plain;
pub use sli::{SliMessage, SliMetrics, SliObserver, SliParser, SliStub};

/* Processing control fields, consumed by the filter stage. */
pub const LOG_KEY_SLA: &str = "sla";
pub const LOG_KEY_LOGGING: &str = "logging";

/* SLI record fields. */
pub const LOG_KEY_HOST: &str = "host";
pub const LOG_KEY_REQUEST_METHOD: &str = "request_method";
pub const LOG_KEY_REQUEST_URI: &str = "request_uri";
pub const LOG_KEY_SERVER_PROTOCOL: &str = "server_protocol";
pub const LOG_KEY_REQUEST_TIME: &str = "request_time";
pub const LOG_KEY_STATUS: &str = "status";
pub const LOG_KEY_UPSTREAM_POD_NAME: &str = "upstream_pod_name";

/* Docker / containerd engine fields. */
pub const LOG_KEY_LOG: &str = "log";
pub const LOG_KEY_TIME: &str = "time";
pub const LOG_KEY_STREAM: &str = "stream";

/// Field placement configuration shared by all parsers. Each key selects the
/// submap a class of fields lands in; an empty key means the record root.
#[derive(Debug, Clone, Default)]
pub struct ParserConfig {
    /// Where the user's own log fields are placed.
    pub user_log_fields_key: String,
    /// Where the container engine fields (docker outer fields, containerd
    /// `time`/`stream`) are placed.
    pub cri_fields_key: String,
    /// Where the shipper and Kubernetes metadata is merged.
    pub extends_fields_key: String,
    /// Field that receives the raw line when the user payload is not a JSON
    /// object.
    pub raw_log_field_key: String,
    /// Whether a JSON user payload is flattened into dotted keys.
    pub flatten_user_log: bool,
}

#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("outer json unmarshalling: {source}"))]
    OuterJson { source: serde_json::Error },

    #[snafu(display("line doesn't contain the '{LOG_KEY_LOG}' field"))]
    MissingLogField,

    #[snafu(display("the '{LOG_KEY_LOG}' field does not contain a string"))]
    LogFieldNotString,

    #[snafu(display("line is not valid utf-8: {source}"))]
    NotUtf8 { source: std::str::Utf8Error },

    #[snafu(display("line does not match the containerd format"))]
    FormatMismatch,
}

/// Returns the submap living under `key`, creating it when missing and
/// replacing a non-object value; an empty `key` selects `map` itself.
///
/// All placement decisions go through here so the docker and containerd
/// paths cannot diverge.
pub(crate) fn base_map_mut<'a>(map: &'a mut EntryMap, key: &str) -> &'a mut EntryMap {
    if key.is_empty() {
        return map;
    }

    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(EntryMap::new()));

    if !slot.is_object() {
        *slot = Value::Object(EntryMap::new());
    }

    match slot {
        Value::Object(submap) => submap,
        _ => unreachable!("slot was just made an object"),
    }
}

/// Places the user log payload: a JSON object is merged (flattened or
/// shallow) into the user submap, anything else lands under the raw-log
/// field. The nginx upstream-time transform runs on the resulting submap.
pub(crate) fn set_log_field_content(record: &mut EntryMap, config: &ParserConfig, content: &str) {
    let inner = serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        });

    let base = base_map_mut(record, &config.user_log_fields_key);

    match inner {
        Some(map) if config.flatten_user_log => crate::entry::flatten_into(base, &map),
        Some(map) => {
            for (key, value) in map {
                base.insert(key, value);
            }
        }
        None => {
            base.insert(
                config.raw_log_field_key.clone(),
                Value::String(content.to_string()),
            );
        }
    }

    nginx::upstream_time_transform(base);
}

#[cfg(test)]
pub(crate) fn test_config() -> ParserConfig {
    ParserConfig {
        raw_log_field_key: "msg".to_string(),
        flatten_user_log: true,
        ..ParserConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn base_map_mut_selects_root_for_empty_key() {
        let mut map = EntryMap::new();
        base_map_mut(&mut map, "").insert("a".into(), json!(1));

        assert_eq!(Value::Object(map), json!({"a": 1}));
    }

    #[test]
    fn base_map_mut_creates_and_reuses_submap() {
        let mut map = EntryMap::new();
        base_map_mut(&mut map, "log").insert("a".into(), json!(1));
        base_map_mut(&mut map, "log").insert("b".into(), json!(2));

        assert_eq!(Value::Object(map), json!({"log": {"a": 1, "b": 2}}));
    }

    #[test]
    fn base_map_mut_replaces_non_object_values() {
        let mut map = EntryMap::new();
        map.insert("log".into(), json!("scalar"));
        base_map_mut(&mut map, "log").insert("a".into(), json!(1));

        assert_eq!(Value::Object(map), json!({"log": {"a": 1}}));
    }
}
