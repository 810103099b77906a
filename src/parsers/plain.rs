//! Fallback parser for lines no format-specific parser accepts.

use serde_json::Value;

use super::{ParserConfig, base_map_mut};
use crate::entry::EntryMap;

/// Wraps the raw line into a record, placing it under the raw-log field of
/// the user submap. Invalid UTF-8 is replaced rather than dropped.
pub fn parse_plain(config: &ParserConfig, line: &[u8]) -> EntryMap {
    let mut record = EntryMap::new();
    let base = base_map_mut(&mut record, &config.user_log_fields_key);

    base.insert(
        config.raw_log_field_key.clone(),
        Value::String(String::from_utf8_lossy(line).into_owned()),
    );

    record
}
