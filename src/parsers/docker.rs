//! Parser for the docker json-file log format.

use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use super::{
    LOG_KEY_LOG, LogFieldNotStringSnafu, MissingLogFieldSnafu, OuterJsonSnafu, ParseError,
    ParserConfig, base_map_mut, set_log_field_content,
};
use crate::entry::EntryMap;

/// Parses one docker log line: an outer JSON object whose `log` field holds
/// the user payload. The remaining outer fields are grouped under the CRI
/// fields key; the payload gets the shared JSON-or-raw handling.
pub fn parse_docker(config: &ParserConfig, line: &[u8]) -> Result<EntryMap, ParseError> {
    let mut outer: EntryMap = serde_json::from_slice(line).context(OuterJsonSnafu)?;

    let log_field = outer.remove(LOG_KEY_LOG).context(MissingLogFieldSnafu)?;
    let content = match log_field {
        Value::String(content) => content,
        _ => return LogFieldNotStringSnafu.fail(),
    };

    let mut record = EntryMap::new();

    if config.cri_fields_key.is_empty() {
        record = outer;
    } else if !outer.is_empty() {
        base_map_mut(&mut record, &config.cri_fields_key).extend(outer);
    }

    set_log_field_content(&mut record, config, &content);
    Ok(record)
}
