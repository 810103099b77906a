//! Parser for the containerd CRI log format.

use std::sync::LazyLock;

use regex::Regex;
use snafu::{OptionExt, ResultExt};

use super::{
    FormatMismatchSnafu, LOG_KEY_STREAM, LOG_KEY_TIME, NotUtf8Snafu, ParseError, ParserConfig,
    base_map_mut, set_log_field_content,
};
use crate::entry::EntryMap;

static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("(?s)^(.+) (stdout|stderr) . (.*)$").expect("containerd line pattern is valid")
});

/// Parses one containerd log line of the shape
/// `<time> <stream> <tag> <payload>`. `time` and `stream` are placed under
/// the CRI fields key; the payload gets the shared JSON-or-raw handling.
pub fn parse_containerd(config: &ParserConfig, line: &[u8]) -> Result<EntryMap, ParseError> {
    let text = std::str::from_utf8(line).context(NotUtf8Snafu)?;
    let groups = LINE_PATTERN.captures(text).context(FormatMismatchSnafu)?;

    let mut record = EntryMap::new();
    set_cri_fields(&mut record, &config.cri_fields_key, &groups[1], &groups[2]);
    set_log_field_content(&mut record, config, &groups[3]);

    Ok(record)
}

fn set_cri_fields(record: &mut EntryMap, target_field: &str, time: &str, stream: &str) {
    let base = base_map_mut(record, target_field);
    base.insert(LOG_KEY_TIME.to_string(), time.into());
    base.insert(LOG_KEY_STREAM.to_string(), stream.into());
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::super::test_config;
    use super::*;

    #[test]
    fn plain_message_with_top_level_fields() {
        let record = parse_containerd(
            &test_config(),
            b"2020-09-10T07:00:03.585507743Z stdout F my message",
        )
        .unwrap();

        assert_eq!(
            Value::Object(record),
            json!({
                "time": "2020-09-10T07:00:03.585507743Z",
                "stream": "stdout",
                "msg": "my message",
            })
        );
    }

    #[test]
    fn json_payload_is_flattened_next_to_the_cri_fields() {
        let record = parse_containerd(
            &test_config(),
            br#"2020-09-10T07:00:03Z stderr F {"level":"error","ctx":{"id":7}}"#,
        )
        .unwrap();

        assert_eq!(
            Value::Object(record),
            json!({
                "time": "2020-09-10T07:00:03Z",
                "stream": "stderr",
                "level": "error",
                "ctx.id": 7,
            })
        );
    }

    #[test]
    fn cri_fields_key_groups_time_and_stream() {
        let config = ParserConfig {
            cri_fields_key: "cri".to_string(),
            user_log_fields_key: "log".to_string(),
            raw_log_field_key: "msg".to_string(),
            flatten_user_log: true,
            ..ParserConfig::default()
        };

        let record =
            parse_containerd(&config, b"2020-09-10T07:00:03Z stdout P partial chunk").unwrap();

        assert_eq!(
            Value::Object(record),
            json!({
                "cri": {"time": "2020-09-10T07:00:03Z", "stream": "stdout"},
                "log": {"msg": "partial chunk"},
            })
        );
    }

    #[test]
    fn payload_may_span_multiple_lines() {
        let record =
            parse_containerd(&test_config(), b"t stdout F first\nsecond").unwrap();

        assert_eq!(record.get("msg"), Some(&json!("first\nsecond")));
    }

    #[test]
    fn rejects_lines_without_the_stream_marker() {
        assert!(matches!(
            parse_containerd(&test_config(), b"no marker here"),
            Err(ParseError::FormatMismatch)
        ));
    }
}
