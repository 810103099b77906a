//! Upstream response time transform, applied by convention to records whose
//! user fields carry nginx access log data.

use serde_json::{Number, Value};

use crate::entry::EntryMap;

pub const UPSTREAM_RESPONSE_TIME: &str = "upstream_response_time";
pub const UPSTREAM_RESPONSE_TIME_FLOAT: &str = "upstream_response_time_float";
pub const UPSTREAM_RESPONSE_TIME_TOTAL: &str = "upstream_response_time_total";

/// When `upstream_response_time` is present, derives two values from its
/// comma-separated numeric list: the last entry (the upstream that actually
/// replied) and the sum over all entries, rounded to three decimals.
/// Non-numeric and list values are left untouched.
pub(crate) fn upstream_time_transform(map: &mut EntryMap) {
    let Some(value) = map.get(UPSTREAM_RESPONSE_TIME) else {
        return;
    };

    let replacement = upstream_time(value, false);
    let total = upstream_time(value, true);

    if let Some(number) = replacement.and_then(Number::from_f64) {
        map.insert(
            UPSTREAM_RESPONSE_TIME_FLOAT.to_string(),
            Value::Number(number),
        );
    }

    if let Some(number) = total.and_then(Number::from_f64) {
        map.insert(
            UPSTREAM_RESPONSE_TIME_TOTAL.to_string(),
            Value::Number(number),
        );
    }
}

fn upstream_time(value: &Value, total: bool) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => upstream_time_from_string(text, total),
        _ => None,
    }
}

fn upstream_time_from_string(text: &str, total: bool) -> Option<f64> {
    let text = text.replace(' ', "");
    let values = text.split(',');

    if !total {
        return values.last()?.parse().ok();
    }

    let mut sum = 0.0;
    let mut empty = true;

    for value in values {
        let Ok(parsed) = value.parse::<f64>() else {
            continue;
        };

        empty = false;
        sum += parsed;
    }

    if empty {
        return None;
    }

    Some((sum * 1000.0).round() / 1000.0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transformed(value: Value) -> Value {
        let mut map = EntryMap::new();
        map.insert(UPSTREAM_RESPONSE_TIME.to_string(), value);
        upstream_time_transform(&mut map);
        Value::Object(map)
    }

    #[test]
    fn derives_last_and_total_from_a_list() {
        assert_eq!(
            transformed(json!("0.009, 1.142, 1.222")),
            json!({
                "upstream_response_time": "0.009, 1.142, 1.222",
                "upstream_response_time_float": 1.222,
                "upstream_response_time_total": 2.373,
            })
        );
    }

    #[test]
    fn numeric_value_is_carried_into_both_fields() {
        assert_eq!(
            transformed(json!(0.25)),
            json!({
                "upstream_response_time": 0.25,
                "upstream_response_time_float": 0.25,
                "upstream_response_time_total": 0.25,
            })
        );
    }

    #[test]
    fn partially_numeric_list_sums_what_parses() {
        assert_eq!(
            transformed(json!("0.1, -, 0.2")),
            json!({
                "upstream_response_time": "0.1, -, 0.2",
                // the last entry parses, the dash is skipped from the sum
                "upstream_response_time_float": 0.2,
                "upstream_response_time_total": 0.3,
            })
        );
    }

    #[test]
    fn non_numeric_values_are_left_untouched() {
        assert_eq!(
            transformed(json!("-")),
            json!({"upstream_response_time": "-"})
        );
        assert_eq!(
            transformed(json!(["0.1"])),
            json!({"upstream_response_time": ["0.1"]})
        );
    }
}
