use crate::logging::append_run_log;
use crate::normalize::text_equivalent;
use crate::types::{CapturedExchange, Expectation, Side};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn compare_json(expected: &str, actual: &str) -> bool {
    let parsed = serde_json::from_str::<Value>(expected)
        .and_then(|e| serde_json::from_str::<Value>(actual).map(|a| (e, a)));
    match parsed {
        Ok((expected, actual)) => json_values_equal(&expected, &actual),
        Err(error) => {
            append_run_log(
                "warn",
                "compare.json.malformed",
                json!({ "error": error.to_string() }),
            );
            false
        }
    }
}

fn json_values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, value)| {
                    right
                        .get(key)
                        .is_some_and(|other| json_values_equal(value, other))
                })
        }
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right)
                    .all(|(value, other)| json_values_equal(value, other))
        }
        (Value::String(left), Value::String(right)) => text_equivalent(left, right),
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (Value::Bool(left), Value::Bool(right)) => left == right,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum XmlValue {
    Text(String),
    Nested(BTreeMap<String, XmlValue>),
}

pub fn compare_xml(expected: &str, actual: &str) -> bool {
    match (flatten_xml(expected), flatten_xml(actual)) {
        (Ok(left), Ok(right)) => xml_maps_equal(&left, &right),
        (Err(error), _) | (_, Err(error)) => {
            append_run_log(
                "warn",
                "compare.xml.malformed",
                json!({ "error": error }),
            );
            false
        }
    }
}

/// Flattens the document into `{root: ...}` so the root name and a leaf root's
/// text both take part in the comparison.
fn flatten_xml(text: &str) -> Result<BTreeMap<String, XmlValue>, String> {
    let document = roxmltree::Document::parse(text.trim()).map_err(|e| e.to_string())?;
    let root = document.root_element();
    let mut map = BTreeMap::new();
    map.insert(
        root.tag_name().name().to_lowercase(),
        element_value(root),
    );
    Ok(map)
}

fn element_value(node: roxmltree::Node<'_, '_>) -> XmlValue {
    let children = node.children().filter(|child| child.is_element()).collect::<Vec<_>>();
    if children.is_empty() {
        let text = node
            .descendants()
            .filter(|child| child.is_text())
            .filter_map(|child| child.text())
            .collect::<String>();
        return XmlValue::Text(text.trim().to_string());
    }
    let mut map = BTreeMap::new();
    for child in children {
        // Repeated siblings collapse onto the last occurrence.
        map.insert(child.tag_name().name().to_lowercase(), element_value(child));
    }
    XmlValue::Nested(map)
}

fn xml_maps_equal(a: &BTreeMap<String, XmlValue>, b: &BTreeMap<String, XmlValue>) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, value)| match (value, b.get(key)) {
            (XmlValue::Text(left), Some(XmlValue::Text(right))) => {
                left.trim().to_lowercase() == right.trim().to_lowercase()
            }
            (XmlValue::Nested(left), Some(XmlValue::Nested(right))) => xml_maps_equal(left, right),
            _ => false,
        })
}

/// Routes a payload comparison by declared data type.
pub fn compare_payload(expected: &str, actual: &str, data_type: &str) -> bool {
    let data_type = data_type.trim();
    if data_type.eq_ignore_ascii_case("json") {
        compare_json(expected, actual)
    } else if data_type.eq_ignore_ascii_case("xml") {
        compare_xml(expected, actual)
    } else {
        text_equivalent(expected, actual)
    }
}

fn status_matches(expected: &str, actual: &str) -> bool {
    match (expected.parse::<i64>(), actual.trim().parse::<i64>()) {
        (Ok(left), Ok(right)) => left == right,
        _ => expected.eq_ignore_ascii_case(actual.trim()),
    }
}

/// Compares one stage and side. Only fields the expectation constrains are
/// checked; an unmeaningful expectation yields no issues at all.
pub fn compare_stage(
    stage: u32,
    side: Side,
    expected: Option<&Expectation>,
    actual: Option<&CapturedExchange>,
    declared_type: &str,
) -> Vec<String> {
    let Some(expected) = expected.filter(|expected| expected.is_meaningful()) else {
        return Vec::new();
    };
    let label = side.label();
    let Some(actual) = actual else {
        return vec![format!("Stage {stage}: Missing {} output.", side.as_str())];
    };

    let mut issues = Vec::new();

    if !expected.method.trim().is_empty()
        && !expected.method.trim().eq_ignore_ascii_case(actual.method.trim())
    {
        issues.push(format!(
            "Stage {stage}: {label} Method expected '{}', actual '{}'.",
            expected.method.trim(),
            actual.method.trim()
        ));
    }

    if let Some(code) = expected.constrained_status() {
        let actual_code = actual.status_code.as_deref().unwrap_or_default();
        if !status_matches(code, actual_code) {
            issues.push(format!(
                "Stage {stage}: {label} StatusCode expected {code}, actual {}.",
                actual_code.trim()
            ));
        }
    }

    if expected.byte_size != 0 && expected.byte_size != actual.byte_size {
        issues.push(format!(
            "Stage {stage}: {label} byte size expected {}, actual {}.",
            expected.byte_size, actual.byte_size
        ));
    }

    if !expected.data_type.trim().is_empty()
        && !expected.data_type.trim().eq_ignore_ascii_case(actual.data_type.trim())
    {
        issues.push(format!(
            "Stage {stage}: {label} DataType expected '{}', actual '{}'.",
            expected.data_type.trim(),
            actual.data_type.trim()
        ));
    }

    if !expected.payload.trim().is_empty() {
        let routing = if expected.data_type.trim().is_empty() {
            declared_type
        } else {
            expected.data_type.as_str()
        };
        if !compare_payload(&expected.payload, &actual.payload, routing) {
            issues.push(format!("Stage {stage}: {label} payload mismatch."));
        }
    }

    if !expected.console_output.trim().is_empty()
        && !text_equivalent(&expected.console_output, &actual.console_output)
    {
        issues.push(format!("Stage {stage}: {label} console output mismatch."));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(stage: u32) -> Expectation {
        Expectation::new(stage)
    }

    #[test]
    fn json_equality_ignores_key_order() {
        assert!(compare_json(r#"{"a":1,"b":2}"#, r#"{"b":2,"a":1}"#));
        assert!(compare_json(r#"{"n":1}"#, r#"{"n":1.0}"#));
        assert!(!compare_json(r#"{"a":1}"#, r#"{"a":1,"b":2}"#));
        assert!(!compare_json("[1,2]", "[2,1]"));
        assert!(!compare_json(r#"{"a":null}"#, r#"{"a":false}"#));
    }

    #[test]
    fn json_strings_compare_after_normalization() {
        assert!(compare_json(r#"{"x":"O’Brien"}"#, r#"{"x":"O'Brien"}"#));
        assert!(compare_json(r#"{"x":"Hello   World"}"#, r#"{"x":"hello world"}"#));
    }

    #[test]
    fn malformed_json_is_never_equal() {
        assert!(!compare_json("{", "{"));
        assert!(!compare_json(r#"{"a":1}"#, "not json"));
    }

    #[test]
    fn json_is_reflexive() {
        for sample in [r#"{"a":[1,{"b":"c"}],"d":null}"#, "[]", "3.25", r#""s""#, "true"] {
            assert!(compare_json(sample, sample), "{sample}");
        }
    }

    #[test]
    fn xml_compares_as_case_insensitive_maps() {
        let a = "<User><Name> Ann </Name><Address><City>Hue</City></Address></User>";
        let b = "<user><address><city>HUE</city></address><name>ann</name></user>";
        assert!(compare_xml(a, b));
        assert!(!compare_xml(a, "<user><name>ann</name><address><city>Hanoi</city></address></user>"));
        assert!(!compare_xml(a, "<user><name>ann</name></user>"));
        assert!(!compare_xml("<a>1</a>", "<a>2</a>"));
        assert!(!compare_xml("<a>", "<a/>"));
    }

    #[test]
    fn unmeaningful_expectation_produces_no_issues() {
        let issues = compare_stage(1, Side::Client, Some(&client(1)), None, "");
        assert!(issues.is_empty());
        assert!(compare_stage(1, Side::Server, None, None, "").is_empty());
    }

    #[test]
    fn missing_capture_is_one_issue() {
        let mut expected = client(2);
        expected.method = "GET".to_string();
        let issues = compare_stage(2, Side::Server, Some(&expected), None, "");
        assert_eq!(issues, vec!["Stage 2: Missing server output.".to_string()]);
    }

    #[test]
    fn only_constrained_fields_are_checked() {
        let mut expected = client(1);
        expected.status_code = Some("200".to_string());
        let mut actual = CapturedExchange::new(1);
        actual.status_code = Some(" 200".to_string());
        actual.method = "POST".to_string();
        actual.byte_size = 99;
        actual.payload = "anything".to_string();
        assert!(compare_stage(1, Side::Client, Some(&expected), Some(&actual), "").is_empty());
    }

    #[test]
    fn mismatches_name_stage_field_and_values() {
        let mut expected = client(2);
        expected.byte_size = 10;
        expected.method = "get".to_string();
        expected.status_code = Some("200".to_string());
        let mut actual = CapturedExchange::new(2);
        actual.byte_size = 12;
        actual.method = "GET".to_string();
        actual.status_code = Some("-1".to_string());

        let issues = compare_stage(2, Side::Client, Some(&expected), Some(&actual), "");
        assert_eq!(
            issues,
            vec![
                "Stage 2: Client StatusCode expected 200, actual -1.".to_string(),
                "Stage 2: Client byte size expected 10, actual 12.".to_string(),
            ]
        );
    }

    #[test]
    fn payload_routing_falls_back_to_declared_type() {
        let mut expected = client(1);
        expected.payload = r#"{"a":1,"b":[true]}"#.to_string();
        let mut actual = CapturedExchange::new(1);
        actual.payload = r#"{ "b": [true], "a": 1 }"#.to_string();
        actual.data_type = "JSON".to_string();
        assert!(compare_stage(1, Side::Client, Some(&expected), Some(&actual), "json").is_empty());

        expected.data_type = "XML".to_string();
        let issues = compare_stage(1, Side::Client, Some(&expected), Some(&actual), "json");
        assert!(issues.contains(&"Stage 1: Client payload mismatch.".to_string()));
    }

    #[test]
    fn console_output_uses_normalized_equality() {
        let mut expected = client(3);
        expected.console_output = "Welcome!\nEnter choice:".to_string();
        let mut actual = CapturedExchange::new(3);
        actual.console_output = "welcome!\nEnter   choice:\n".to_string();
        assert!(compare_stage(3, Side::Server, Some(&expected), Some(&actual), "").is_empty());

        actual.console_output = "bye\n".to_string();
        assert_eq!(
            compare_stage(3, Side::Server, Some(&expected), Some(&actual), ""),
            vec!["Stage 3: Server console output mismatch.".to_string()]
        );
    }
}
