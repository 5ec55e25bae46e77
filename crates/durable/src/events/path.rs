//! Dotted-path lookup into JSON payloads and subscription filter matching

use serde_json::Value;

use crate::model::EventFilter;

/// Resolve a dotted path such as `"contact.address.city"` inside `value`
///
/// Numeric segments index into arrays (`"items.0.sku"`). An empty path
/// resolves to `value` itself.
///
/// ```
/// use flowline_durable::events::resolve_path;
/// use serde_json::json;
///
/// let payload = json!({"contact": {"emails": ["a@x.io", "b@x.io"]}});
/// assert_eq!(resolve_path(&payload, "contact.emails.1"), Some(&json!("b@x.io")));
/// assert_eq!(resolve_path(&payload, "contact.phone"), None);
/// ```
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Whether every filter key resolves in `payload` to an equal value
///
/// An empty filter matches every payload.
pub fn filter_matches(filter: &EventFilter, payload: &Value) -> bool {
    filter.iter().all(|(path, expected)| {
        resolve_path(payload, path).is_some_and(|actual| json_eq(actual, expected))
    })
}

/// Structural equality where `1` and `1.0` are the same number
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(value: Value) -> EventFilter {
        match value {
            Value::Object(map) => map,
            other => panic!("filter must be an object, got {other}"),
        }
    }

    #[test]
    fn test_resolve_nested_and_indexed() {
        let payload = json!({
            "record_id": "R1",
            "form": {"fields": [{"name": "email"}, {"name": "phone"}]}
        });

        assert_eq!(resolve_path(&payload, "record_id"), Some(&json!("R1")));
        assert_eq!(
            resolve_path(&payload, "form.fields.1.name"),
            Some(&json!("phone"))
        );
        assert_eq!(resolve_path(&payload, "form.fields.7.name"), None);
        assert_eq!(resolve_path(&payload, "form.fields.x"), None);
        assert_eq!(resolve_path(&payload, "record_id.deeper"), None);
        assert_eq!(resolve_path(&payload, ""), Some(&payload));
    }

    #[test]
    fn test_null_is_a_value() {
        let payload = json!({"campaign": null});
        assert_eq!(resolve_path(&payload, "campaign"), Some(&Value::Null));
        assert!(filter_matches(&filter(json!({"campaign": null})), &payload));
        assert!(!filter_matches(&filter(json!({"missing": null})), &payload));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(filter_matches(&EventFilter::new(), &json!({"any": 1})));
        assert!(filter_matches(&EventFilter::new(), &Value::Null));
    }

    #[test]
    fn test_all_keys_must_match() {
        let payload = json!({"record_id": "R1", "email": {"id": "X", "opens": 2}});

        assert!(filter_matches(
            &filter(json!({"record_id": "R1", "email.id": "X"})),
            &payload
        ));
        assert!(!filter_matches(
            &filter(json!({"record_id": "R1", "email.id": "Y"})),
            &payload
        ));
        assert!(!filter_matches(&filter(json!({"record_id": "R2"})), &payload));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let payload = json!({"score": 10, "ratio": 0.5});

        assert!(filter_matches(&filter(json!({"score": 10.0})), &payload));
        assert!(filter_matches(&filter(json!({"ratio": 0.5})), &payload));
        assert!(!filter_matches(&filter(json!({"score": "10"})), &payload));
    }

    #[test]
    fn test_structured_values_compare_deeply() {
        let payload = json!({"tags": ["a", 1], "meta": {"k": 2.0}});

        assert!(filter_matches(
            &filter(json!({"tags": ["a", 1.0], "meta": {"k": 2}})),
            &payload
        ));
        assert!(!filter_matches(&filter(json!({"tags": ["a"]})), &payload));
    }
}
