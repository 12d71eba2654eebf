//! Ordering of incremental-key values.
//!
//! Watermarks are persisted as text. Two values compare numerically when both
//! parse as finite numbers, lexically otherwise; fixed-width date and
//! timestamp renderings therefore order chronologically.

use std::cmp::Ordering;

use serde_json::Value;

/// Text form of a row value used as a watermark. `NULL` has none.
pub fn watermark_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub fn compare_watermarks(a: &str, b: &str) -> Ordering {
    match (parse_number(a), parse_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Replace `current` with `candidate` when the candidate is greater.
pub fn advance(current: &mut Option<String>, candidate: &Value) {
    let Some(text) = watermark_text(candidate) else {
        return;
    };
    let greater = match current.as_deref() {
        Some(existing) => compare_watermarks(&text, existing) == Ordering::Greater,
        None => true,
    };
    if greater {
        *current = Some(text);
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_watermarks("9", "10"), Ordering::Less);
        assert_eq!(compare_watermarks("10.5", "10"), Ordering::Greater);
    }

    #[test]
    fn timestamps_compare_lexically() {
        assert_eq!(
            compare_watermarks("2024-01-02 00:00:00.000000", "2024-01-10 00:00:00.000000"),
            Ordering::Less
        );
    }

    #[test]
    fn advance_keeps_maximum_and_ignores_null() {
        let mut current = None;
        for v in [json!(3), json!(null), json!(12), json!(7)] {
            advance(&mut current, &v);
        }
        assert_eq!(current.as_deref(), Some("12"));
    }

    #[test]
    fn null_has_no_watermark() {
        assert_eq!(watermark_text(&Value::Null), None);
        assert_eq!(watermark_text(&json!("a")), Some("a".to_string()));
    }
}
