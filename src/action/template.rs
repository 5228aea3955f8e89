//! `{{path}}` placeholders in action parameters.
//!
//! A parameter like `{{data.directory}}/{{data.filename}}` is resolved
//! against the current data item. A placeholder pointing at a missing value
//! makes the whole parameter unresolvable.

use serde_json::Value;

use crate::model::DataItem;

/// Resolves every placeholder in `template`, or returns `None` if one misses.
pub fn resolve(template: &str, item: &DataItem) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        out.push_str(&render(item.lookup(path)?)?);
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Some(out)
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> DataItem {
        serde_json::from_value(json!({
            "data": {"filename": "a.txt", "directory": "/in", "size": 12, "flag": true}
        }))
        .unwrap()
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(resolve("/static/path", &item()).as_deref(), Some("/static/path"));
    }

    #[test]
    fn placeholders_are_substituted() {
        assert_eq!(
            resolve("{{data.directory}}/{{ data.filename }}", &item()).as_deref(),
            Some("/in/a.txt")
        );
        assert_eq!(
            resolve("size={{data.size}} flag={{data.flag}}", &item()).as_deref(),
            Some("size=12 flag=true")
        );
    }

    #[test]
    fn missing_value_is_unresolvable() {
        assert_eq!(resolve("{{data.missing}}", &item()), None);
    }

    #[test]
    fn unterminated_placeholder_is_kept_verbatim() {
        assert_eq!(resolve("x{{data.filename", &item()).as_deref(), Some("x{{data.filename"));
    }
}
