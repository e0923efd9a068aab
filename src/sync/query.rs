use serde_json::Value;

/// Render `data` as a bracketed query string: `{a: {b: [1]}, q: "x y"}`
/// becomes `a[b][0]=1&q=x%20y&`. Every pair ends with `&`; null renders
/// nothing and empty containers contribute no pairs.
pub fn query_string(data: &Value) -> String {
    let mut out = String::new();
    encode_into(&mut out, data, "");
    out
}

fn encode_into(out: &mut String, value: &Value, prefix: &str) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                encode_into(out, child, &nest(prefix, key));
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                encode_into(out, child, &nest(prefix, &index.to_string()));
            }
        }
        Value::String(s) => push_pair(out, prefix, s),
        other => push_pair(out, prefix, &other.to_string()),
    }
}

fn nest(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}[{}]", prefix, key)
    }
}

fn push_pair(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(&urlencoding::encode(value));
    out.push('&');
}
