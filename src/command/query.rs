//! Dot-path queries over JSON documents.
//!
//! A path such as `.AMIMessage.info.$` walks object keys left to right. Arrays
//! met along the way are flattened, so every element is searched, and the
//! result is the ordered list of every value reached by the final key.

use serde_json::Value;

pub fn select<'a>(path: &str, document: &'a Value) -> Vec<&'a Value> {
    let mut current: Vec<&'a Value> = vec![document];

    for key in path.split('.').filter(|key| !key.is_empty()) {
        let mut next = Vec::new();
        for node in current {
            collect_key(node, key, &mut next);
        }
        current = next;
    }

    current.into_iter().flat_map(flatten).collect()
}

/// Selects the matches of `path` that are strings.
pub fn select_strings(path: &str, document: &Value) -> Vec<String> {
    select(path, document)
        .into_iter()
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect()
}

fn collect_key<'a>(node: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match node {
        Value::Object(map) => {
            if let Some(value) = map.get(key) {
                out.push(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_key(item, key, out);
            }
        }
        _ => {}
    }
}

fn flatten(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}
