use serde_json::Value;

/// Deep merge of job-agent configuration.
///
/// `base` (the agent's defaults) provides values; `overlay` (the deployment's
/// overrides) wins on conflicts. Objects merge key by key; any other value,
/// arrays included, is replaced whole. A `null` overlay leaves the base alone.
pub fn merge_config(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let value = match base_map.get(key) {
                    Some(base_value) => merge_config(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_wins_on_conflicts_but_keeps_siblings() {
        let base = json!({"image": "runner:1", "env": {"A": "1", "B": "2"}});
        let overlay = json!({"env": {"B": "override", "C": "3"}});
        assert_eq!(
            merge_config(&base, &overlay),
            json!({"image": "runner:1", "env": {"A": "1", "B": "override", "C": "3"}})
        );
    }

    #[test]
    fn arrays_are_replaced() {
        let base = json!({"args": ["a", "b"]});
        let overlay = json!({"args": ["c"]});
        assert_eq!(merge_config(&base, &overlay), json!({"args": ["c"]}));
    }

    #[test]
    fn null_overlay_keeps_base() {
        let base = json!({"url": "http://agent"});
        assert_eq!(merge_config(&base, &Value::Null), base);
    }
}
