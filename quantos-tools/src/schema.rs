//! Minimal JSON-schema check for tool arguments: presence of `required`
//! keys and primitive `type` agreement per declared property. This is the
//! full extent of what the registry's tools declare.

pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Ok(());
    }
    let Some(args) = arguments.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !args.contains_key(key) {
                return Err(format!("missing required argument: {key}"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (key, value) in args {
        let Some(declared) = properties.get(key) else {
            continue;
        };
        let Some(expected) = declared.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let matches = match expected {
            "string" => value.is_string(),
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(format!("argument {key} must have type {expected}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        validate_arguments(&schema(), &json!({ "path": "a.py", "limit": 5 }))
            .expect("valid arguments");
    }

    #[test]
    fn rejects_missing_required_key() {
        let err = validate_arguments(&schema(), &json!({ "limit": 5 })).unwrap_err();
        assert!(err.contains("path"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = validate_arguments(&schema(), &json!({ "path": 42 })).unwrap_err();
        assert!(err.contains("string"));
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = validate_arguments(&schema(), &json!("just a string")).unwrap_err();
        assert!(err.contains("object"));
    }
}
