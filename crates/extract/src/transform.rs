use serde_json::Value;

use tabpilot_core_types::CaptureMode;

/// Labels of the transforms bound to a new session; recorded on the session
/// for observability.
pub fn transformer_labels() -> Vec<String> {
    vec!["listings".to_string(), "reviews".to_string()]
}

/// Normalize a parsed capture body for its mode. Known envelope shapes are
/// unwrapped so downstream consumers see the payload list directly; anything
/// unrecognized passes through untouched.
pub fn transform_captured(mode: CaptureMode, json: Value) -> Value {
    let key = match mode {
        CaptureMode::Listings => "results",
        CaptureMode::Reviews => "reviews",
    };
    match json {
        Value::Object(ref obj) if obj.get(key).map_or(false, Value::is_array) => {
            obj.get(key).cloned().unwrap_or(json)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listings_envelope_is_unwrapped() {
        let body = json!({"results": [{"listing_id": 1}], "count": 1});
        let out = transform_captured(CaptureMode::Listings, body);
        assert_eq!(out, json!([{"listing_id": 1}]));
    }

    #[test]
    fn reviews_envelope_is_unwrapped() {
        let body = json!({"reviews": [{"rating": 5}]});
        let out = transform_captured(CaptureMode::Reviews, body);
        assert_eq!(out, json!([{"rating": 5}]));
    }

    #[test]
    fn unknown_shapes_pass_through() {
        let body = json!({"anything": true});
        let out = transform_captured(CaptureMode::Listings, body.clone());
        assert_eq!(out, body);
    }
}
