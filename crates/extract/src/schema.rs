use serde_json::Value;

/// Check an extracted record against the listing schema before it is
/// streamed: a listing needs an identity, a title and a URL; everything
/// else (pricing, ratings, seller) is optional.
pub fn validate_listing(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let has_id = has_nonempty_string(obj.get("listing_id"))
        || obj.get("listing_id").map_or(false, Value::is_number);
    has_id && has_nonempty_string(obj.get("title")) && has_nonempty_string(obj.get("url"))
}

fn has_nonempty_string(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}
