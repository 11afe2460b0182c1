use tracing::debug;
use url::Url;

/// Check a command URL against the allow-list. Patterns are an exact host
/// (`etsy.com`) or a wildcard (`*.etsy.com`); both also admit subdomains.
/// Malformed URLs fail closed.
pub fn allowed(raw_url: &str, patterns: &[String]) -> bool {
    let host = match Url::parse(raw_url) {
        Ok(url) => match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => {
                debug!(target: "action-gate", url = raw_url, "url has no host, denying");
                return false;
            }
        },
        Err(err) => {
            debug!(target: "action-gate", url = raw_url, %err, "unparseable url, denying");
            return false;
        }
    };

    patterns
        .iter()
        .any(|pattern| host_matches(&host, &normalize(pattern)))
}

/// Strip scheme and trailing slash, lowercase.
fn normalize(pattern: &str) -> String {
    let pattern = pattern.trim().to_ascii_lowercase();
    let pattern = pattern
        .strip_prefix("https://")
        .or_else(|| pattern.strip_prefix("http://"))
        .unwrap_or(&pattern);
    pattern.trim_end_matches('/').to_string()
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let base = pattern.strip_prefix("*.").unwrap_or(pattern);
    if base.is_empty() {
        return false;
    }
    host == base || host.ends_with(&format!(".{base}"))
}
