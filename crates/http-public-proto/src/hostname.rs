//! Host header normalization

use url::Url;

/// Parse a `Host`-style header value into a canonical hostname.
///
/// The value is treated as the authority of a synthetic `http://` URL, so the
/// port is discarded, the name is lowercased, and anything URL parsing rejects
/// (an empty value, a bare `@`, invalid characters) yields `None`.
pub fn parse_hostname(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let url = Url::parse(&format!("http://{}", value)).ok()?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Some(host.to_string()),
        _ => None,
    }
}
