//! URL utilities for consistent URL handling
//!
//! Base URLs for the completion provider are normalized before endpoints are
//! appended, and MCP endpoint URLs supplied by callers are canonicalized so
//! equivalent spellings compare equal in logs, auth lookups and allow-checks.

use reqwest::Url;

/// Normalize a base URL by removing trailing slashes
///
/// This ensures consistent URL construction when appending endpoints,
/// preventing double slashes in the final URLs.
///
/// # Examples
///
/// ```
/// use chatwire::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://openrouter.ai/api/v1"), "https://openrouter.ai/api/v1");
/// assert_eq!(normalize_base_url("https://openrouter.ai/api/v1/"), "https://openrouter.ai/api/v1");
/// assert_eq!(normalize_base_url("https://openrouter.ai/api/v1///"), "https://openrouter.ai/api/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use chatwire::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://openrouter.ai/api/v1/", "/chat/completions"),
///     "https://openrouter.ai/api/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Canonicalize a caller-supplied MCP endpoint URL.
///
/// Trailing slashes are removed from the path unless the path is exactly `/`,
/// the fragment is dropped and the query string is kept. Input that does not
/// parse as an absolute URL is returned unchanged; callers that need a usable
/// endpoint should go through [`parse_mcp_url`] instead.
///
/// # Examples
///
/// ```
/// use chatwire::utils::url::canonicalize_mcp_url;
///
/// assert_eq!(canonicalize_mcp_url("https://h/a/"), "https://h/a");
/// assert_eq!(canonicalize_mcp_url("https://h/"), "https://h/");
/// assert_eq!(canonicalize_mcp_url("https://h/a/?x=1#top"), "https://h/a?x=1");
/// assert_eq!(canonicalize_mcp_url("not a url"), "not a url");
/// ```
pub fn canonicalize_mcp_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    url.set_fragment(None);
    if url.cannot_be_a_base() {
        return url.to_string();
    }

    let path = url.path();
    if path != "/" && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    url.to_string()
}

/// Canonicalize and parse an MCP endpoint, rejecting anything without a host.
pub fn parse_mcp_url(raw: &str) -> Option<Url> {
    if raw.trim().is_empty() {
        return None;
    }

    let canonical = canonicalize_mcp_url(raw.trim());
    let url = Url::parse(&canonical).ok()?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Some(url),
        _ => None,
    }
}

/// Host portion used in log fields; never includes credentials or the path.
pub fn log_host(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => "<unknown>".to_string(),
    }
}
