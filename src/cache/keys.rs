//! Response cache key derivation.
//!
//! Keys are plain strings: `METHOD:path`, optionally followed by `?` and the
//! varied query parameters form-encoded in sorted name order. The function is
//! pure, so identical method, path and varied parameters always produce the
//! same key.

use axum::http::Method;
use url::form_urlencoded;

use super::policy::CachePolicy;

/// Derive the response cache key for a request.
///
/// Only query parameters named by `policy` participate; without a policy the
/// key varies by method and path alone. A varied parameter that is absent is
/// left out of the key, which keeps it distinct from one that is present but
/// empty.
pub fn derive_key(
    method: &Method,
    path: &str,
    query: Option<&str>,
    policy: Option<&CachePolicy>,
) -> String {
    let mut key = String::with_capacity(method.as_str().len() + path.len() + 1);
    key.push_str(method.as_str());
    key.push(':');
    key.push_str(path);

    let Some(policy) = policy else {
        return key;
    };
    if policy.vary_by_query_keys().is_empty() {
        return key;
    }

    let mut params: Vec<(String, String)> = form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .map(|(name, value)| (name.to_ascii_lowercase(), value.into_owned()))
        .filter(|(name, _)| policy.varies_by(name))
        .collect();
    if params.is_empty() {
        return key;
    }

    // Stable sort keeps repeated values of one parameter in request order.
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in &params {
        serializer.append_pair(name, value);
    }

    key.push('?');
    key.push_str(&serializer.finish());
    key
}

/// Path component of a key produced by [`derive_key`].
pub fn key_path(key: &str) -> &str {
    let rest = key.split_once(':').map_or(key, |(_, rest)| rest);
    rest.split_once('?').map_or(rest, |(path, _)| path)
}
