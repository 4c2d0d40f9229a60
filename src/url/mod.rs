//! URL handling module for Sumi-Fetch
//!
//! Scope keys for the server cache and the request-target and Host header
//! forms written on the wire.

mod domain;

use crate::config::HostHeaderPolicy;
use url::Url;

// Re-export main functions
pub use domain::{authority, extract_domain, server_key};

/// Returns true for the schemes the fetch engine speaks
pub fn is_http_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Formats the request target for the request line
///
/// Origin form (`/path?query`) for direct connections and tunnels, absolute
/// form (`http://host:port/path?query`) when talking to an HTTP proxy. The
/// fragment is never sent. Path and query keep whatever escaping the URL
/// parser left in place, so lax escapes such as `/99%` pass through.
pub fn request_target(url: &Url, absolute: bool) -> String {
    if absolute {
        let mut target = url.clone();
        target.set_fragment(None);
        return target.to_string();
    }

    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Formats the Host header value
pub fn host_header(url: &Url, policy: HostHeaderPolicy) -> String {
    let host = url.host_str().unwrap_or_default();
    match (policy, url.port()) {
        (_, Some(port)) => format!("{}:{}", host, port),
        (HostHeaderPolicy::OmitDefaultPort, None) => host.to_string(),
        (HostHeaderPolicy::AlwaysIncludePort, None) => {
            let port = url.port_or_known_default().unwrap_or(80);
            format!("{}:{}", host, port)
        }
    }
}
