use url::Url;

/// Extracts the host of a URL, lowercased
///
/// This is the key of the host scope used by the server cache and quotas.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_fetch::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM:8443/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Returns the `host:port` key of the server scope
///
/// The port is always present, filled in from the scheme default when the
/// URL omits it, so `http://a/` and `http://a:80/` share one server.
pub fn server_key(url: &Url) -> Option<String> {
    let host = extract_domain(url)?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

/// Returns the authority as written for credential matching
///
/// The port appears only when it differs from the scheme default,
/// e.g. `example.com` or `localhost:7777`.
pub fn authority(url: &Url) -> Option<String> {
    let host = extract_domain(url)?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}
