use serde::Deserialize;

/// Main configuration structure for Sumi-Fetch
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default, rename = "credential")]
    pub credentials: Vec<CredentialEntry>,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Maximum number of queues fetched concurrently
    #[serde(rename = "max-concurrent-queues")]
    pub max_concurrent_queues: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queues: 8,
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,

    /// User-Agent template; `{name}`, `{version}`, `{contact-url}` and
    /// `{contact-email}` are substituted
    #[serde(default)]
    pub template: Option<String>,
}

/// Default template: `CrawlerName/Version (+ContactURL; ContactEmail)`
pub const DEFAULT_USER_AGENT_TEMPLATE: &str = "{name}/{version} (+{contact-url}; {contact-email})";

impl UserAgentConfig {
    /// Expands the template into the User-Agent header value
    pub fn user_agent(&self) -> String {
        self.template
            .as_deref()
            .unwrap_or(DEFAULT_USER_AGENT_TEMPLATE)
            .replace("{name}", &self.crawler_name)
            .replace("{version}", &self.crawler_version)
            .replace("{contact-url}", &self.contact_url)
            .replace("{contact-email}", &self.contact_email)
    }
}

/// Certificate validation strictness for HTTPS fetches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslTrustLevel {
    /// Accept any certificate
    #[default]
    Open,
    /// Standard chain and hostname validation against the webpki roots
    Normal,
}

/// How the Host header is written for scheme-default ports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostHeaderPolicy {
    /// `Host: example.com` for port 80 on http and 443 on https
    #[default]
    OmitDefaultPort,
    /// Always `Host: example.com:port`
    AlwaysIncludePort,
}

/// HTTP fetch engine options
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FetchConfig {
    /// Literal Accept header lines; replaces the default Accept header
    pub accept_headers: Option<Vec<String>>,

    /// Disable the cookie store entirely
    pub ignore_cookies: bool,

    /// Send `Accept-Encoding: gzip,deflate` and decode compressed content
    pub accept_compression: bool,

    /// Local address the outbound socket binds to
    pub http_bind_address: Option<String>,

    pub http_proxy_host: Option<String>,
    pub http_proxy_port: Option<u16>,
    pub http_proxy_user: Option<String>,
    pub http_proxy_password: Option<String>,

    pub socks_proxy_host: Option<String>,
    pub socks_proxy_port: Option<u16>,

    /// Use HTTP/1.1 on the request line instead of HTTP/1.0
    pub use_http11: bool,

    /// Send `Connection: close` (`Proxy-Connection: close` through a proxy)
    pub send_connection_close: bool,

    /// Bandwidth cap in KB/sec; 0 means unlimited
    pub max_fetch_kb_sec: u64,

    /// Response byte cap; 0 means unlimited
    pub max_length_bytes: u64,

    /// Send a Range header matching `max_length_bytes`
    pub send_range: bool,

    pub send_if_modified_since: bool,
    pub send_if_none_match: bool,

    /// Only read bodies whose Content-Type starts with one of these prefixes
    pub fetch_body_content_types: Option<Vec<String>>,

    /// Overall time budget for one fetch attempt
    pub timeout_seconds: u64,

    /// Connect timeout and per-read socket timeout
    pub so_timeout_ms: u64,

    pub ssl_trust_level: SslTrustLevel,

    /// Charset used when the response does not name a usable one
    pub default_charset: String,

    pub host_header: HostHeaderPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            accept_headers: None,
            ignore_cookies: false,
            accept_compression: false,
            http_bind_address: None,
            http_proxy_host: None,
            http_proxy_port: None,
            http_proxy_user: None,
            http_proxy_password: None,
            socks_proxy_host: None,
            socks_proxy_port: None,
            use_http11: false,
            send_connection_close: true,
            max_fetch_kb_sec: 0,
            max_length_bytes: 0,
            send_range: false,
            send_if_modified_since: true,
            send_if_none_match: true,
            fetch_body_content_types: None,
            timeout_seconds: 20 * 60,
            so_timeout_ms: 20_000,
            ssl_trust_level: SslTrustLevel::Open,
            default_charset: "latin1".to_string(),
            host_header: HostHeaderPolicy::OmitDefaultPort,
        }
    }
}

fn unlimited() -> i64 {
    -1
}

fn force_retire_default() -> bool {
    true
}

/// Quota ceilings per scope and metric; any value below zero is unlimited
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaConfig {
    #[serde(default = "unlimited")]
    pub server_max_fetch_successes: i64,
    #[serde(default = "unlimited")]
    pub server_max_success_kb: i64,
    #[serde(default = "unlimited")]
    pub server_max_fetch_responses: i64,
    #[serde(default = "unlimited")]
    pub server_max_all_kb: i64,
    #[serde(default = "unlimited")]
    pub server_max_novel_kb: i64,
    #[serde(default = "unlimited")]
    pub server_max_novel_urls: i64,

    #[serde(default = "unlimited")]
    pub host_max_fetch_successes: i64,
    #[serde(default = "unlimited")]
    pub host_max_success_kb: i64,
    #[serde(default = "unlimited")]
    pub host_max_fetch_responses: i64,
    #[serde(default = "unlimited")]
    pub host_max_all_kb: i64,
    #[serde(default = "unlimited")]
    pub host_max_novel_kb: i64,
    #[serde(default = "unlimited")]
    pub host_max_novel_urls: i64,

    #[serde(default = "unlimited")]
    pub group_max_fetch_successes: i64,
    #[serde(default = "unlimited")]
    pub group_max_success_kb: i64,
    #[serde(default = "unlimited")]
    pub group_max_fetch_responses: i64,
    #[serde(default = "unlimited")]
    pub group_max_all_kb: i64,
    #[serde(default = "unlimited")]
    pub group_max_novel_kb: i64,
    #[serde(default = "unlimited")]
    pub group_max_novel_urls: i64,

    /// Retire the URI's whole queue on a violation instead of failing the URI
    #[serde(default = "force_retire_default")]
    pub force_retire: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            server_max_fetch_successes: -1,
            server_max_success_kb: -1,
            server_max_fetch_responses: -1,
            server_max_all_kb: -1,
            server_max_novel_kb: -1,
            server_max_novel_urls: -1,
            host_max_fetch_successes: -1,
            host_max_success_kb: -1,
            host_max_fetch_responses: -1,
            host_max_all_kb: -1,
            host_max_novel_kb: -1,
            host_max_novel_urls: -1,
            group_max_fetch_successes: -1,
            group_max_success_kb: -1,
            group_max_fetch_responses: -1,
            group_max_all_kb: -1,
            group_max_novel_kb: -1,
            group_max_novel_urls: -1,
            force_retire: true,
        }
    }
}

/// HTTP authentication credential (Basic or Digest)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct CredentialEntry {
    /// Authority the credential applies to, e.g. `example.com:8080`
    pub domain: String,

    /// Realm the server announces in its challenge
    pub realm: String,

    pub login: String,

    pub password: String,
}
