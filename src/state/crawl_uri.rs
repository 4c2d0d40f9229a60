//! The crawl work item carried through the processor chain
//!
//! A `CrawlUri` is owned by exactly one worker at a time. The frontier
//! creates it, the quota gate and the fetcher mutate it in place, and the
//! frontier reads the result fields back to update statistics.
use crate::config::CredentialEntry;
use crate::recorder::Recorder;
use crate::FetchFailure;
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// Fetch status codes outside the HTTP range
pub mod status {
    /// Not yet attempted (or left untouched by a force-retire block)
    pub const UNATTEMPTED: i32 = 0;

    /// Connection refused, connect timeout, TLS failure, no/malformed response
    pub const CONNECT_FAILED: i32 = -2;

    /// Blocked by the quota gate without force-retire
    pub const BLOCKED_BY_QUOTA: i32 = -5003;

    /// Returns a short label for a status code
    pub fn describe(code: i32) -> &'static str {
        match code {
            UNATTEMPTED => "unattempted",
            CONNECT_FAILED => "connect-failed",
            BLOCKED_BY_QUOTA => "blocked-by-quota",
            100..=199 => "informational",
            200..=299 => "success",
            300..=399 => "redirect",
            400..=499 => "client-error",
            500..=599 => "server-error",
            _ => "unknown",
        }
    }
}

/// Annotation added when the overall fetch timeout cut the body short
pub const ANNOTATION_TIME_TRUNC: &str = "timeTrunc";

/// Annotation added when the length cap cut the body short
pub const ANNOTATION_LENGTH_TRUNC: &str = "lenTrunc";

/// Annotation added when the fetch-body rule declined the body
pub const ANNOTATION_MID_FETCH_ABORT: &str = "midFetchAbort";

/// HTTP authentication credential
pub type Credential = CredentialEntry;

/// Request method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FetchType {
    #[default]
    Get,
    Post,
}

impl FetchType {
    /// The method token written on the request line
    pub fn method(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One name/value pair of an outgoing form submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: String,
}

impl FormField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Validators remembered from a previous fetch of the same URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchHistory {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// Marks a response as unchanged since a prior fetch
///
/// Produced only when a conditional request was answered with 304. It holds
/// exactly the validators that were sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisitProfile {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// A parsed `WWW-Authenticate` or `Proxy-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Lowercased scheme, e.g. `basic` or `digest`
    pub scheme: String,

    /// Lowercased parameter names mapped to unquoted values
    pub params: BTreeMap<String, String>,

    /// True when the challenge came from a proxy (407)
    pub proxy: bool,
}

impl AuthChallenge {
    pub fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(String::as_str)
    }
}

/// Response headers in wire order, looked up case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value of the named header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of the named header, in wire order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One crawl work item
#[derive(Debug)]
pub struct CrawlUri {
    // ===== Identity =====
    pub uri: Url,
    pub fetch_type: FetchType,
    /// Form fields serialized as the POST body
    pub submit_data: Vec<FormField>,
    /// Queue the frontier keeps this URI in
    pub class_key: String,
    pub fetch_history: Option<FetchHistory>,

    // ===== Fetch results =====
    /// HTTP status, or one of the negative codes in [`status`]
    pub fetch_status: i32,
    pub fetch_began_time: Option<DateTime<Utc>>,
    pub fetch_duration: Duration,
    /// `None` whenever the attempt produced no usable response
    pub fetch_completed_time: Option<DateTime<Utc>>,
    /// Entity length (after de-chunking, before content decoding)
    pub content_length: u64,
    pub content_size: u64,
    /// Raw response bytes recorded, headers included
    pub recorded_size: u64,
    /// `sha1:<BASE32>` of the entity
    pub content_digest: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<&'static Encoding>,
    pub http_headers: ResponseHeaders,
    /// Challenges of the last 401/407, keyed by lowercased scheme
    pub auth_challenges: BTreeMap<String, AuthChallenge>,
    pub non_fatal_failures: Vec<FetchFailure>,
    pub annotations: Vec<String>,
    /// Credentials attached for the next attempt
    pub credentials: Vec<Credential>,
    pub revisit_profile: Option<RevisitProfile>,
    pub server_ip: Option<IpAddr>,
    pub recorder: Option<Recorder>,

    // ===== Frontier control =====
    pub force_retire: bool,
}

impl CrawlUri {
    /// Creates a GET work item whose queue is its server
    pub fn new(uri: Url) -> Self {
        let class_key = crate::url::server_key(&uri).unwrap_or_else(|| uri.to_string());
        Self {
            uri,
            fetch_type: FetchType::Get,
            submit_data: Vec::new(),
            class_key,
            fetch_history: None,
            fetch_status: status::UNATTEMPTED,
            fetch_began_time: None,
            fetch_duration: Duration::ZERO,
            fetch_completed_time: None,
            content_length: 0,
            content_size: 0,
            recorded_size: 0,
            content_digest: None,
            content_type: None,
            charset: None,
            http_headers: ResponseHeaders::new(),
            auth_challenges: BTreeMap::new(),
            non_fatal_failures: Vec::new(),
            annotations: Vec::new(),
            credentials: Vec::new(),
            revisit_profile: None,
            server_ip: None,
            recorder: None,
            force_retire: false,
        }
    }

    /// Parses `uri` and creates a GET work item
    pub fn parse(uri: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(uri)?))
    }

    /// Creates a POST work item carrying form fields
    pub fn post(uri: Url, fields: Vec<FormField>) -> Self {
        let mut curi = Self::new(uri);
        curi.fetch_type = FetchType::Post;
        curi.submit_data = fields;
        curi
    }

    pub fn with_class_key(mut self, key: impl Into<String>) -> Self {
        self.class_key = key.into();
        self
    }

    /// Clears the per-attempt result fields before a new fetch attempt
    ///
    /// Identity, fetch history, annotations and the frontier's retire flag
    /// are kept. Attached credentials and auth challenges are left for the
    /// fetcher to consume.
    pub fn reset_for_attempt(&mut self) {
        self.fetch_status = status::UNATTEMPTED;
        self.fetch_began_time = None;
        self.fetch_duration = Duration::ZERO;
        self.fetch_completed_time = None;
        self.content_length = 0;
        self.content_size = 0;
        self.recorded_size = 0;
        self.content_digest = None;
        self.content_type = None;
        self.charset = None;
        self.http_headers.clear();
        self.non_fatal_failures.clear();
        self.revisit_profile = None;
        self.server_ip = None;
        self.recorder = None;
    }

    /// First value of a response header
    pub fn http_header(&self, name: &str) -> Option<&str> {
        self.http_headers.get(name)
    }

    pub fn annotate(&mut self, annotation: impl Into<String>) {
        self.annotations.push(annotation.into());
    }

    pub fn has_annotation(&self, annotation: &str) -> bool {
        self.annotations.iter().any(|a| a == annotation)
    }

    pub fn fetch_duration_ms(&self) -> u128 {
        self.fetch_duration.as_millis()
    }

    /// Returns true for a completed 2xx or 3xx response
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.fetch_status)
    }

    /// Copies `Last-Modified` and `ETag` of the last response into the
    /// fetch history so the next attempt can be conditional
    pub fn remember_validators(&mut self) {
        let last_modified = self.http_header("last-modified").map(str::to_string);
        let etag = self.http_header("etag").map(str::to_string);
        if last_modified.is_none() && etag.is_none() {
            return;
        }
        self.fetch_history = Some(FetchHistory {
            last_modified,
            etag,
        });
    }
}

impl fmt::Display for CrawlUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.fetch_type, self.uri)
    }
}
