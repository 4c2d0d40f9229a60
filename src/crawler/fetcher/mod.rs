//! HTTP fetch engine
//!
//! This module performs one fetch attempt per call, including:
//! - Connecting directly, through an HTTP proxy or through SOCKS5
//! - TLS at the configured trust level
//! - Writing the request and recording every byte read back
//! - Enforcing timeouts, the length cap and the bandwidth limit
//! - Charset resolution, cookies, authentication and revisit detection
//!
//! Nothing the remote side does makes `fetch` fail: every outcome is
//! written into the [`CrawlUri`].

mod auth;
mod connect;
mod cookies;
mod request;
mod response;

pub use auth::{basic_authorization, digest_response, parse_challenges};
pub use request::{form_body, DEFAULT_ACCEPT};

use crate::config::{Config, FetchConfig};
use crate::crawler::{ProcessResult, Processor};
use crate::recorder::Recorder;
use crate::state::{
    status, AuthChallenge, CrawlUri, Credential, RevisitProfile, ANNOTATION_LENGTH_TRUNC,
    ANNOTATION_MID_FETCH_ABORT, ANNOTATION_TIME_TRUNC,
};
use crate::url::{host_header, is_http_scheme, request_target};
use crate::{ConfigError, FetchFailure, Result};
use async_trait::async_trait;
use auth::{CredentialStore, SentAuth};
use chrono::Utc;
use connect::{Connected, Connector, Route};
use cookies::CookieJar;
use encoding_rs::Encoding;
use request::RequestSpec;
use response::{framing, read_body, read_head, resolve_charset, Framing, ReadBudget};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};

/// Prefix of the annotation recorded for an unrecognized charset
pub const ANNOTATION_UNSATISFIABLE_CHARSET: &str = "unsatisfiableCharsetInHeader:";

/// Decides, once headers are in, whether the body is read at all
#[derive(Clone, Default)]
pub enum FetchBodyRule {
    #[default]
    AcceptAll,
    RejectAll,
    /// Read the body only when the Content-Type starts with one of these
    /// prefixes (case-insensitive); a missing Content-Type never matches
    ContentTypePrefixes(Vec<String>),
    Custom(Arc<dyn Fn(&CrawlUri) -> bool + Send + Sync>),
}

impl FetchBodyRule {
    pub fn should_fetch_body(&self, curi: &CrawlUri) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::RejectAll => false,
            Self::ContentTypePrefixes(prefixes) => {
                let Some(content_type) = curi.content_type.as_deref() else {
                    return false;
                };
                let content_type = content_type.to_ascii_lowercase();
                prefixes
                    .iter()
                    .any(|p| content_type.starts_with(&p.to_ascii_lowercase()))
            }
            Self::Custom(rule) => rule(curi),
        }
    }
}

impl fmt::Debug for FetchBodyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => f.write_str("AcceptAll"),
            Self::RejectAll => f.write_str("RejectAll"),
            Self::ContentTypePrefixes(p) => f.debug_tuple("ContentTypePrefixes").field(p).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Builder for [`FetchHttp`]
pub struct FetchHttpBuilder {
    fetch: FetchConfig,
    user_agent: String,
    credentials: Vec<Credential>,
    body_rule: Option<FetchBodyRule>,
}

impl FetchHttpBuilder {
    pub fn fetch_config(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credentials.push(credential);
        self
    }

    pub fn body_rule(mut self, rule: FetchBodyRule) -> Self {
        self.body_rule = Some(rule);
        self
    }

    pub fn build(self) -> Result<FetchHttp> {
        let default_charset = Encoding::for_label(self.fetch.default_charset.as_bytes())
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "unknown default charset: {}",
                    self.fetch.default_charset
                ))
            })?;

        let body_rule = match (self.body_rule, &self.fetch.fetch_body_content_types) {
            (Some(rule), _) => rule,
            (None, Some(prefixes)) => FetchBodyRule::ContentTypePrefixes(prefixes.clone()),
            (None, None) => FetchBodyRule::AcceptAll,
        };

        let connector = Connector::new(&self.fetch)?;
        let proxy_credential = match (connector.route(), &self.fetch.http_proxy_user) {
            (Route::HttpProxy { host, port }, Some(user)) => Some(Credential {
                domain: format!("{}:{}", host, port),
                realm: String::new(),
                login: user.clone(),
                password: self.fetch.http_proxy_password.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        let cookies = (!self.fetch.ignore_cookies).then(CookieJar::new);

        Ok(FetchHttp {
            credentials: CredentialStore::new(self.credentials, proxy_credential),
            cookies,
            connector,
            default_charset,
            body_rule,
            user_agent: self.user_agent,
            config: self.fetch,
        })
    }
}

/// The HTTP fetch engine
///
/// One instance is shared by every worker; its cookie jar and credential
/// cache are the only state carried from one fetch to the next.
pub struct FetchHttp {
    config: FetchConfig,
    user_agent: String,
    connector: Connector,
    credentials: CredentialStore,
    cookies: Option<CookieJar>,
    default_charset: &'static Encoding,
    body_rule: FetchBodyRule,
}

/// The credentials written into one attempt's request
struct SentCredentials {
    origin: Option<SentAuth>,
    proxy: Option<SentAuth>,
}

impl FetchHttp {
    /// Creates the engine from a loaded configuration
    ///
    /// # Arguments
    ///
    /// * `config` - The full configuration; `[fetch]`, `[user-agent]` and
    ///   `[[credential]]` are used
    ///
    /// # Returns
    ///
    /// * `Ok(FetchHttp)` - Ready to fetch
    /// * `Err(FetchError)` - Bad bind address, charset or TLS setup
    pub fn new(config: &Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: &Config) -> FetchHttpBuilder {
        FetchHttpBuilder {
            fetch: config.fetch.clone(),
            user_agent: config.user_agent.user_agent(),
            credentials: config.credentials.clone(),
            body_rule: None,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Number of unexpired cookies in the jar
    pub fn cookie_count(&self) -> usize {
        self.cookies.as_ref().map(CookieJar::len).unwrap_or(0)
    }

    /// Number of credentials servers have accepted so far
    pub fn accepted_credential_count(&self) -> usize {
        self.credentials.accepted_count()
    }

    pub fn has_proxy_authorization(&self) -> bool {
        self.credentials.has_proxy_authorization()
    }

    /// Performs one fetch attempt and writes the outcome into `curi`
    ///
    /// Credentials attached by the previous attempt's challenge are sent
    /// and then consumed. A 401 or 407 answered with a usable credential
    /// leaves that credential attached; the caller decides whether to retry.
    pub async fn fetch(&self, curi: &mut CrawlUri) {
        if !is_http_scheme(&curi.uri) {
            tracing::debug!("{}: not an http(s) URI, skipping", curi.uri);
            return;
        }

        let attached = std::mem::take(&mut curi.credentials);
        let prior_challenges = std::mem::take(&mut curi.auth_challenges);
        curi.reset_for_attempt();

        let started = Instant::now();
        curi.fetch_began_time = Some(Utc::now());
        let mut recorder = Recorder::new();
        recorder.set_charset(self.default_charset);

        tracing::debug!("{}: fetch attempt started", curi);
        let result = self
            .attempt(curi, &mut recorder, &attached, &prior_challenges, started)
            .await;

        curi.fetch_duration = started.elapsed();
        curi.recorded_size = recorder.recorded_input_size();
        match result {
            Ok(()) => {
                curi.fetch_completed_time = Some(Utc::now());
                tracing::info!(
                    "{}: {} {} bytes in {}ms",
                    curi.uri,
                    curi.fetch_status,
                    curi.content_size,
                    curi.fetch_duration_ms()
                );
            }
            Err(failure) => {
                tracing::warn!("{}: {}", curi.uri, failure);
                curi.fetch_status = status::CONNECT_FAILED;
                curi.fetch_completed_time = None;
                curi.non_fatal_failures.push(failure);
            }
        }
        curi.recorder = Some(recorder);
    }

    async fn attempt(
        &self,
        curi: &mut CrawlUri,
        recorder: &mut Recorder,
        attached: &[Credential],
        prior_challenges: &BTreeMap<String, AuthChallenge>,
        started: Instant,
    ) -> std::result::Result<(), FetchFailure> {
        let proxy_auth = match self.connector.route() {
            Route::HttpProxy { .. } => self.credentials.proxy_authorization_for(attached),
            _ => None,
        };

        let connected = self
            .connector
            .connect(
                &curi.uri,
                proxy_auth.as_ref().map(|a| a.header.as_str()),
                &mut curi.server_ip,
            )
            .await?;
        let mut connection = match connected {
            Connected::Open(connection) => connection,
            Connected::ProxyAuthRequired(head) => {
                tracing::debug!("{}: proxy wants credentials for the tunnel", curi.uri);
                curi.fetch_status = i32::from(head.status);
                curi.http_headers = head.headers;
                self.credentials.after_response(curi, None, proxy_auth);
                return Ok(());
            }
        };
        tracing::debug!("{}: connected ({:?})", curi.uri, curi.server_ip);

        let target = request_target(&curi.uri, connection.absolute_form);
        let method = curi.fetch_type.method();
        let origin_auth = self.credentials.authorization_for(
            &curi.uri,
            method,
            &target,
            attached,
            prior_challenges,
        );
        let sent = SentCredentials {
            origin: origin_auth,
            proxy: proxy_auth,
        };

        let history = curi.fetch_history.clone().unwrap_or_default();
        let if_modified_since = history
            .last_modified
            .as_deref()
            .filter(|_| self.config.send_if_modified_since);
        let if_none_match = history
            .etag
            .as_deref()
            .filter(|_| self.config.send_if_none_match);

        let close_header = match (self.config.send_connection_close, connection.via_proxy) {
            (false, _) => None,
            (true, true) => Some("Proxy-Connection"),
            (true, false) => Some("Connection"),
        };
        let range_end = (self.config.send_range && self.config.max_length_bytes > 0)
            .then(|| self.config.max_length_bytes - 1);

        let request = RequestSpec {
            method,
            target,
            http11: self.config.use_http11,
            host: host_header(&curi.uri, self.config.host_header),
            user_agent: &self.user_agent,
            close_header,
            accept_lines: self.config.accept_headers.as_deref(),
            accept_compression: self.config.accept_compression,
            range_end,
            if_modified_since,
            if_none_match,
            cookie: self.cookies.as_ref().and_then(|jar| jar.header_for(&curi.uri)),
            authorization: sent.origin.as_ref().map(|a| a.header.as_str()),
            proxy_authorization: sent
                .proxy
                .as_ref()
                .filter(|_| connection.via_proxy)
                .map(|a| a.header.as_str()),
            form_body: request::body_for(curi.fetch_type, &curi.submit_data),
        };
        let bytes = request.render();
        recorder.record_output(&bytes);

        let socket_timeout = Duration::from_millis(self.config.so_timeout_ms);
        let peer = curi.uri.to_string();
        let write = async {
            connection.stream.write_all(&bytes).await?;
            connection.stream.flush().await
        };
        timeout(socket_timeout, write)
            .await
            .map_err(|_| FetchFailure::ResponseTimeout {
                target: peer.clone(),
            })??;

        let deadline = started + Duration::from_secs(self.config.timeout_seconds);
        let budget = ReadBudget::new(
            socket_timeout,
            deadline,
            self.config.max_length_bytes,
            self.config.max_fetch_kb_sec,
        );
        let head = read_head(&mut connection.stream, recorder, &budget, &peer).await?;
        tracing::debug!("{}: {} {}", curi.uri, head.status, head.reason);

        curi.fetch_status = i32::from(head.status);
        curi.http_headers = head.headers.clone();
        curi.content_type = curi.http_header("content-type").map(str::to_string);

        let (charset, unsatisfiable) =
            resolve_charset(curi.content_type.as_deref(), self.default_charset);
        if let Some(value) = unsatisfiable {
            curi.annotate(format!("{}{}", ANNOTATION_UNSATISFIABLE_CHARSET, value));
        }
        curi.charset = Some(charset);
        recorder.set_charset(charset);

        let body_framing = framing(&head);
        recorder.set_chunked(body_framing == Framing::Chunked);
        let content_encoding = curi
            .http_header("content-encoding")
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty() && e != "identity");
        recorder.set_content_encoding(content_encoding);

        if let Some(jar) = &self.cookies {
            jar.store_response_cookies(&curi.uri, curi.http_headers.get_all("set-cookie"));
        }

        if body_framing != Framing::Empty && !self.body_rule.should_fetch_body(curi) {
            tracing::debug!("{}: body declined, aborting after headers", curi.uri);
            recorder.truncate_to_message_body_begin();
            curi.annotate(ANNOTATION_MID_FETCH_ABORT);
        } else {
            let outcome = read_body(
                &mut connection.stream,
                recorder,
                &budget,
                body_framing,
                head.header_len,
            )
            .await;
            if outcome.time_truncated {
                tracing::debug!("{}: body cut short by timeout", curi.uri);
                curi.annotate(ANNOTATION_TIME_TRUNC);
            }
            if outcome.length_truncated {
                tracing::debug!("{}: body cut short by length cap", curi.uri);
                curi.annotate(ANNOTATION_LENGTH_TRUNC);
            }
            if let Some(e) = outcome.error {
                return Err(FetchFailure::Io(e));
            }
        }
        drop(connection);

        curi.content_size = recorder.recorded_input_size();
        match recorder.entity() {
            Ok(entity) => {
                curi.content_length = entity.len() as u64;
                curi.content_digest = Some(format!(
                    "sha1:{}",
                    data_encoding::BASE32.encode(&Sha1::digest(&entity))
                ));
            }
            Err(e) => {
                tracing::debug!("{}: entity not recoverable: {}", curi.uri, e);
                curi.content_length = recorder.message_body().len() as u64;
                curi.non_fatal_failures.push(FetchFailure::ContentDecoding(e));
            }
        }

        if curi.fetch_status == 304 && (if_modified_since.is_some() || if_none_match.is_some()) {
            curi.revisit_profile = Some(RevisitProfile {
                last_modified: if_modified_since.map(str::to_string),
                etag: if_none_match.map(str::to_string),
            });
        }

        self.credentials.after_response(curi, sent.origin, sent.proxy);
        Ok(())
    }
}

#[async_trait]
impl Processor for FetchHttp {
    fn name(&self) -> &str {
        "fetch-http"
    }

    fn should_process(&self, curi: &CrawlUri) -> bool {
        is_http_scheme(&curi.uri)
    }

    async fn process(&self, curi: &mut CrawlUri) -> ProcessResult {
        self.fetch(curi).await;
        ProcessResult::Proceed
    }
}
