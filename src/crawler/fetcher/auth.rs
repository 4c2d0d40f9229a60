//! HTTP authentication: challenge parsing, Basic and Digest responses, and
//! the credential cache shared by every task using one fetcher

use crate::state::{AuthChallenge, CrawlUri, Credential};
use crate::url::authority;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Parses `WWW-Authenticate` / `Proxy-Authenticate` values into challenges
/// keyed by lowercased scheme
///
/// A single header value may carry several challenges
/// (`Basic realm="a", Digest realm="b", nonce="n"`).
pub fn parse_challenges<'a>(
    values: impl IntoIterator<Item = &'a str>,
    proxy: bool,
) -> BTreeMap<String, AuthChallenge> {
    let mut challenges = BTreeMap::new();
    for value in values {
        for challenge in parse_header_value(value, proxy) {
            challenges.entry(challenge.scheme.clone()).or_insert(challenge);
        }
    }
    challenges
}

fn parse_header_value(value: &str, proxy: bool) -> Vec<AuthChallenge> {
    let mut challenges = Vec::new();
    let mut current: Option<AuthChallenge> = None;
    let mut rest = value.trim();

    while !rest.is_empty() {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }

        let token_end = rest
            .find(|c: char| c == '=' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        let token = &rest[..token_end];
        let after = rest[token_end..].trim_start();

        // `name=value`, but not a token68 such as `abc==`
        if after.starts_with('=') && current.is_some() && !after.starts_with("==") {
            let mut value_part = after[1..].trim_start();
            let param_value = if let Some(quoted) = value_part.strip_prefix('"') {
                let (unquoted, consumed) = read_quoted(quoted);
                value_part = &quoted[consumed..];
                unquoted
            } else {
                let end = value_part.find(',').unwrap_or(value_part.len());
                let bare = value_part[..end].trim().to_string();
                value_part = &value_part[end..];
                bare
            };
            if let Some(challenge) = current.as_mut() {
                challenge
                    .params
                    .insert(token.to_ascii_lowercase(), param_value);
            }
            rest = value_part;
            continue;
        }

        if token.is_empty() {
            // stray separator such as a lone '='
            rest = &rest[1..];
            continue;
        }

        if let Some(done) = current.take() {
            challenges.push(done);
        }
        current = Some(AuthChallenge {
            scheme: token.to_ascii_lowercase(),
            params: BTreeMap::new(),
            proxy,
        });
        rest = &rest[token_end..];
    }

    if let Some(done) = current {
        challenges.push(done);
    }
    challenges
}

/// Reads a quoted-string body (opening quote already consumed); returns the
/// unescaped text and the number of bytes consumed including the close quote
fn read_quoted(input: &str) -> (String, usize) {
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return (out, i + 1);
        } else {
            out.push(c);
        }
    }
    (out, input.len())
}

/// `Basic` authorization value for a login and password
pub fn basic_authorization(login: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", login, password)))
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Computes the RFC 2617 `response` digest
///
/// With `qop` set the `nc`/`cnonce` form is used, otherwise the RFC 2069
/// form. `algorithm` `MD5-sess` folds nonce and cnonce into HA1.
#[allow(clippy::too_many_arguments)]
pub fn digest_response(
    login: &str,
    realm: &str,
    password: &str,
    algorithm: Option<&str>,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<&str>,
) -> String {
    let mut ha1 = md5_hex(&format!("{}:{}:{}", login, realm, password));
    if algorithm.is_some_and(|a| a.eq_ignore_ascii_case("md5-sess")) {
        ha1 = md5_hex(&format!("{}:{}:{}", ha1, nonce, cnonce));
    }
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn digest_authorization(
    credential: &Credential,
    challenge: &AuthChallenge,
    method: &str,
    uri: &str,
    nonce_count: u32,
    cnonce: &str,
) -> Option<String> {
    let nonce = challenge.params.get("nonce")?;
    let realm = challenge.realm().unwrap_or(&credential.realm);
    let algorithm = challenge.params.get("algorithm").map(String::as_str);
    let qop = challenge.params.get("qop").and_then(|offered| {
        offered
            .split(',')
            .map(str::trim)
            .find(|q| q.eq_ignore_ascii_case("auth"))
    });
    let nc = format!("{:08x}", nonce_count);
    let response = digest_response(
        &credential.login,
        realm,
        &credential.password,
        algorithm,
        method,
        uri,
        nonce,
        &nc,
        cnonce,
        qop,
    );

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        credential.login, realm, nonce, uri, response
    );
    if let Some(algorithm) = algorithm {
        header.push_str(&format!(", algorithm={}", algorithm));
    }
    if let Some(opaque) = challenge.params.get("opaque") {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    if let Some(qop) = qop {
        header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
    }
    Some(header)
}

/// Where the credential sent on an attempt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthSource {
    /// Attached to the URI after a challenge on the previous attempt
    Attached,
    /// Sent up front from the accepted-credential cache
    Cached,
}

/// A credential written into the request of the current attempt
#[derive(Debug, Clone)]
pub(crate) struct SentAuth {
    pub credential: Credential,
    pub challenge: AuthChallenge,
    pub source: AuthSource,
    pub header: String,
}

#[derive(Debug, Clone)]
struct AcceptedCredential {
    credential: Credential,
    challenge: AuthChallenge,
    nonce_count: u32,
}

/// Configured credentials plus the ones servers have accepted
#[derive(Debug)]
pub(crate) struct CredentialStore {
    configured: Vec<Credential>,
    /// Keyed by (domain, realm)
    accepted: DashMap<(String, String), AcceptedCredential>,
    proxy: Option<Credential>,
    proxy_authorization: RwLock<Option<String>>,
    cnonce_counter: AtomicU64,
}

impl CredentialStore {
    pub fn new(configured: Vec<Credential>, proxy: Option<Credential>) -> Self {
        Self {
            configured,
            accepted: DashMap::new(),
            proxy,
            proxy_authorization: RwLock::new(None),
            cnonce_counter: AtomicU64::new(0),
        }
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn has_proxy_authorization(&self) -> bool {
        self.proxy_authorization.read().is_some()
    }

    fn cnonce(&self) -> String {
        let count = self.cnonce_counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        md5_hex(&format!("{}:{}", nanos, count))[..16].to_string()
    }

    fn render(
        &self,
        credential: &Credential,
        challenge: &AuthChallenge,
        method: &str,
        uri: &str,
        nonce_count: u32,
    ) -> String {
        if challenge.scheme == "digest" {
            if let Some(header) =
                digest_authorization(credential, challenge, method, uri, nonce_count, &self.cnonce())
            {
                return header;
            }
        }
        basic_authorization(&credential.login, &credential.password)
    }

    /// Picks the `Authorization` to send for an origin request
    ///
    /// A credential attached by the previous attempt wins; otherwise a
    /// credential the server accepted before for the same domain is sent
    /// without waiting for a challenge. When the previous attempt was
    /// challenged, the cached credential must belong to a challenged realm.
    pub fn authorization_for(
        &self,
        url: &Url,
        method: &str,
        request_uri: &str,
        attached: &[Credential],
        prior_challenges: &BTreeMap<String, AuthChallenge>,
    ) -> Option<SentAuth> {
        let domain = authority(url)?;

        if let Some(credential) = attached.iter().find(|c| c.domain == domain) {
            let challenge = prior_challenges
                .values()
                .filter(|ch| !ch.proxy && ch.realm() == Some(credential.realm.as_str()))
                .max_by_key(|ch| ch.scheme == "digest")
                .cloned()
                .unwrap_or_else(|| basic_challenge(&credential.realm, false));
            let header = self.render(credential, &challenge, method, request_uri, 1);
            return Some(SentAuth {
                credential: credential.clone(),
                challenge,
                source: AuthSource::Attached,
                header,
            });
        }

        // with a challenge in hand only a credential for one of its realms fits
        let realms: Vec<&str> = prior_challenges
            .values()
            .filter(|ch| !ch.proxy)
            .filter_map(AuthChallenge::realm)
            .collect();
        let mut entry = self.accepted.iter_mut().find(|e| {
            let (cached_domain, cached_realm) = e.key();
            *cached_domain == domain
                && (realms.is_empty() || realms.contains(&cached_realm.as_str()))
        })?;
        entry.nonce_count += 1;
        let accepted = entry.value().clone();
        drop(entry);
        let header = self.render(
            &accepted.credential,
            &accepted.challenge,
            method,
            request_uri,
            accepted.nonce_count,
        );
        Some(SentAuth {
            credential: accepted.credential,
            challenge: accepted.challenge,
            source: AuthSource::Cached,
            header,
        })
    }

    /// Picks the `Proxy-Authorization` to send, Basic only
    pub fn proxy_authorization_for(&self, attached: &[Credential]) -> Option<SentAuth> {
        let proxy = self.proxy.as_ref()?;
        if let Some(credential) = attached.iter().find(|c| c.domain == proxy.domain) {
            return Some(SentAuth {
                credential: credential.clone(),
                challenge: basic_challenge(&credential.realm, true),
                source: AuthSource::Attached,
                header: basic_authorization(&credential.login, &credential.password),
            });
        }
        let header = self.proxy_authorization.read().clone()?;
        Some(SentAuth {
            credential: proxy.clone(),
            challenge: basic_challenge(&proxy.realm, true),
            source: AuthSource::Cached,
            header,
        })
    }

    /// Updates challenges, attached credentials and the cache from the
    /// status of a completed response
    pub fn after_response(
        &self,
        curi: &mut CrawlUri,
        origin: Option<SentAuth>,
        proxy: Option<SentAuth>,
    ) {
        let status = curi.fetch_status;

        if status == 407 {
            let challenges =
                parse_challenges(curi.http_headers.get_all("proxy-authenticate"), true);
            curi.auth_challenges.extend(challenges);
            self.proxy_challenged(curi, proxy);
            return;
        }
        if let Some(sent) = proxy {
            self.proxy_accepted(&sent);
        }

        if status == 401 {
            let challenges =
                parse_challenges(curi.http_headers.get_all("www-authenticate"), false);
            curi.auth_challenges.extend(challenges);
            self.origin_challenged(curi, origin);
            return;
        }
        if let Some(sent) = origin {
            self.origin_accepted(sent);
        }
    }

    fn origin_challenged(&self, curi: &mut CrawlUri, sent: Option<SentAuth>) {
        if let Some(sent) = &sent {
            let key = (sent.credential.domain.clone(), sent.credential.realm.clone());
            self.accepted.remove(&key);
            if sent.source == AuthSource::Attached {
                tracing::info!(
                    "{}: credential for realm {:?} rejected",
                    curi.uri,
                    sent.credential.realm
                );
                return;
            }
        }

        let Some(domain) = authority(&curi.uri) else {
            return;
        };
        let realms: Vec<&str> = curi
            .auth_challenges
            .values()
            .filter(|ch| !ch.proxy)
            .filter_map(AuthChallenge::realm)
            .collect();
        let matching = self
            .configured
            .iter()
            .find(|c| c.domain == domain && realms.contains(&c.realm.as_str()));
        match matching {
            Some(credential) => {
                tracing::debug!("{}: attaching credential for realm {:?}", curi.uri, credential.realm);
                curi.credentials.push(credential.clone());
            }
            None => tracing::debug!("{}: no credential for realms {:?}", curi.uri, realms),
        }
    }

    fn origin_accepted(&self, sent: SentAuth) {
        let key = (sent.credential.domain.clone(), sent.credential.realm.clone());
        if sent.source == AuthSource::Attached {
            tracing::debug!("credential for {:?} accepted, caching", key);
        }
        self.accepted
            .entry(key)
            .and_modify(|accepted| accepted.challenge = sent.challenge.clone())
            .or_insert(AcceptedCredential {
                credential: sent.credential,
                challenge: sent.challenge,
                nonce_count: 1,
            });
    }

    fn proxy_challenged(&self, curi: &mut CrawlUri, sent: Option<SentAuth>) {
        if let Some(sent) = &sent {
            *self.proxy_authorization.write() = None;
            if sent.source == AuthSource::Attached {
                tracing::info!("{}: proxy credential rejected", curi.uri);
                return;
            }
        }
        let Some(proxy) = &self.proxy else {
            return;
        };
        let realm = curi
            .auth_challenges
            .values()
            .find(|ch| ch.proxy)
            .and_then(AuthChallenge::realm)
            .unwrap_or_default()
            .to_string();
        let credential = Credential {
            realm,
            ..proxy.clone()
        };
        if sent.is_none() {
            // every later request through the proxy carries it, not just this URI
            tracing::debug!("{}: proxy challenged, sending credential from now on", curi.uri);
            *self.proxy_authorization.write() =
                Some(basic_authorization(&credential.login, &credential.password));
        }
        curi.credentials.push(credential);
    }

    fn proxy_accepted(&self, sent: &SentAuth) {
        let mut cached = self.proxy_authorization.write();
        if cached.is_none() {
            tracing::debug!("proxy credential accepted, caching");
        }
        *cached = Some(sent.header.clone());
    }
}

fn basic_challenge(realm: &str, proxy: bool) -> AuthChallenge {
    let mut params = BTreeMap::new();
    params.insert("realm".to_string(), realm.to_string());
    AuthChallenge {
        scheme: "basic".to_string(),
        params,
        proxy,
    }
}
